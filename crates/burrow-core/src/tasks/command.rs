//! Running external programs without blocking the scheduler.
//!
//! The child's output pipes are polled with a short timeout on every step
//! instead of being read with blocking calls. Input for the child is written
//! the same way, a pipe-full at a time. Standard error is forwarded line by
//! line to the notifier; standard output can be captured.

use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::rc::Rc;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};
use crate::task::{Step, Task, TaskContext, TaskId};

const READ_CHUNK: usize = 8 * 1024;

/// How a [`CommandTask`] runs its program.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Discard standard error instead of reporting it.
    pub silent: bool,
    /// Keep standard output, see [`CommandOutput::stdout`].
    pub read: bool,
    /// Text written to the program's standard input.
    pub input: Option<String>,
    /// Terminate the program when paused instead of stopping it.
    pub kill_on_pause: bool,
    /// Working directory.
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Captured {
    stdout: Vec<u8>,
    status: Option<ExitStatus>,
}

/// Shared view of a command's results, valid after the task is gone.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput(Rc<RefCell<Captured>>);

impl CommandOutput {
    /// Captured standard output; empty unless [`CommandOptions::read`] was set.
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow().stdout).into_owned()
    }

    /// Exit code once the program has ended; `None` while running or if killed.
    pub fn exit_code(&self) -> Option<i32> {
        self.0.borrow().status.and_then(|s| s.code())
    }

    pub fn is_finished(&self) -> bool {
        self.0.borrow().status.is_some()
    }
}

/// One output pipe of the child.
struct Pipe<R> {
    reader: R,
    open: bool,
}

impl<R: Read + AsRawFd> Pipe<R> {
    fn new(reader: R) -> Self {
        Self { reader, open: true }
    }

    fn fd(&self) -> Option<RawFd> {
        self.open.then(|| self.reader.as_raw_fd())
    }

    /// Reads whatever is available into `buf`; closes the pipe on EOF.
    fn drain_into(&mut self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.reader.read(&mut chunk)?;
        if n == 0 {
            self.open = false;
        } else {
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }
}

/// Input still to be written to the child.
struct Feed {
    stdin: ChildStdin,
    data: Vec<u8>,
    written: usize,
}

impl Feed {
    fn new(stdin: ChildStdin, data: Vec<u8>) -> std::io::Result<Self> {
        set_nonblocking(stdin.as_raw_fd())?;
        Ok(Self {
            stdin,
            data,
            written: 0,
        })
    }

    fn fd(&self) -> RawFd {
        self.stdin.as_raw_fd()
    }

    fn is_done(&self) -> bool {
        self.written >= self.data.len()
    }

    /// Writes as much as the pipe accepts. Returns `true` once nothing is
    /// left to write, including when the child closed its end.
    fn write_some(&mut self) -> std::io::Result<bool> {
        match self.stdin.write(&self.data[self.written..]) {
            Ok(n) => {
                self.written += n;
                Ok(self.is_done())
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(false)
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe || e.raw_os_error() == Some(libc::EINVAL) => {
                tracing::debug!("child closed stdin after {} bytes: {e}", self.written);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL on an fd we own have no memory-safety preconditions.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Stdin,
    Stdout,
    Stderr,
}

/// Runs a program as a scheduler task.
pub struct CommandTask {
    id: TaskId,
    program: String,
    args: Vec<String>,
    options: CommandOptions,
    poll_timeout: Duration,
    child: Option<Child>,
    stdin: Option<Feed>,
    stdout: Option<Pipe<ChildStdout>>,
    stderr: Option<Pipe<ChildStderr>>,
    stderr_buf: Vec<u8>,
    output: CommandOutput,
    paused: bool,
    killed: bool,
    finished: bool,
}

impl CommandTask {
    pub fn new(program: impl Into<String>, args: Vec<String>, options: CommandOptions) -> Self {
        Self {
            id: TaskId::next(),
            program: program.into(),
            args,
            options,
            poll_timeout: Duration::from_millis(10),
            child: None,
            stdin: None,
            stdout: None,
            stderr: None,
            stderr_buf: Vec::new(),
            output: CommandOutput::default(),
            paused: false,
            killed: false,
            finished: false,
        }
    }

    /// How long a single step may wait for output.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Handle to the results, to keep after handing the task to the scheduler.
    pub fn output(&self) -> CommandOutput {
        self.output.clone()
    }

    fn spawn(&mut self) -> CoreResult<()> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if self.options.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(if self.options.silent {
                Stdio::null()
            } else {
                Stdio::piped()
            });
        if let Some(cwd) = &self.options.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| CoreError::Spawn(format!("{}: {e}", self.program)))?;
        tracing::debug!("spawned {} (pid {})", self.program, child.id());

        if let (Some(input), Some(stdin)) = (&self.options.input, child.stdin.take()) {
            if !input.is_empty() {
                self.stdin = Some(Feed::new(stdin, input.clone().into_bytes())?);
            }
        }
        self.stdout = child.stdout.take().map(Pipe::new);
        self.stderr = child.stderr.take().map(Pipe::new);
        self.child = Some(child);
        Ok(())
    }

    /// Waits up to the poll timeout for the child's pipes, then reads what
    /// arrived and writes pending input.
    fn poll_output(&mut self) -> CoreResult<()> {
        let sources: Vec<(Source, RawFd, libc::c_short)> = [
            self.stdin.as_ref().map(|f| (Source::Stdin, f.fd(), libc::POLLOUT)),
            self.stdout
                .as_ref()
                .and_then(Pipe::fd)
                .map(|fd| (Source::Stdout, fd, libc::POLLIN)),
            self.stderr
                .as_ref()
                .and_then(Pipe::fd)
                .map(|fd| (Source::Stderr, fd, libc::POLLIN)),
        ]
        .into_iter()
        .flatten()
        .collect();
        if sources.is_empty() {
            return Ok(());
        }

        let mut pollfds: Vec<libc::pollfd> = sources
            .iter()
            .map(|&(_, fd, events)| libc::pollfd {
                fd,
                events,
                revents: 0,
            })
            .collect();
        let timeout = i32::try_from(self.poll_timeout.as_millis()).unwrap_or(i32::MAX);
        // SAFETY: `pollfds` is a valid, exclusively borrowed array of `len` pollfd structs.
        let ready =
            unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err.into());
        }

        for (&(source, _, _), pfd) in sources.iter().zip(&pollfds) {
            if pfd.revents == 0 {
                continue;
            }
            match source {
                Source::Stdin => {
                    let done = match self.stdin.as_mut() {
                        Some(feed) => feed.write_some()?,
                        None => true,
                    };
                    if done {
                        // Dropping the write end lets the child see EOF.
                        self.stdin = None;
                    }
                }
                Source::Stdout => {
                    if let Some(pipe) = self.stdout.as_mut() {
                        let mut buf = Vec::new();
                        pipe.drain_into(&mut buf)?;
                        if self.options.read {
                            self.output.0.borrow_mut().stdout.extend_from_slice(&buf);
                        }
                    }
                }
                Source::Stderr => {
                    if let Some(pipe) = self.stderr.as_mut() {
                        pipe.drain_into(&mut self.stderr_buf)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Sends complete stderr lines to the notifier; everything if `flush`.
    fn report_stderr(&mut self, ctx: &TaskContext<'_>, flush: bool) {
        let cut = if flush {
            self.stderr_buf.len()
        } else {
            match self.stderr_buf.iter().rposition(|&b| b == b'\n') {
                Some(i) => i + 1,
                None => return,
            }
        };
        let text: Vec<u8> = self.stderr_buf.drain(..cut).collect();
        for line in String::from_utf8_lossy(&text).lines().filter(|l| !l.is_empty()) {
            tracing::warn!("{}: {line}", self.program);
            ctx.notifier.notify(line);
        }
    }

    fn pipes_open(&self) -> bool {
        self.stdout.as_ref().is_some_and(|p| p.open) || self.stderr.as_ref().is_some_and(|p| p.open)
    }

    fn finish(&mut self, status: ExitStatus, ctx: &TaskContext<'_>) {
        self.report_stderr(ctx, true);
        self.stdin = None;
        self.finished = true;
        self.output.0.borrow_mut().status = Some(status);
        if self.killed {
            tracing::debug!("{} was killed", self.program);
            return;
        }
        match status.code() {
            Some(0) => tracing::info!("{} finished", self.program),
            Some(code) => ctx
                .notifier
                .notify(&format!("{} exited with status {code}", self.program)),
            None => ctx
                .notifier
                .notify(&format!("{} terminated by signal", self.program)),
        }
    }

    fn signal(&self, signal: libc::c_int) {
        let Some(pid) = self.pid() else {
            return;
        };
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // SAFETY: sending a signal to our own child has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            tracing::debug!(
                "signal {signal} to {pid} failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill() {
                tracing::debug!("kill {} failed: {e}", self.program);
            }
            self.killed = true;
        }
    }
}

impl Task for CommandTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn description(&self) -> String {
        if self.args.is_empty() {
            format!("running: {}", self.program)
        } else {
            format!("running: {} {}", self.program, self.args.join(" "))
        }
    }

    fn step(&mut self, ctx: &mut TaskContext<'_>) -> CoreResult<Step> {
        if self.finished {
            return Ok(Step::Done);
        }
        if self.child.is_none() {
            self.spawn()?;
            return Ok(Step::Yield);
        }
        if self.paused {
            return Ok(Step::Yield);
        }

        self.poll_output()?;
        self.report_stderr(ctx, false);

        if self.pipes_open() {
            return Ok(Step::Yield);
        }
        let status = match self.child.as_mut() {
            Some(child) => child.try_wait()?,
            None => None,
        };
        match status {
            Some(status) => {
                self.finish(status, ctx);
                Ok(Step::Done)
            }
            None => Ok(Step::Yield),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.finished
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        if self.options.kill_on_pause {
            self.kill();
        } else {
            self.signal(libc::SIGSTOP);
        }
    }

    fn unpause(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        if !self.options.kill_on_pause {
            self.signal(libc::SIGCONT);
        }
    }

    fn destroy(&mut self) {
        self.stdin = None;
        if self.paused && !self.options.kill_on_pause {
            self.signal(libc::SIGCONT);
        }
        self.kill();
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.wait() {
                tracing::debug!("reaping {} failed: {e}", self.program);
            }
        }
        self.finished = true;
    }

    fn pid(&self) -> Option<u32> {
        if self.finished {
            return None;
        }
        self.child.as_ref().map(Child::id)
    }
}
