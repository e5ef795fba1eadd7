//! The owner of all browsing state.
//!
//! A [`Session`] ties together the cache, the scheduler, the settings, the
//! event bus and the open tabs. Front ends create one with
//! [`Session::init`], call [`Session::work`] once per tick while
//! [`Session::has_work`] is true, and end it with [`Session::teardown`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::cache::{Cache, MaxAge};
use crate::config::settings::{BrowseConfig, Config};
use crate::error::CoreResult;
use crate::event::{Event, EventBus, LogNotifier, Notifier};
use crate::fs::directory::DirHandle;
use crate::fs::entry::Entry;
use crate::nav::tab::Tab;
use crate::scheduler::{Pause, Scheduler};
use crate::task::{Task, TaskContext, TaskId};
use crate::tasks::copy::{CopyBuffer, CopyTask};

#[cfg(unix)]
use crate::tasks::command::{CommandOptions, CommandOutput, CommandTask};

pub struct Session {
    config: Config,
    cache: Cache,
    scheduler: Scheduler,
    events: EventBus,
    notifier: Box<dyn Notifier>,
    copy_buffer: CopyBuffer,
    tabs: Vec<Tab>,
    active_tab: usize,
}

impl Session {
    /// Creates a session that reports failures to the log.
    pub fn init(config: Config) -> Self {
        Self::with_notifier(config, Box::new(LogNotifier))
    }

    pub fn with_notifier(config: Config, notifier: Box<dyn Notifier>) -> Self {
        let events = EventBus::new();
        let scheduler = Scheduler::new(&config.scheduler, events.clone());
        tracing::debug!("session started");
        Self {
            config,
            cache: Cache::new(),
            scheduler,
            events,
            notifier,
            copy_buffer: CopyBuffer::default(),
            tabs: Vec::new(),
            active_tab: 0,
        }
    }

    /// Destroys every pending task and empties the cache.
    pub fn teardown(&mut self) {
        self.scheduler.destroy_all();
        self.cache.clear();
        self.tabs.clear();
        self.active_tab = 0;
        tracing::debug!("session torn down");
    }

    /// Borrows the scheduler and a task context side by side.
    fn split(&mut self) -> (&mut Scheduler, TaskContext<'_>) {
        let ctx = TaskContext::new(
            &mut self.cache,
            &self.config.browse,
            &self.events,
            self.notifier.as_ref(),
            &mut self.copy_buffer,
        );
        (&mut self.scheduler, ctx)
    }

    /// Runs `f` with a task context and queues whatever it spawned.
    fn with_context<T>(&mut self, f: impl FnOnce(&mut TaskContext<'_>) -> T) -> T {
        let (scheduler, mut ctx) = self.split();
        let result = f(&mut ctx);
        for (task, to_back) in ctx.take_spawned() {
            scheduler.add(task, to_back);
        }
        result
    }

    /// Gives the scheduler one time slice.
    pub fn work(&mut self) {
        let (scheduler, mut ctx) = self.split();
        scheduler.work(&mut ctx);
    }

    pub fn has_work(&self) -> bool {
        self.scheduler.has_work()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn copy_buffer(&self) -> &CopyBuffer {
        &self.copy_buffer
    }

    /// Cached entry for `path`, created on first use.
    pub fn get(&mut self, path: &Path) -> Entry {
        self.cache.get(path)
    }

    /// Cached directory for `path`, created on first use.
    pub fn directory(&mut self, path: &Path) -> CoreResult<DirHandle> {
        self.cache.get_directory(path)
    }

    /// Scans `dir`, in the background with `schedule`.
    pub fn load_content(&mut self, dir: &DirHandle, schedule: bool) {
        self.with_context(|ctx| dir.borrow_mut().load_content(ctx, schedule));
    }

    /// Schedules a scan of `dir` if it was never loaded or changed on disk.
    pub fn load_content_if_outdated(&mut self, dir: &DirHandle) -> bool {
        self.with_context(|ctx| dir.borrow_mut().load_content_if_outdated(ctx, true))
    }

    // Tabs

    /// Opens a new tab on `path` and makes it active.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] or [`CoreError::NotADirectory`] if `path` is
    /// not a readable directory.
    pub fn open_tab(&mut self, path: &Path) -> CoreResult<DirHandle> {
        let dir = self.directory(path)?;
        self.tabs.push(Tab::new(path));
        self.active_tab = self.tabs.len() - 1;
        self.load_content_if_outdated(&dir);
        Ok(dir)
    }

    /// Changes the directory of the active tab, opening one if there is none.
    pub fn enter(&mut self, path: &Path) -> CoreResult<DirHandle> {
        if self.tabs.is_empty() {
            return self.open_tab(path);
        }
        let dir = self.directory(path)?;
        if let Some(tab) = self.tabs.get_mut(self.active_tab) {
            tab.enter(path);
        }
        self.load_content_if_outdated(&dir);
        Ok(dir)
    }

    pub fn close_tab(&mut self, index: usize) -> Option<Tab> {
        if index >= self.tabs.len() {
            return None;
        }
        let tab = self.tabs.remove(index);
        self.active_tab = self.active_tab.min(self.tabs.len().saturating_sub(1));
        Some(tab)
    }

    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn active_tab(&self) -> Option<&Tab> {
        self.tabs.get(self.active_tab)
    }

    pub fn set_active_tab(&mut self, index: usize) -> bool {
        if index >= self.tabs.len() {
            return false;
        }
        self.active_tab = index;
        true
    }

    /// The directory shown by the active tab, if it is cached.
    pub fn current_directory(&mut self) -> Option<DirHandle> {
        let path = self.active_tab()?.path().to_path_buf();
        self.cache.get_directory(&path).ok()
    }

    /// Every directory on the pathway of some open tab.
    pub fn active_paths(&self) -> HashSet<PathBuf> {
        self.tabs.iter().flat_map(Tab::pathway).collect()
    }

    // Eviction

    /// Evicts cached entries older than `max_age` that no tab is showing.
    pub fn garbage_collect(&mut self, max_age: MaxAge) -> usize {
        let active = self.active_paths();
        let evicted = self.cache.garbage_collect(max_age, &active);
        if evicted > 0 {
            self.events.emit(Event::GarbageCollected { evicted });
        }
        evicted
    }

    /// [`garbage_collect`](Self::garbage_collect) with the configured age.
    pub fn garbage_collect_default(&mut self) -> usize {
        self.garbage_collect(MaxAge::Older(self.config.cache.max_age()))
    }

    // Copy buffer

    /// Remembers `paths` for the next [`paste`](Self::paste).
    pub fn copy(&mut self, paths: Vec<PathBuf>) {
        self.copy_buffer.set(paths, false);
    }

    /// Like [`copy`](Self::copy), but the paste moves the files.
    pub fn cut(&mut self, paths: Vec<PathBuf>) {
        self.copy_buffer.set(paths, true);
    }

    /// Copies or cuts the selection of `dir`.
    pub fn yank_selection(&mut self, dir: &DirHandle, cut: bool) -> usize {
        let paths: Vec<PathBuf> = dir.borrow().selection().iter().map(Entry::path).collect();
        let count = paths.len();
        self.copy_buffer.set(paths, cut);
        count
    }

    /// Queues a copy or move of the buffer into `dest_dir`.
    ///
    /// Returns `None` when the buffer is empty.
    pub fn paste(&mut self, dest_dir: &Path, overwrite: bool) -> Option<TaskId> {
        if self.copy_buffer.is_empty() {
            return None;
        }
        let task = CopyTask::new(
            self.copy_buffer.paths().to_vec(),
            dest_dir.to_path_buf(),
            self.copy_buffer.is_cut(),
            overwrite,
        );
        let id = task.id();
        self.scheduler.add(Box::new(task), false);
        Some(id)
    }

    // Commands

    /// Queues an external program.
    #[cfg(unix)]
    pub fn run_command(
        &mut self,
        program: &str,
        args: Vec<String>,
        options: CommandOptions,
    ) -> (TaskId, CommandOutput) {
        let task = CommandTask::new(program, args, options)
            .with_poll_timeout(self.config.scheduler.poll_timeout());
        let (id, output) = (task.id(), task.output());
        self.scheduler.add(Box::new(task), false);
        (id, output)
    }

    // Scheduler control

    pub fn pause(&mut self, state: Pause) {
        self.scheduler.pause(state);
    }

    pub fn remove_task(&mut self, id: TaskId) -> bool {
        self.scheduler.remove(id)
    }

    /// Adopts new browse settings for every cached directory.
    ///
    /// Ordering is re-applied lazily by `sort_if_outdated`.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidPattern`] if the hidden-file pattern does not
    /// compile; nothing changes then.
    pub fn set_browse_config(&mut self, browse: BrowseConfig) -> CoreResult<()> {
        browse.hidden_regex()?;
        for dir in self.cache.directories() {
            dir.borrow_mut().set_browse(browse.clone())?;
        }
        self.config.browse = browse;
        self.events.emit(Event::RedrawRequested);
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.scheduler.destroy_all();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cache", &self.cache.len())
            .field("scheduler", &self.scheduler)
            .field("tabs", &self.tabs)
            .finish()
    }
}
