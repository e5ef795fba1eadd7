//! Copying and moving files in the background.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};
use crate::fs::entry::human_readable;
use crate::fs::ops::{
    accounted_size, copy_link, plan_copy, remove_path, safe_path, transfer_size, BlockCopy,
    CopyItem, BLOCK_SIZE,
};
use crate::task::{Step, Task, TaskContext, TaskId};

/// Paths picked for the next paste, and whether they are to be moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyBuffer {
    paths: Vec<PathBuf>,
    cut: bool,
}

impl CopyBuffer {
    pub fn set(&mut self, paths: Vec<PathBuf>, cut: bool) {
        self.paths = paths;
        self.cut = cut;
    }

    pub fn clear(&mut self) {
        self.paths.clear();
        self.cut = false;
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Whether a paste moves instead of copying.
    pub fn is_cut(&self) -> bool {
        self.cut
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Measure,
    Transfer,
    Finished,
}

/// A file being copied block by block.
struct OpenFile {
    copy: BlockCopy,
    /// Progress value when the file was opened.
    base: u64,
    accounted: u64,
}

/// Copies or moves a set of paths into a directory.
///
/// Progress is measured in [`BLOCK_SIZE`] units over the accounted size of
/// every file. A move clears the copy buffer on its first step, before any
/// data is touched, so triggering the paste again cannot move twice.
pub struct CopyTask {
    id: TaskId,
    sources: Vec<PathBuf>,
    dest_dir: PathBuf,
    cut: bool,
    overwrite: bool,
    paused: bool,
    phase: Phase,
    description: String,
    total: u64,
    done: u64,
    pending: VecDeque<PathBuf>,
    items: VecDeque<CopyItem>,
    open: Option<OpenFile>,
    remove_after: Option<PathBuf>,
}

impl CopyTask {
    pub fn new(sources: Vec<PathBuf>, dest_dir: PathBuf, cut: bool, overwrite: bool) -> Self {
        Self {
            id: TaskId::next(),
            sources,
            dest_dir,
            cut,
            overwrite,
            paused: false,
            phase: Phase::Start,
            description: "Calculating size...".to_string(),
            total: 0,
            done: 0,
            pending: VecDeque::new(),
            items: VecDeque::new(),
            open: None,
            remove_after: None,
        }
    }

    fn measure(&mut self) {
        self.total = transfer_size(&self.sources);
        let size = human_readable(self.total);
        self.description = match (self.cut, self.sources.as_slice()) {
            (true, [first, ..]) => {
                let from = first.parent().unwrap_or(first);
                format!("moving files from: {} ({size})", from.display())
            }
            (false, [only]) => format!("copying: {} ({size})", only.display()),
            (false, _) => format!("copying files into: {} ({size})", self.dest_dir.display()),
            (true, []) => format!("moving files ({size})"),
        };
        self.pending = self.sources.iter().cloned().collect();
    }

    fn start_source(&mut self, src: PathBuf) -> CoreResult<()> {
        let name = src
            .file_name()
            .ok_or_else(|| CoreError::InvalidName(src.display().to_string()))?;
        let mut target = self.dest_dir.join(name);
        if !self.overwrite {
            target = safe_path(&target);
        }

        if self.cut {
            let size = transfer_size(std::slice::from_ref(&src));
            match std::fs::rename(&src, &target) {
                Ok(()) => {
                    tracing::debug!("renamed {} to {}", src.display(), target.display());
                    self.done += size;
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("rename of {} failed ({e}), copying", src.display());
                }
            }
        }

        self.items = plan_copy(&src, &target)?.into();
        if self.cut {
            self.remove_after = Some(src);
        }
        Ok(())
    }

    fn run_item(&mut self, item: CopyItem) -> CoreResult<()> {
        match item {
            CopyItem::Dir(dest) => std::fs::create_dir_all(&dest)?,
            CopyItem::Link { src, dest } => copy_link(&src, &dest)?,
            CopyItem::File { src, dest, len } => {
                self.open = Some(OpenFile {
                    copy: BlockCopy::open(&src, &dest)?,
                    base: self.done,
                    accounted: accounted_size(len),
                });
            }
        }
        Ok(())
    }

    fn copy_block(&mut self) -> CoreResult<()> {
        let Some(open) = self.open.as_mut() else {
            return Ok(());
        };
        let end = open.base + open.accounted;
        if open.copy.copy_block()? == 0 {
            self.done = end;
            self.open = None;
        } else {
            self.done = (self.done + BLOCK_SIZE).min(end);
        }
        Ok(())
    }

    /// Rescans the destination and, for moves, the source directories.
    fn finish(&mut self, ctx: &mut TaskContext<'_>) {
        self.phase = Phase::Finished;
        self.done = self.total;
        tracing::info!("{} done", self.description);

        let mut dirs = vec![self.dest_dir.clone()];
        if self.cut {
            dirs.extend(
                self.sources
                    .iter()
                    .filter_map(|s| s.parent().map(Path::to_path_buf)),
            );
        }
        dirs.sort();
        dirs.dedup();

        for path in dirs {
            if let Some(dir) = ctx.cache.directory(&path) {
                dir.borrow_mut().load_content(ctx, true);
            }
        }
    }
}

impl Task for CopyTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn percent(&self) -> Option<u8> {
        let percent = match (self.phase, self.total) {
            (Phase::Finished, _) => 100,
            (_, 0) => 0,
            (_, total) => (self.done.saturating_mul(100) / total).min(100),
        };
        Some(percent as u8)
    }

    fn reports_progress(&self) -> bool {
        true
    }

    fn step(&mut self, ctx: &mut TaskContext<'_>) -> CoreResult<Step> {
        match self.phase {
            Phase::Start => {
                if self.cut {
                    ctx.copy_buffer.clear();
                }
                self.phase = Phase::Measure;
            }
            Phase::Measure => {
                self.measure();
                self.phase = Phase::Transfer;
            }
            Phase::Transfer => {
                if self.open.is_some() {
                    self.copy_block()?;
                } else if let Some(item) = self.items.pop_front() {
                    self.run_item(item)?;
                } else if let Some(src) = self.remove_after.take() {
                    remove_path(&src)?;
                } else if let Some(src) = self.pending.pop_front() {
                    self.start_source(src)?;
                } else {
                    self.finish(ctx);
                    return Ok(Step::Done);
                }
            }
            Phase::Finished => return Ok(Step::Done),
        }
        Ok(Step::Yield)
    }

    fn is_exhausted(&self) -> bool {
        self.phase == Phase::Finished
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn unpause(&mut self) {
        self.paused = false;
    }
}
