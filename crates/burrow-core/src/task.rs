//! The contract every unit of background work satisfies.
//!
//! A [`Task`] advances in small increments: each call to [`Task::step`]
//! does a bounded amount of work and reports whether more remains. The
//! [`Scheduler`](crate::scheduler::Scheduler) decides whose turn it is and
//! for how long.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::Cache;
use crate::config::settings::BrowseConfig;
use crate::error::CoreResult;
use crate::event::{EventBus, Notifier};
use crate::tasks::copy::CopyBuffer;

/// Process-unique identity of a task.
///
/// Queue membership is decided by id: adding a task whose id is already
/// queued replaces the queued one instead of duplicating it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a task reports after one increment of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More work remains; call `step` again later.
    Yield,
    /// The task has finished.
    Done,
}

/// A resumable unit of background work.
pub trait Task {
    fn id(&self) -> TaskId;

    /// Human readable one-liner for status displays.
    fn description(&self) -> String;

    /// Progress in percent, or `None` when indeterminate.
    fn percent(&self) -> Option<u8> {
        None
    }

    /// Whether a progress bar is worth drawing for this task.
    fn reports_progress(&self) -> bool {
        false
    }

    /// Performs one bounded increment of work.
    ///
    /// # Errors
    ///
    /// Any error ends the task; the scheduler reports it to the notifier
    /// and removes the task from the queue.
    fn step(&mut self, ctx: &mut TaskContext<'_>) -> CoreResult<Step>;

    /// A task that has nothing left to do without being stepped.
    fn is_exhausted(&self) -> bool {
        false
    }

    fn is_paused(&self) -> bool;
    fn pause(&mut self);
    fn unpause(&mut self);

    /// Cleanup run when the task is removed before completion.
    fn destroy(&mut self) {}

    /// Process id, for tasks wrapping an external process.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Something that accepts new tasks.
pub trait Spawner {
    fn spawn(&mut self, task: Box<dyn Task>, to_back: bool);
}

/// Everything a task may touch while it is being stepped.
///
/// Tasks never reach the scheduler directly; follow-up work is queued with
/// [`Spawner::spawn`] and handed to the scheduler once the current step
/// returns.
pub struct TaskContext<'a> {
    pub cache: &'a mut Cache,
    pub browse: &'a BrowseConfig,
    pub events: &'a EventBus,
    pub notifier: &'a dyn Notifier,
    pub copy_buffer: &'a mut CopyBuffer,
    spawned: Vec<(Box<dyn Task>, bool)>,
}

impl<'a> TaskContext<'a> {
    pub fn new(
        cache: &'a mut Cache,
        browse: &'a BrowseConfig,
        events: &'a EventBus,
        notifier: &'a dyn Notifier,
        copy_buffer: &'a mut CopyBuffer,
    ) -> Self {
        Self {
            cache,
            browse,
            events,
            notifier,
            copy_buffer,
            spawned: Vec::new(),
        }
    }

    /// Drains the tasks queued by [`Spawner::spawn`], oldest first.
    pub fn take_spawned(&mut self) -> Vec<(Box<dyn Task>, bool)> {
        std::mem::take(&mut self.spawned)
    }
}

impl Spawner for TaskContext<'_> {
    fn spawn(&mut self, task: Box<dyn Task>, to_back: bool) {
        self.spawned.push((task, to_back));
    }
}
