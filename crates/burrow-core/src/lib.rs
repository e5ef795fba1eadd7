//! burrow core library — the UI-agnostic engine of a terminal file browser.
//!
//! `burrow-core` caches filesystem entries, scans directories incrementally
//! and runs long operations as cooperative background tasks, so that a
//! front end stays responsive while browsing huge or slow directories. It
//! is single threaded: the front end drives everything through
//! [`Session::work`] once per tick.
//!
//! # Modules
//!
//! - [`fs`] — Cached entries with lazily derived attributes, directories with incremental scans, block-wise copy primitives.
//! - [`cache`] — The path-keyed [`Cache`] and its age-based eviction.
//! - [`nav`] — Filter and sort pipelines, tabs and their active paths.
//! - [`task`] / [`scheduler`] — The [`Task`] contract and the time-sliced [`Scheduler`].
//! - [`tasks`] — Copy/move and external command tasks.
//! - [`session`] — [`Session`], the owner of all of the above.
//! - [`config`] — TOML-based settings.
//! - [`event`] — Lifecycle events and the notification sink.
//! - [`error`] — Unified error type ([`CoreError`]) and result alias ([`CoreResult`]).

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod fs;
pub mod nav;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod tasks;

pub use cache::{Cache, MaxAge};
pub use config::settings::{BrowseConfig, Config};
pub use error::{CoreError, CoreResult};
pub use event::{Event, EventBus, LogNotifier, Notifier, TaskPhase};
pub use fs::directory::{DirHandle, DirectoryEntry, ScanTask};
pub use fs::entry::{CacheEntry, Entry, Kind};
pub use nav::sort::SortKey;
pub use nav::tab::Tab;
pub use scheduler::{Pause, QueuePosition, Scheduler};
pub use session::Session;
pub use task::{Spawner, Step, Task, TaskContext, TaskId};
pub use tasks::copy::{CopyBuffer, CopyTask};

#[cfg(unix)]
pub use tasks::command::{CommandOptions, CommandOutput, CommandTask};
