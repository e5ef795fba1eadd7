//! Lifecycle events and the notification sink.
//!
//! The engine never calls back into the UI. Instead it publishes [`Event`]s
//! on an [`EventBus`]; collaborators (a redraw hook, a VCS status refresher)
//! subscribe to receive them over a channel and unsubscribe explicitly when
//! they go away. Failure messages meant for the user go to a [`Notifier`]
//! as plain text.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc::{channel, Receiver, Sender};

use crate::task::TaskId;

/// The stage of a task's life an [`Event::Task`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// The task entered the queue.
    Before,
    /// The task ran to completion (or failed) and left the queue.
    After,
    /// The task was suspended.
    Pause,
    /// The task was resumed.
    Unpause,
    /// The task was removed and destroyed before completing.
    Destroy,
}

/// A notification the engine sends to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A task changed lifecycle phase.
    Task {
        /// The task the event concerns.
        id: TaskId,
        /// What happened.
        phase: TaskPhase,
        /// Process id, for tasks wrapping an external process.
        pid: Option<u32>,
    },
    /// A directory finished an incremental scan.
    ScanFinished {
        /// Absolute path of the scanned directory.
        path: PathBuf,
    },
    /// Visible progress changed; the UI should redraw its status line.
    RedrawRequested,
    /// Cached entries were evicted.
    GarbageCollected {
        /// Number of entries removed from the cache.
        evicted: usize,
    },
}

/// Opaque handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    senders: Vec<(SubscriptionId, Sender<Event>)>,
}

/// Fan-out of [`Event`]s to every registered subscriber.
///
/// Cloning an `EventBus` yields another handle to the same subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber and returns its id and receiving end.
    pub fn subscribe(&self) -> (SubscriptionId, Receiver<Event>) {
        let (tx, rx) = channel();
        let mut inner = self.inner.borrow_mut();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.senders.push((id, tx));
        (id, rx)
    }

    /// Removes a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.borrow_mut().senders.retain(|(sid, _)| *sid != id);
    }

    /// Sends `event` to every subscriber, dropping those whose receiver is gone.
    pub fn emit(&self, event: Event) {
        let mut inner = self.inner.borrow_mut();
        inner.senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().senders.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Receives plain-text failure messages meant for the user.
pub trait Notifier {
    fn notify(&self, message: &str);
}

/// Default sink: forwards every message to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        tracing::warn!("{message}");
    }
}
