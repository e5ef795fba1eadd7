//! Cooperative scheduling of background tasks.
//!
//! The [`Scheduler`] keeps an ordered queue of [`Task`]s. Every call to
//! [`Scheduler::work`] advances only the task at the head of the queue, and
//! only until a fixed time budget is spent, so the caller (usually a UI
//! loop) gets control back quickly no matter how much work is pending.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::settings::SchedulerConfig;
use crate::event::{Event, EventBus, TaskPhase};
use crate::task::{Step, Task, TaskContext, TaskId};

const THROBBER: [char; 4] = ['/', '-', '\\', '|'];
const THROBBER_PAUSED: char = '#';

/// Requested global pause state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    On,
    Off,
    Toggle,
}

/// Where [`Scheduler::move_task`] puts a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Front,
    Back,
}

/// Ordered queue of tasks driven once per UI tick.
pub struct Scheduler {
    queue: VecDeque<Box<dyn Task>>,
    current: Option<TaskId>,
    paused: bool,
    work_time: Duration,
    events: EventBus,
    rotation: usize,
}

fn emit_phase(events: &EventBus, task: &dyn Task, phase: TaskPhase) {
    events.emit(Event::Task {
        id: task.id(),
        phase,
        pid: task.pid(),
    });
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig, events: EventBus) -> Self {
        Self {
            queue: VecDeque::new(),
            current: None,
            paused: false,
            work_time: config.work_time(),
            events,
            rotation: 0,
        }
    }

    fn position(&self, id: TaskId) -> Option<usize> {
        self.queue.iter().position(|t| t.id() == id)
    }

    /// Queues `task` at the front, or at the back with `to_back`.
    ///
    /// A task whose id is already queued replaces the queued one. The task
    /// starts paused if the scheduler is paused.
    pub fn add(&mut self, mut task: Box<dyn Task>, to_back: bool) {
        let id = task.id();
        match self.position(id) {
            Some(pos) => {
                self.queue.remove(pos);
                tracing::debug!("task {id} re-queued");
            }
            None => {
                tracing::debug!("task {id} queued: {}", task.description());
                emit_phase(&self.events, task.as_ref(), TaskPhase::Before);
            }
        }

        if self.paused {
            task.pause();
        } else {
            task.unpause();
        }

        if to_back {
            self.queue.push_back(task);
        } else {
            self.queue.push_front(task);
        }
    }

    /// Advances the head of the queue for at most one time budget.
    ///
    /// Tasks that finish leave the queue; tasks that fail are reported to
    /// the notifier and leave the queue as well. Tasks spawned during the
    /// step are queued afterwards.
    pub fn work(&mut self, ctx: &mut TaskContext<'_>) {
        if self.paused {
            return;
        }
        self.rotation = self.rotation.wrapping_add(1);

        while self.queue.front().is_some_and(|t| t.is_exhausted()) {
            if let Some(task) = self.queue.pop_front() {
                tracing::debug!("dropping exhausted task {}", task.id());
                emit_phase(&self.events, task.as_ref(), TaskPhase::After);
                if self.current == Some(task.id()) {
                    self.current = None;
                }
            }
        }

        let Some(id) = self.queue.front().map(|t| t.id()) else {
            self.current = None;
            return;
        };
        if self.current != Some(id) {
            if let Some(pos) = self.current.and_then(|prev| self.position(prev)) {
                let previous = &mut self.queue[pos];
                if !previous.is_paused() {
                    previous.pause();
                    emit_phase(&self.events, previous.as_ref(), TaskPhase::Pause);
                }
            }
            self.current = Some(id);
        }

        let Some(task) = self.queue.front_mut() else {
            return;
        };
        if task.is_paused() {
            task.unpause();
            emit_phase(&self.events, task.as_ref(), TaskPhase::Unpause);
        }

        let deadline = Instant::now() + self.work_time;
        let outcome = loop {
            match task.step(ctx) {
                Ok(Step::Yield) if Instant::now() < deadline => continue,
                other => break other,
            }
        };

        match outcome {
            Ok(Step::Yield) => {
                if task.reports_progress() {
                    self.events.emit(Event::RedrawRequested);
                }
            }
            Ok(Step::Done) => {
                tracing::info!("task {id} finished: {}", task.description());
                self.retire(false);
            }
            Err(e) => {
                let message = format!("{}: {e}", task.description());
                tracing::warn!("task {id} failed: {message}");
                ctx.notifier.notify(&message);
                self.retire(true);
            }
        }

        for (task, to_back) in ctx.take_spawned() {
            self.add(task, to_back);
        }
    }

    /// Removes the head after it finished; `failed` tasks get their cleanup hook run.
    fn retire(&mut self, failed: bool) {
        let Some(mut task) = self.queue.pop_front() else {
            return;
        };
        if failed {
            task.destroy();
        }
        emit_phase(&self.events, task.as_ref(), TaskPhase::After);
        if task.reports_progress() {
            self.events.emit(Event::RedrawRequested);
        }
        self.current = None;
    }

    /// Pauses or resumes the scheduler and the task at the head of the queue.
    pub fn pause(&mut self, state: Pause) {
        let paused = match state {
            Pause::On => true,
            Pause::Off => false,
            Pause::Toggle => !self.paused,
        };
        if paused == self.paused {
            return;
        }
        self.paused = paused;
        tracing::debug!("scheduler {}", if paused { "paused" } else { "resumed" });

        if let Some(head) = self.queue.front_mut() {
            if paused {
                head.pause();
                emit_phase(&self.events, head.as_ref(), TaskPhase::Pause);
            } else {
                head.unpause();
                emit_phase(&self.events, head.as_ref(), TaskPhase::Unpause);
            }
        }
    }

    /// Detaches and destroys the task `id`. Returns `false` if it is not queued.
    pub fn remove(&mut self, id: TaskId) -> bool {
        let Some(mut task) = self.position(id).and_then(|pos| self.queue.remove(pos)) else {
            return false;
        };
        task.destroy();
        tracing::debug!("task {id} removed");
        emit_phase(&self.events, task.as_ref(), TaskPhase::Destroy);
        if self.current == Some(id) {
            self.current = None;
        }
        if task.reports_progress() {
            self.events.emit(Event::RedrawRequested);
        }
        true
    }

    /// Moves a queued task to the front or the back.
    ///
    /// Moving to the front pauses the task it displaces.
    pub fn move_task(&mut self, id: TaskId, to: QueuePosition) -> bool {
        let Some(task) = self.position(id).and_then(|pos| self.queue.remove(pos)) else {
            return false;
        };
        match to {
            QueuePosition::Front => {
                if let Some(head) = self.queue.front_mut() {
                    if !head.is_paused() {
                        head.pause();
                        emit_phase(&self.events, head.as_ref(), TaskPhase::Pause);
                    }
                }
                self.queue.push_front(task);
            }
            QueuePosition::Back => self.queue.push_back(task),
        }
        true
    }

    /// Destroys every queued task.
    pub fn destroy_all(&mut self) {
        for mut task in self.queue.drain(..) {
            task.destroy();
            emit_phase(&self.events, task.as_ref(), TaskPhase::Destroy);
        }
        self.current = None;
    }

    pub fn has_work(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Queued tasks, head first.
    pub fn tasks(&self) -> impl Iterator<Item = &dyn Task> {
        self.queue.iter().map(|t| t.as_ref())
    }

    /// Busy indicator: rotates on every `work`, `#` while paused.
    pub fn throbber(&self) -> char {
        if self.paused {
            THROBBER_PAUSED
        } else {
            THROBBER[self.rotation % THROBBER.len()]
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queued", &self.queue.len())
            .field("current", &self.current)
            .field("paused", &self.paused)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CoreError, CoreResult};
    use crate::task::testing::Harness;
    use crate::task::Spawner;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::mpsc::Receiver;

    type Log = Rc<RefCell<Vec<String>>>;

    struct Fake {
        id: TaskId,
        name: &'static str,
        steps: usize,
        fail: bool,
        paused: bool,
        destroyed: Rc<RefCell<bool>>,
        spawn_on_done: Option<Box<Fake>>,
        log: Log,
    }

    impl Fake {
        fn new(name: &'static str, steps: usize, log: &Log) -> Self {
            Self {
                id: TaskId::next(),
                name,
                steps,
                fail: false,
                paused: false,
                destroyed: Rc::default(),
                spawn_on_done: None,
                log: Rc::clone(log),
            }
        }
    }

    impl Task for Fake {
        fn id(&self) -> TaskId {
            self.id
        }
        fn description(&self) -> String {
            self.name.to_string()
        }
        fn reports_progress(&self) -> bool {
            true
        }
        fn step(&mut self, ctx: &mut TaskContext<'_>) -> CoreResult<Step> {
            if self.fail {
                return Err(CoreError::Spawn("no such program".to_string()));
            }
            self.log.borrow_mut().push(self.name.to_string());
            self.steps -= 1;
            if self.steps > 0 {
                return Ok(Step::Yield);
            }
            if let Some(next) = self.spawn_on_done.take() {
                ctx.spawn(next, true);
            }
            Ok(Step::Done)
        }
        fn is_exhausted(&self) -> bool {
            self.steps == 0
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
        fn destroy(&mut self) {
            *self.destroyed.borrow_mut() = true;
        }
    }

    /// A scheduler that performs exactly one step per `work` call.
    fn one_step_scheduler(events: &EventBus) -> Scheduler {
        let config = SchedulerConfig {
            work_time_ms: 0,
            ..SchedulerConfig::default()
        };
        Scheduler::new(&config, events.clone())
    }

    fn task_events(rx: &Receiver<Event>) -> Vec<(TaskId, TaskPhase)> {
        rx.try_iter()
            .filter_map(|e| match e {
                Event::Task { id, phase, .. } => Some((id, phase)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn has_work_flips_after_last_step() {
        let mut h = Harness::new();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        scheduler.add(Box::new(Fake::new("a", 3, &log)), false);

        scheduler.work(&mut h.ctx());
        assert!(scheduler.has_work());
        scheduler.work(&mut h.ctx());
        assert!(scheduler.has_work());
        scheduler.work(&mut h.ctx());
        assert!(!scheduler.has_work());
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn budget_runs_many_steps_per_work() {
        let mut h = Harness::new();
        let mut scheduler = Scheduler::new(&SchedulerConfig::default(), h.events.clone());
        let log = Log::default();
        scheduler.add(Box::new(Fake::new("a", 50, &log)), false);

        scheduler.work(&mut h.ctx());

        assert!(!scheduler.has_work());
        assert_eq!(log.borrow().len(), 50);
    }

    #[test]
    fn newest_task_runs_first() {
        let mut h = Harness::new();
        let (_, rx) = h.events.subscribe();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        let a = Fake::new("a", 2, &log);
        let b = Fake::new("b", 3, &log);
        let (a_id, b_id) = (a.id, b.id);

        scheduler.add(Box::new(a), false);
        scheduler.add(Box::new(b), false);
        while scheduler.has_work() {
            scheduler.work(&mut h.ctx());
        }

        assert_eq!(*log.borrow(), vec!["b", "b", "b", "a", "a"]);
        assert_eq!(
            task_events(&rx),
            vec![
                (a_id, TaskPhase::Before),
                (b_id, TaskPhase::Before),
                (b_id, TaskPhase::After),
                (a_id, TaskPhase::After),
            ]
        );
    }

    #[test]
    fn new_head_pauses_the_running_task() {
        let mut h = Harness::new();
        let (_, rx) = h.events.subscribe();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        let a = Fake::new("a", 3, &log);
        let a_id = a.id;
        scheduler.add(Box::new(a), false);
        scheduler.work(&mut h.ctx());

        scheduler.add(Box::new(Fake::new("b", 1, &log)), false);
        scheduler.work(&mut h.ctx());
        scheduler.work(&mut h.ctx());

        let events = task_events(&rx);
        assert!(events.contains(&(a_id, TaskPhase::Pause)));
        assert!(events.contains(&(a_id, TaskPhase::Unpause)));
        assert_eq!(*log.borrow(), vec!["a", "b", "a"]);
    }

    #[test]
    fn errors_are_reported_and_work_continues() {
        let mut h = Harness::new();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        let mut broken = Fake::new("broken", 5, &log);
        broken.fail = true;
        let destroyed = Rc::clone(&broken.destroyed);
        scheduler.add(Box::new(Fake::new("ok", 1, &log)), false);
        scheduler.add(Box::new(broken), false);

        scheduler.work(&mut h.ctx());
        assert_eq!(
            *h.notifier.messages.borrow(),
            vec!["broken: failed to spawn process: no such program"]
        );
        assert!(*destroyed.borrow());
        assert_eq!(scheduler.len(), 1);

        scheduler.work(&mut h.ctx());
        assert!(!scheduler.has_work());
        assert_eq!(*log.borrow(), vec!["ok"]);
    }

    #[test]
    fn adding_a_queued_task_moves_it_instead_of_duplicating() {
        let h = Harness::new();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        let a = Fake::new("a", 1, &log);
        let mut again = Fake::new("a", 1, &log);
        again.id = a.id;

        scheduler.add(Box::new(a), false);
        scheduler.add(Box::new(Fake::new("b", 1, &log)), false);
        scheduler.add(Box::new(again), false);

        assert_eq!(scheduler.len(), 2);
        let order: Vec<String> = scheduler.tasks().map(|t| t.description()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn to_back_appends() {
        let h = Harness::new();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        scheduler.add(Box::new(Fake::new("a", 1, &log)), false);
        scheduler.add(Box::new(Fake::new("b", 1, &log)), true);

        let order: Vec<String> = scheduler.tasks().map(|t| t.description()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn paused_scheduler_does_no_work() {
        let mut h = Harness::new();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        scheduler.pause(Pause::On);
        scheduler.add(Box::new(Fake::new("a", 1, &log)), false);

        scheduler.work(&mut h.ctx());

        assert!(log.borrow().is_empty());
        assert!(scheduler.tasks().all(|t| t.is_paused()));
        assert_eq!(scheduler.throbber(), '#');

        scheduler.pause(Pause::Toggle);
        assert!(!scheduler.is_paused());
        scheduler.work(&mut h.ctx());
        assert!(!scheduler.has_work());
    }

    #[test]
    fn pause_forwards_to_head() {
        let h = Harness::new();
        let (_, rx) = h.events.subscribe();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        let a = Fake::new("a", 1, &log);
        let a_id = a.id;
        scheduler.add(Box::new(a), false);

        scheduler.pause(Pause::On);
        scheduler.pause(Pause::On);
        scheduler.pause(Pause::Off);

        let events = task_events(&rx);
        assert_eq!(
            events,
            vec![
                (a_id, TaskPhase::Before),
                (a_id, TaskPhase::Pause),
                (a_id, TaskPhase::Unpause),
            ]
        );
    }

    #[test]
    fn remove_destroys_the_task() {
        let h = Harness::new();
        let (_, rx) = h.events.subscribe();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        let a = Fake::new("a", 5, &log);
        let (a_id, destroyed) = (a.id, Rc::clone(&a.destroyed));
        scheduler.add(Box::new(a), false);

        assert!(scheduler.remove(a_id));
        assert!(!scheduler.remove(a_id));

        assert!(*destroyed.borrow());
        assert!(!scheduler.has_work());
        assert!(task_events(&rx).contains(&(a_id, TaskPhase::Destroy)));
    }

    #[test]
    fn move_task_reorders_queue() {
        let h = Harness::new();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        let a = Fake::new("a", 1, &log);
        let a_id = a.id;
        scheduler.add(Box::new(a), false);
        scheduler.add(Box::new(Fake::new("b", 1, &log)), true);

        assert!(scheduler.move_task(a_id, QueuePosition::Back));
        let order: Vec<String> = scheduler.tasks().map(|t| t.description()).collect();
        assert_eq!(order, vec!["b", "a"]);

        assert!(scheduler.move_task(a_id, QueuePosition::Front));
        let head = scheduler.tasks().next().unwrap();
        assert_eq!(head.id(), a_id);
        assert!(scheduler.tasks().nth(1).unwrap().is_paused());
    }

    #[test]
    fn spawned_tasks_are_queued_after_the_step() {
        let mut h = Harness::new();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        let mut parent = Fake::new("parent", 1, &log);
        parent.spawn_on_done = Some(Box::new(Fake::new("child", 1, &log)));
        scheduler.add(Box::new(parent), false);

        scheduler.work(&mut h.ctx());
        assert_eq!(scheduler.len(), 1);
        scheduler.work(&mut h.ctx());

        assert_eq!(*log.borrow(), vec!["parent", "child"]);
        assert!(!scheduler.has_work());
    }

    #[test]
    fn exhausted_head_is_dropped_without_stepping() {
        let mut h = Harness::new();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        scheduler.add(Box::new(Fake::new("b", 1, &log)), false);
        scheduler.add(Box::new(Fake::new("spent", 0, &log)), false);

        scheduler.work(&mut h.ctx());

        assert_eq!(*log.borrow(), vec!["b"]);
        assert!(!scheduler.has_work());
    }

    #[test]
    fn destroy_all_empties_the_queue() {
        let h = Harness::new();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        let a = Fake::new("a", 3, &log);
        let destroyed = Rc::clone(&a.destroyed);
        scheduler.add(Box::new(a), false);
        scheduler.add(Box::new(Fake::new("b", 3, &log)), false);

        scheduler.destroy_all();

        assert!(!scheduler.has_work());
        assert!(*destroyed.borrow());
    }

    #[test]
    fn throbber_rotates() {
        let mut h = Harness::new();
        let mut scheduler = one_step_scheduler(&h.events);
        let first = scheduler.throbber();
        scheduler.work(&mut h.ctx());
        assert_ne!(scheduler.throbber(), first);
    }

    #[test]
    fn progress_tasks_request_redraws() {
        let mut h = Harness::new();
        let (_, rx) = h.events.subscribe();
        let mut scheduler = one_step_scheduler(&h.events);
        let log = Log::default();
        scheduler.add(Box::new(Fake::new("a", 2, &log)), false);

        scheduler.work(&mut h.ctx());

        assert!(rx.try_iter().any(|e| e == Event::RedrawRequested));
    }
}
