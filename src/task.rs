//! A single-shot rendezvous between the requester of an asynchronous
//! operation and its implementation.
//!
//! A [`Task`] moves through `ready → running → done`, with a `cancelling`
//! detour when cancellation or a deadline arrives while the operation is in
//! flight. It finishes exactly once; the stamped [`Status`] is stable
//! afterwards. Any number of completion callbacks may be attached with
//! [`Task::on_finished`]; they fire exactly once, in registration order,
//! after the task is done.
//!
//! Cancellation is cooperative: an operation that has already started
//! observes [`Task::is_running`] turning false at its next check point and
//! finishes early via [`Task::finish_cancel`], which reports the pending
//! reason (`CANCELLED`, or `DEADLINE_EXCEEDED` when a deadline fired).

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use crate::status::{Code, Status};

/// Best-effort decoding of a panic payload into a message.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Ready,
    Running,
    Cancelling,
    Done,
}

struct Inner {
    state: State,
    result: Option<Status>,
    /// Pending early-finish reason set by `cancel`/`expire` while running.
    interrupt: Option<Status>,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
    subtasks: Vec<Weak<Task>>,
}

pub struct Task {
    inner: Mutex<Inner>,
}

impl Task {
    pub fn new() -> Arc<Task> {
        Arc::new(Task {
            inner: Mutex::new(Inner {
                state: State::Ready,
                result: None,
                interrupt: None,
                callbacks: Vec::new(),
                subtasks: Vec::new(),
            }),
        })
    }

    /// Claims the task for execution.
    ///
    /// Returns true on the `ready → running` transition. Returns false if
    /// the task was cancelled before it could start (finishing it with the
    /// pending reason) or has already finished.
    pub fn start(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Ready => {
                inner.state = State::Running;
                true
            }
            State::Cancelling => {
                let reason = inner
                    .interrupt
                    .take()
                    .unwrap_or_else(Status::cancelled);
                self.finish_locked(inner, reason);
                false
            }
            State::Running => {
                error!("BUG: Task::start called twice");
                false
            }
            State::Done => false,
        }
    }

    /// Finishes the task, stamping `result`. A second finish is a logic
    /// error: it is logged and ignored.
    pub fn finish(&self, result: Status) {
        let inner = self.inner.lock().unwrap();
        match inner.state {
            State::Done => {
                error!(
                    "BUG: Task::finish called twice; dropping result {}",
                    result
                );
            }
            _ => self.finish_locked(inner, result),
        }
    }

    pub fn finish_ok(&self) {
        self.finish(Status::ok());
    }

    /// Absorbs a caught panic payload, finishing as `INTERNAL` with the
    /// message derived from it.
    pub fn finish_panic(&self, payload: Box<dyn Any + Send>) {
        self.finish(Status::internal(panic_message(payload)));
    }

    /// Finishes early with the pending cancellation reason (`CANCELLED`, or
    /// `DEADLINE_EXCEEDED` if a deadline interrupted the task).
    pub fn finish_cancel(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Done => {}
            _ => {
                let reason = inner
                    .interrupt
                    .take()
                    .unwrap_or_else(Status::cancelled);
                self.finish_locked(inner, reason);
            }
        }
    }

    /// Requests cancellation. A task that has not started finishes
    /// immediately as `CANCELLED`; a running task observes
    /// `is_running() == false` at its next cooperative check point.
    /// Cancelling a parent cancels every unfinished subtask.
    pub fn cancel(&self) {
        self.interrupt(Status::cancelled());
    }

    /// Deadline delivery: like [`Task::cancel`], but the reason is
    /// `DEADLINE_EXCEEDED`.
    pub fn expire(&self) {
        self.interrupt(Status::deadline_exceeded());
    }

    fn interrupt(&self, reason: Status) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Ready => self.finish_locked(inner, reason),
            State::Running => {
                inner.state = State::Cancelling;
                if inner.interrupt.is_none() {
                    inner.interrupt = Some(reason);
                }
                let children = std::mem::take(&mut inner.subtasks);
                drop(inner);
                cancel_children(children);
            }
            State::Cancelling | State::Done => {}
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().state == State::Running
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().state == State::Done
    }

    /// The stamped result.
    ///
    /// # Panics
    ///
    /// Panics if the task has not finished; use [`Task::try_result`] to
    /// probe.
    pub fn result(&self) -> Status {
        self.try_result().expect("Task::result called before finish")
    }

    pub fn try_result(&self) -> Option<Status> {
        self.inner.lock().unwrap().result.clone()
    }

    /// Attaches a completion callback. Callbacks run in registration order
    /// once the task is done; if it already is, the callback runs inline.
    pub fn on_finished(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == State::Done {
            drop(inner);
            callback();
        } else {
            inner.callbacks.push(Box::new(callback));
        }
    }

    /// Links `child` so that cancelling `self` cancels `child`. A child
    /// finishing has no effect on the parent.
    pub fn add_subtask(&self, child: &Arc<Task>) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            State::Cancelling => {
                drop(inner);
                child.cancel();
            }
            State::Done => {
                let cancelled = inner
                    .result
                    .as_ref()
                    .map(|r| r.code() == Code::Cancelled)
                    .unwrap_or(false);
                drop(inner);
                if cancelled {
                    child.cancel();
                }
            }
            _ => inner.subtasks.push(Arc::downgrade(child)),
        }
    }

    fn finish_locked(
        &self,
        mut inner: std::sync::MutexGuard<'_, Inner>,
        result: Status,
    ) {
        inner.state = State::Done;
        inner.result = Some(result);
        let callbacks = std::mem::take(&mut inner.callbacks);
        inner.subtasks.clear();
        drop(inner);
        for callback in callbacks {
            callback();
        }
    }
}

fn cancel_children(children: Vec<Weak<Task>>) {
    for child in children {
        if let Some(child) = child.upgrade() {
            child.cancel();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn start_finish_once() {
        let task = Task::new();
        assert!(task.start());
        assert!(task.is_running());
        task.finish_ok();
        assert!(task.is_done());
        assert!(task.result().is_ok());

        // A second finish is ignored; the first result sticks.
        task.finish(Status::internal("late"));
        assert!(task.result().is_ok());
    }

    #[test]
    fn cancel_before_start() {
        let task = Task::new();
        task.cancel();
        assert_eq!(task.result().code(), Code::Cancelled);
        assert!(!task.start());
    }

    #[test]
    fn cancel_while_running_is_cooperative() {
        let task = Task::new();
        assert!(task.start());
        task.cancel();
        assert!(!task.is_running());
        assert!(!task.is_done());
        task.finish_cancel();
        assert_eq!(task.result().code(), Code::Cancelled);
    }

    #[test]
    fn expire_reason_survives_cooperative_finish() {
        let task = Task::new();
        assert!(task.start());
        task.expire();
        assert!(!task.is_running());
        task.finish_cancel();
        assert_eq!(task.result().code(), Code::DeadlineExceeded);
    }

    #[test]
    fn expire_before_start_finishes_immediately() {
        let task = Task::new();
        task.expire();
        assert_eq!(task.result().code(), Code::DeadlineExceeded);
    }

    #[test]
    fn callbacks_fire_in_order() {
        let task = Task::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            task.on_finished(move || order.lock().unwrap().push(i));
        }
        assert!(task.start());
        task.finish_ok();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);

        // Late registration runs inline.
        let order2 = Arc::clone(&order);
        task.on_finished(move || order2.lock().unwrap().push(99));
        assert_eq!(order.lock().unwrap().last(), Some(&99));
    }

    #[test]
    fn cancel_propagates_to_subtasks() {
        let parent = Task::new();
        let child_a = Task::new();
        let child_b = Task::new();
        parent.add_subtask(&child_a);
        parent.add_subtask(&child_b);
        assert!(child_b.start());

        assert!(parent.start());
        parent.cancel();

        assert_eq!(child_a.result().code(), Code::Cancelled);
        assert!(!child_b.is_running());
        child_b.finish_cancel();
        assert_eq!(child_b.result().code(), Code::Cancelled);
    }

    #[test]
    fn child_finish_does_not_finish_parent() {
        let parent = Task::new();
        let child = Task::new();
        parent.add_subtask(&child);
        assert!(parent.start());
        assert!(child.start());
        child.finish_ok();
        assert!(!parent.is_done());
        parent.finish_ok();
    }

    #[test]
    fn unawaited_callbacks_still_run() {
        let fired = Arc::new(AtomicUsize::new(0));
        let task = Task::new();
        let fired2 = Arc::clone(&fired);
        task.on_finished(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(task.start());
        task.finish_ok();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
