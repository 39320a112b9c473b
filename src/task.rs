//! Task: one coroutine plus the scheduling metadata the event loop needs.
//!
//! # Lifecycle
//!
//! ```text
//! Pending -> Running -> { Sleeping <-> Running } -> { Completed | Failed }
//! ```
//!
//! 1. [`Scheduler::spawn`](crate::Scheduler::spawn) takes a task from the pool in `Pending`
//! 2. The first time the scheduler reaches it, [`Task::activate`] builds the coroutine
//! 3. [`Task::step`] is called once per scheduling round
//! 4. A `Sleep` signal parks it until [`Task::try_wake`] sees the deadline pass
//! 5. Terminal tasks are never queued again and go back to the pool
//!
//! Tasks are always moved as `Box<Task>`; at any instant exactly one of the
//! ready queue, the sleep queue or the pool owns a given task.

use crate::control::Value;
use crate::coroutine::{BoxCoroutine, Coroutine, Step};
use crate::error::TaskError;
use crate::runtime::Handle;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

/// Identifier of a task, unique for the lifetime of its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Sleeping,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// Factory run once on activation. It owns the task's context.
pub(crate) type Body = Box<dyn FnOnce(&Handle) -> BoxCoroutine<Value>>;

pub struct Task {
    id: TaskId,
    state: TaskState,
    body: Option<Body>,
    routine: Option<BoxCoroutine<Value>>,
    primed: Option<Result<Step<Value>, TaskError>>,
    wake_at: Option<Instant>,
    first_run: bool,
    error: Option<TaskError>,
}

impl Task {
    pub(crate) fn new(id: TaskId, body: Body) -> Self {
        Self {
            id,
            state: TaskState::Pending,
            body: Some(body),
            routine: None,
            primed: None,
            wake_at: None,
            first_run: false,
            error: None,
        }
    }

    /// Reinitializes a pooled task for a new body.
    pub(crate) fn reuse(&mut self, id: TaskId, body: Body) {
        debug_assert!(self.body.is_none() && self.routine.is_none());

        self.id = id;
        self.state = TaskState::Pending;
        self.body = Some(body);
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn wake_at(&self) -> Option<Instant> {
        self.wake_at
    }

    pub fn is_first_run(&self) -> bool {
        self.first_run
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    /// `Pending -> Running`: builds the coroutine and runs it to its first
    /// suspension point. That priming step is handed out by the next
    /// [`Task::step`] without resuming again.
    pub(crate) fn activate(&mut self, handle: &Handle) {
        debug_assert_eq!(self.state, TaskState::Pending);

        self.state = TaskState::Running;

        let Some(body) = self.body.take() else {
            self.primed = Some(Err(TaskError::msg("task activated without a body")));
            self.first_run = true;
            return;
        };

        let primed = catch_unwind(AssertUnwindSafe(|| {
            let mut routine = body(handle);
            let step = routine.resume();
            (routine, step)
        }));

        self.primed = Some(match primed {
            Ok((routine, step)) => {
                self.routine = Some(routine);
                step
            }
            Err(payload) => Err(TaskError::from_panic(payload)),
        });
        self.first_run = true;
    }

    /// Advances the coroutine by one suspension point.
    pub(crate) fn step(&mut self) -> Result<Step<Value>, TaskError> {
        debug_assert_eq!(self.state, TaskState::Running);

        if self.first_run {
            self.first_run = false;
            if let Some(primed) = self.primed.take() {
                return primed;
            }
        }

        let Some(routine) = self.routine.as_mut() else {
            return Err(TaskError::msg("task stepped without a coroutine"));
        };

        catch_unwind(AssertUnwindSafe(|| routine.resume()))
            .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)))
    }

    /// Value reported when the coroutine yields `Cancel`.
    pub(crate) fn current_value(&mut self) -> Value {
        self.routine
            .as_mut()
            .and_then(|routine| catch_unwind(AssertUnwindSafe(|| routine.current())).ok())
            .flatten()
            .unwrap_or_else(|| Box::new(()))
    }

    pub(crate) fn sleep_until(&mut self, deadline: Instant) {
        self.state = TaskState::Sleeping;
        self.wake_at = Some(deadline);
    }

    /// `Sleeping -> Running` iff the deadline has passed.
    pub(crate) fn try_wake(&mut self, now: Instant) -> bool {
        if self.state != TaskState::Sleeping {
            return false;
        }

        match self.wake_at {
            Some(deadline) if now < deadline => false,
            _ => {
                self.state = TaskState::Running;
                self.wake_at = None;
                true
            }
        }
    }

    pub(crate) fn complete(&mut self) {
        self.state = TaskState::Completed;
        self.routine = None;
    }

    pub(crate) fn fail(&mut self, error: TaskError) {
        self.state = TaskState::Failed;
        self.routine = None;
        self.error = Some(error);
    }

    /// Clears every mutable field so nothing leaks into the next reuse.
    pub(crate) fn reset(&mut self) {
        self.body = None;
        self.routine = None;
        self.primed = None;
        self.wake_at = None;
        self.first_run = false;
        self.error = None;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("wake_at", &self.wake_at)
            .field("first_run", &self.first_run)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Adapter boxing a typed coroutine's output into a [`Value`].
pub(crate) struct Erased<C> {
    inner: C,
}

impl<C> Erased<C> {
    pub(crate) fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C> Coroutine for Erased<C>
where
    C: Coroutine,
    C::Output: 'static,
{
    type Output = Value;

    fn resume(&mut self) -> Result<Step<Value>, TaskError> {
        Ok(self.inner.resume()?.map(|value| Box::new(value) as Value))
    }

    fn current(&mut self) -> Option<Value> {
        self.inner.current().map(|value| Box::new(value) as Value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Control;
    use crate::coroutine::{self, from_fn};
    use crate::runtime::Scheduler;

    use std::time::Duration;

    fn body<C>(routine: C) -> Body
    where
        C: Coroutine + 'static,
        C::Output: 'static,
    {
        Box::new(move |_: &Handle| -> BoxCoroutine<Value> { Box::new(Erased::new(routine)) })
    }

    #[test]
    fn priming_step_is_not_resumed_twice() {
        let scheduler = Scheduler::new();
        let mut calls = 0;
        let mut task = Task::new(
            TaskId(1),
            body(from_fn(move || {
                calls += 1;
                if calls == 1 {
                    Ok(Step::Suspend(Control::Yield))
                } else {
                    Ok(Step::Complete(calls))
                }
            })),
        );

        task.activate(&scheduler.handle());
        assert_eq!(task.state(), TaskState::Running);
        assert!(task.is_first_run());

        assert!(matches!(task.step(), Ok(Step::Suspend(Control::Yield))));
        assert!(!task.is_first_run());

        match task.step() {
            Ok(Step::Complete(value)) => assert_eq!(value.downcast_ref::<i32>(), Some(&2)),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn try_wake_respects_deadline() {
        let scheduler = Scheduler::new();
        let mut task = Task::new(TaskId(2), body(coroutine::ready(())));
        task.activate(&scheduler.handle());

        let now = Instant::now();
        task.sleep_until(now + Duration::from_secs(60));
        assert_eq!(task.state(), TaskState::Sleeping);
        assert!(!task.try_wake(now));
        assert!(task.try_wake(now + Duration::from_secs(61)));
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(task.wake_at(), None);
    }

    #[test]
    fn panics_become_task_errors() {
        let scheduler = Scheduler::new();
        let mut task = Task::new(
            TaskId(3),
            body(from_fn(|| -> Result<Step<()>, TaskError> { panic!("kaboom") })),
        );

        task.activate(&scheduler.handle());
        let err = task.step().unwrap_err();
        assert_eq!(err.to_string(), "task panicked: kaboom");
    }

    #[test]
    fn reset_clears_everything() {
        let mut task = Task::new(TaskId(4), body(coroutine::ready(())));
        task.sleep_until(Instant::now());
        task.fail(TaskError::msg("x"));
        task.reset();

        assert!(task.error().is_none());
        assert!(task.wake_at().is_none());
        assert!(!task.is_first_run());
        assert!(task.body.is_none());
    }
}
