//! Cooperative scheduler and event loop.
//!
//! The scheduler owns a FIFO of ready tasks and a deadline-ordered set of
//! sleeping ones. [`Scheduler::run`] repeats the same iteration until it is
//! stopped or runs out of work:
//!
//! 1. admit freshly spawned tasks and wake sleepers whose deadline passed
//! 2. step up to `batch_size` ready tasks once each, re-queueing survivors
//!    at the tail
//! 3. pick a wait timeout and block in the [`Multiplexer`](crate::Multiplexer)
//!    until I/O, a signal, or the timeout
//!
//! The loop ends by itself when no task is ready, sleeping or incoming and
//! no stream or signal is registered.

use crate::builder::SchedulerConfig;
use crate::control::{Control, DeferFn, Outcome, Value};
use crate::coroutine::{Coroutine, Step};
use crate::error::{ConfigError, Error, ListenerResult, TaskError};
use crate::reactor::{ListenerId, Multiplexer};
use crate::runtime::context::{Handle, Shared, enter_context};
use crate::runtime::queue::{ReadyQueue, SleepQueue};
use crate::task::{Task, TaskId, TaskState};

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

/// Shortest wait used once the loop starts idling with sleepers pending.
const BASE_IDLE_WAIT: Duration = Duration::from_millis(1);

/// Upper bound for deadlines too far away to represent.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Read-only snapshot returned by [`Scheduler::stats`].
///
/// `ready_count` includes tasks spawned but not yet admitted. The task
/// counters and `iterations` are cumulative over the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub ready_count: usize,
    pub sleeping_count: usize,
    pub deferred_count: usize,
    pub stream_registrations: usize,
    pub signal_registrations: usize,
    pub tasks_created: u64,
    pub tasks_reused: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub iterations: u64,
}

/// Single-threaded cooperative scheduler.
///
/// # Example
///
/// ```
/// use spindle::Scheduler;
/// use spindle::coroutine;
///
/// let mut scheduler = Scheduler::new();
/// scheduler.spawn(|name, _| coroutine::ready(format!("hello {name}")), "spindle");
/// scheduler.run().unwrap();
/// assert_eq!(scheduler.stats().tasks_completed, 1);
/// ```
pub struct Scheduler {
    shared: Rc<Shared>,
    handle: Handle,
    ready: ReadyQueue,
    sleeping: SleepQueue,
    deferred: HashMap<TaskId, Vec<DeferFn>>,
    batch_size: usize,
    iteration_limit: Option<usize>,
    max_idle_wait: Duration,
    idle_cycles: u32,
    iterations: u64,
    completed: u64,
    failed: u64,
}

impl Scheduler {
    /// Creates a scheduler with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Creates a scheduler from an already validated configuration.
    ///
    /// Use [`SchedulerBuilder`](crate::SchedulerBuilder) to get validation.
    pub fn with_config(config: SchedulerConfig) -> Self {
        let shared = Rc::new(Shared::new(config.pool_capacity.max(1)));
        let handle = Handle::new(shared.clone());

        Self {
            shared,
            handle,
            ready: ReadyQueue::new(),
            sleeping: SleepQueue::new(),
            deferred: HashMap::new(),
            batch_size: config.batch_size.max(1),
            iteration_limit: config.iteration_limit,
            max_idle_wait: config.max_idle_wait,
            idle_cycles: 0,
            iterations: 0,
            completed: 0,
            failed: 0,
        }
    }

    /// Returns a handle that spawns, stops and registers listeners on this
    /// scheduler, usable from inside tasks and listeners.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// The multiplexer the loop waits on between batches.
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.shared.multiplexer
    }

    /// Enqueues a task; see [`Handle::spawn`].
    pub fn spawn<C, F, R>(&self, body: F, context: C) -> TaskId
    where
        C: 'static,
        F: FnOnce(C, &Handle) -> R + 'static,
        R: Coroutine + 'static,
        R::Output: 'static,
    {
        self.handle.spawn(body, context)
    }

    /// Makes [`run`](Self::run) return after the batch in progress.
    ///
    /// The flag belongs to the run in progress: every call to `run` starts
    /// with it raised, so a stop issued while the loop is not running has
    /// no effect on the next run.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Stops the loop, drops all registrations and forgets every pending and
    /// sleeping task. Deferred callbacks of forgotten tasks never fire.
    pub fn close(&mut self) {
        self.handle.close();
        self.shared.close_requested.set(false);
        self.forget_tasks();
    }

    /// Sets how many ready tasks are stepped per iteration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroBatchSize`] for `0`; the previous size is kept.
    pub fn set_batch_size(&mut self, batch_size: usize) -> Result<(), ConfigError> {
        if batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        self.batch_size = batch_size;
        Ok(())
    }

    /// Current batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Caps every subsequent [`run`](Self::run) call to `limit` iterations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ZeroIterationLimit`] for `0`.
    pub fn set_iteration_limit(&mut self, limit: usize) -> Result<(), ConfigError> {
        if limit == 0 {
            return Err(ConfigError::ZeroIterationLimit);
        }

        self.iteration_limit = Some(limit);
        Ok(())
    }

    /// Removes the iteration cap; `run` goes until stopped or out of work.
    pub fn reset_iteration_limit(&mut self) {
        self.iteration_limit = None;
    }

    /// Registers a read listener for `stream`.
    ///
    /// # Arguments
    ///
    /// * `stream` - Anything exposing a descriptor; only the raw fd is kept
    /// * `listener` - Invoked with the fd each time it polls readable
    ///
    /// # Returns
    ///
    /// `false` if the descriptor already has a read listener; the first
    /// registration stays in place and `listener` is dropped.
    pub fn add_read_stream<S, F>(&self, stream: &S, listener: F) -> bool
    where
        S: AsRawFd + ?Sized,
        F: FnMut(RawFd) -> ListenerResult + 'static,
    {
        self.handle.add_read_stream(stream, listener)
    }

    /// Write-side counterpart of [`add_read_stream`](Self::add_read_stream).
    pub fn add_write_stream<S, F>(&self, stream: &S, listener: F) -> bool
    where
        S: AsRawFd + ?Sized,
        F: FnMut(RawFd) -> ListenerResult + 'static,
    {
        self.handle.add_write_stream(stream, listener)
    }

    /// Removes the read listener of `stream`; returns whether one existed.
    pub fn remove_read_stream<S: AsRawFd + ?Sized>(&self, stream: &S) -> bool {
        self.handle.remove_read_stream(stream)
    }

    /// Removes the write listener of `stream`; returns whether one existed.
    pub fn remove_write_stream<S: AsRawFd + ?Sized>(&self, stream: &S) -> bool {
        self.handle.remove_write_stream(stream)
    }

    /// Appends a listener for `signum`. Listeners of one signal run in
    /// registration order.
    ///
    /// # Errors
    ///
    /// Fails if the process handler cannot be installed, e.g. for `SIGKILL`.
    pub fn add_signal<F>(&self, signum: libc::c_int, listener: F) -> io::Result<ListenerId>
    where
        F: FnMut(libc::c_int) -> ListenerResult + 'static,
    {
        self.handle.add_signal(signum, listener)
    }

    /// Removes the signal listener `listener` returned by
    /// [`add_signal`](Self::add_signal).
    pub fn remove_signal(&self, signum: libc::c_int, listener: ListenerId) -> bool {
        self.handle.remove_signal(signum, listener)
    }

    /// Takes a snapshot of queue sizes, registrations and counters.
    pub fn stats(&self) -> Stats {
        let pool = self.shared.pool.borrow();
        let multiplexer = &self.shared.multiplexer;

        Stats {
            ready_count: self.ready.len() + self.shared.incoming.borrow().len(),
            sleeping_count: self.sleeping.len(),
            deferred_count: self.deferred.values().map(Vec::len).sum(),
            stream_registrations: multiplexer.stream_count(),
            signal_registrations: multiplexer.signal_count(),
            tasks_created: pool.created(),
            tasks_reused: pool.reused(),
            tasks_completed: self.completed,
            tasks_failed: self.failed,
            iterations: self.iterations,
        }
    }

    /// Runs the loop until stopped, closed, out of work, or out of iterations.
    ///
    /// Task and listener failures are contained; only a failing readiness
    /// syscall ends the loop with an error.
    pub fn run(&mut self) -> Result<(), Error> {
        let handle = self.handle.clone();
        enter_context(handle, || self.run_loop())
    }

    fn run_loop(&mut self) -> Result<(), Error> {
        self.shared.running.set(true);
        self.idle_cycles = 0;

        let mut iterations = 0usize;
        debug!(batch_size = self.batch_size, "scheduler started");

        loop {
            if self.shared.close_requested.replace(false) {
                self.forget_tasks();
            }

            if !self.shared.running.get() {
                debug!("scheduler stopped");
                break;
            }

            if let Some(limit) = self.iteration_limit
                && iterations >= limit
            {
                debug!(limit, "iteration limit reached");
                break;
            }

            iterations += 1;
            self.iterations += 1;

            self.admit_spawned();
            self.wake_sleepers(Instant::now());

            let stepped = self.run_batch();
            self.admit_spawned();

            // A stop or close issued during the batch ends the loop before
            // it can block in the wait.
            if self.shared.close_requested.get() || !self.shared.running.get() {
                continue;
            }

            if self.is_exhausted() {
                debug!("no work left");
                break;
            }

            let timeout = self.next_timeout();
            trace!(?timeout, ready = self.ready.len(), "waiting for activity");

            let fired = self.shared.multiplexer.wait(timeout).map_err(Error::Poll)?;

            if stepped == 0 && fired == 0 {
                self.idle_cycles = self.idle_cycles.saturating_add(1);
            } else {
                self.idle_cycles = 0;
            }
        }

        self.shared.running.set(false);
        Ok(())
    }

    fn admit_spawned(&mut self) {
        let mut incoming = self.shared.incoming.borrow_mut();
        self.ready.extend(incoming.drain(..));
    }

    fn wake_sleepers(&mut self, now: Instant) {
        while let Some(task) = self.sleeping.pop_expired(now) {
            trace!(task = %task.id(), "woke");
            self.ready.push(task);
        }
    }

    /// Steps each task that was ready when the batch started exactly once.
    fn run_batch(&mut self) -> usize {
        let count = self.ready.len().min(self.batch_size);
        let mut stepped = 0;

        for _ in 0..count {
            let Some(task) = self.ready.pop() else {
                break;
            };

            self.step_task(task);
            stepped += 1;
        }

        stepped
    }

    fn step_task(&mut self, mut task: Box<Task>) {
        if task.state() == TaskState::Pending {
            task.activate(&self.handle);
        }

        let id = task.id();

        match task.step() {
            Ok(Step::Complete(value)) => self.finish(task, Ok(value)),
            Ok(Step::Suspend(Control::Yield)) => self.ready.push(task),
            Ok(Step::Suspend(Control::Sleep(duration))) => {
                let now = Instant::now();
                let deadline = now
                    .checked_add(duration)
                    .unwrap_or_else(|| now + FAR_FUTURE);

                trace!(task = %id, ?duration, "sleeping");
                task.sleep_until(deadline);
                self.sleeping.push(task);
            }
            Ok(Step::Suspend(Control::Defer(callback))) => {
                trace!(task = %id, "deferred callback registered");
                self.deferred.entry(id).or_default().push(callback);
                self.ready.push(task);
            }
            Ok(Step::Suspend(Control::Cancel)) => {
                trace!(task = %id, "cancelled");
                let value = task.current_value();
                self.finish(task, Ok(value));
            }
            Err(err) => self.finish(task, Err(err)),
        }
    }

    /// Moves a task to its terminal state, fires its deferred callbacks and
    /// returns it to the pool.
    fn finish(&mut self, mut task: Box<Task>, result: Result<Value, TaskError>) {
        let id = task.id();
        let callbacks = self.deferred.remove(&id).unwrap_or_default();

        match result {
            Ok(value) => {
                task.complete();
                self.completed += 1;
                debug!(task = %id, "completed");
                fire_deferred(id, callbacks, Ok(&value));
            }
            Err(err) => {
                error!(task = %id, error = %err, "task failed");
                task.fail(err);
                self.failed += 1;
                if let Some(err) = task.error() {
                    fire_deferred(id, callbacks, Err(err));
                }
            }
        }

        self.shared.pool.borrow_mut().release(task);
    }

    fn forget_tasks(&mut self) {
        let forgotten = self.ready.len() + self.sleeping.len();
        if forgotten > 0 {
            debug!(forgotten, "dropping unfinished tasks");
        }

        self.ready.clear();
        self.sleeping.clear();
        self.deferred.clear();

        let incoming = mem::take(&mut *self.shared.incoming.borrow_mut());
        drop(incoming);
    }

    fn is_exhausted(&self) -> bool {
        self.ready.is_empty()
            && self.sleeping.is_empty()
            && self.shared.incoming.borrow().is_empty()
            && !self.shared.multiplexer.has_streams()
            && !self.shared.multiplexer.has_signals()
    }

    /// Zero with work ready, unbounded with only I/O interest, otherwise a
    /// backoff that doubles per idle iteration, clamped to the next deadline.
    fn next_timeout(&self) -> Option<Duration> {
        if !self.ready.is_empty() || !self.shared.incoming.borrow().is_empty() {
            return Some(Duration::ZERO);
        }

        let deadline = self.sleeping.next_deadline()?;
        let until_deadline = deadline.saturating_duration_since(Instant::now());

        let backoff = BASE_IDLE_WAIT
            .checked_mul(1u32 << self.idle_cycles.min(16))
            .unwrap_or(self.max_idle_wait)
            .min(self.max_idle_wait);

        Some(backoff.min(until_deadline))
    }
}

fn fire_deferred(id: TaskId, callbacks: Vec<DeferFn>, outcome: Outcome<'_>) {
    for callback in callbacks {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
            let err = TaskError::from_panic(payload);
            error!(task = %id, error = %err, "deferred callback panicked");
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    // Tasks and listeners usually hold handles back into `shared`.
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine;

    use std::cell::{Cell, RefCell};

    #[test]
    fn spawn_does_not_run_synchronously() {
        let scheduler = Scheduler::new();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();

        scheduler.spawn(
            move |(), _| {
                flag.set(true);
                coroutine::ready(())
            },
            (),
        );

        assert!(!ran.get());
        assert_eq!(scheduler.stats().ready_count, 1);
    }

    #[test]
    fn stop_outside_run_is_not_carried_over() {
        let mut scheduler = Scheduler::new();
        scheduler.stop();
        scheduler.spawn(|(), _| coroutine::ready(()), ());

        scheduler.run().unwrap();

        assert_eq!(scheduler.stats().tasks_completed, 1);
        assert!(!scheduler.handle().is_running());
    }

    #[test]
    fn config_violations_are_immediate() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.set_batch_size(0), Err(ConfigError::ZeroBatchSize));
        assert_eq!(
            scheduler.set_iteration_limit(0),
            Err(ConfigError::ZeroIterationLimit)
        );
        assert!(scheduler.set_batch_size(8).is_ok());
        assert_eq!(scheduler.batch_size(), 8);
    }

    #[test]
    fn timeout_is_zero_with_ready_work() {
        let mut scheduler = Scheduler::new();
        scheduler.spawn(|(), _| coroutine::ready(()), ());
        scheduler.admit_spawned();
        assert_eq!(scheduler.next_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn timeout_backs_off_and_respects_deadlines() {
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.next_timeout(), None);

        scheduler.spawn(|(), _| coroutine::sleep(Duration::from_secs(30)), ());
        scheduler.admit_spawned();
        scheduler.run_batch();
        assert_eq!(scheduler.sleeping.len(), 1);

        scheduler.idle_cycles = 0;
        assert_eq!(scheduler.next_timeout(), Some(BASE_IDLE_WAIT));

        scheduler.idle_cycles = 3;
        assert_eq!(scheduler.next_timeout(), Some(Duration::from_millis(8)));

        scheduler.idle_cycles = 30;
        assert_eq!(scheduler.next_timeout(), Some(scheduler.max_idle_wait));
    }

    #[test]
    fn deferred_callbacks_see_failures() {
        let mut scheduler = Scheduler::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();

        scheduler.spawn(
            move |(), _| {
                coroutine::defer(move |outcome| {
                    log.borrow_mut().push(outcome.map(|_| ()).map_err(|e| e.to_string()));
                })
                .then(|()| coroutine::fail::<()>(TaskError::msg("bad input")))
            },
            (),
        );

        scheduler.run().unwrap();

        assert_eq!(*seen.borrow(), vec![Err("bad input".to_string())]);
        let stats = scheduler.stats();
        assert_eq!((stats.tasks_completed, stats.tasks_failed), (0, 1));
    }
}
