//! Shared scheduler state and the [`Handle`] that reaches it.
//!
//! A [`Scheduler`](super::Scheduler) owns its ready and sleep queues
//! directly. Everything code running *inside* the loop must be able to touch
//! (spawning, stopping, registering streams and signals) lives in [`Shared`]
//! behind an `Rc`, and is reached through a cloneable [`Handle`].
//!
//! While [`Scheduler::run`](super::Scheduler::run) is executing, its handle is
//! also installed in a thread-local so free functions such as
//! [`spawn`](crate::spawn) work without passing the handle around.

use crate::coroutine::{BoxCoroutine, Coroutine};
use crate::error::ListenerResult;
use crate::reactor::{Direction, ListenerId, Multiplexer};
use crate::runtime::pool::TaskPool;
use crate::task::{Body, Erased, Task, TaskId};
use crate::control::Value;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use tracing::debug;

thread_local! {
    /// Handle of the scheduler currently running on this thread.
    static CURRENT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

pub(crate) struct Shared {
    pub(crate) multiplexer: Multiplexer,
    /// Tasks spawned since the scheduler last admitted new work.
    pub(crate) incoming: RefCell<VecDeque<Box<Task>>>,
    pub(crate) pool: RefCell<TaskPool>,
    pub(crate) running: Cell<bool>,
    pub(crate) close_requested: Cell<bool>,
    next_id: Cell<u64>,
}

impl Shared {
    pub(crate) fn new(pool_capacity: usize) -> Self {
        Self {
            multiplexer: Multiplexer::new(),
            incoming: RefCell::new(VecDeque::new()),
            pool: RefCell::new(TaskPool::new(pool_capacity)),
            running: Cell::new(false),
            close_requested: Cell::new(false),
            next_id: Cell::new(1),
        }
    }

    fn next_id(&self) -> TaskId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        TaskId(id)
    }
}

/// Cloneable reference to a scheduler's shared state.
///
/// Task factories receive one on activation, and listeners typically capture
/// one to spawn follow-up work. A handle is confined to the scheduler's thread.
#[derive(Clone)]
pub struct Handle {
    shared: Rc<Shared>,
}

impl Handle {
    pub(crate) fn new(shared: Rc<Shared>) -> Self {
        Self { shared }
    }

    /// Returns the handle of the scheduler running on this thread, if any.
    pub fn current() -> Option<Handle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Enqueues a new task and returns its id. Nothing runs until the
    /// scheduler reaches the task; `body` is invoked once on activation with
    /// `context` and this handle.
    pub fn spawn<C, F, R>(&self, body: F, context: C) -> TaskId
    where
        C: 'static,
        F: FnOnce(C, &Handle) -> R + 'static,
        R: Coroutine + 'static,
        R::Output: 'static,
    {
        let body: Body = Box::new(move |handle: &Handle| -> BoxCoroutine<Value> {
            Box::new(Erased::new(body(context, handle)))
        });

        let id = self.shared.next_id();
        let task = self.shared.pool.borrow_mut().acquire(id, body);
        self.shared.incoming.borrow_mut().push_back(task);

        debug!(task = %id, "spawned");
        id
    }

    /// Asks the loop to return once the current batch has finished.
    ///
    /// Called from a task, the loop ends right after that task's batch even
    /// when only idle streams remain. Has no effect while the loop is not
    /// running, since [`Scheduler::run`](super::Scheduler::run) starts with
    /// the flag raised.
    pub fn stop(&self) {
        self.shared.running.set(false);
    }

    /// Stops the loop, drops every registration and forgets all pending
    /// and sleeping tasks without running them.
    pub fn close(&self) {
        self.shared.running.set(false);
        self.shared.close_requested.set(true);

        let forgotten = mem::take(&mut *self.shared.incoming.borrow_mut());
        drop(forgotten);

        self.shared.multiplexer.close();
    }

    /// Whether the scheduler's loop is running and no stop has been asked for.
    pub fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    /// The multiplexer shared with the scheduler.
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.shared.multiplexer
    }

    /// Registers a readable listener; a no-op returning `false` if the
    /// descriptor already has one.
    pub fn add_read_stream<S, F>(&self, stream: &S, listener: F) -> bool
    where
        S: AsRawFd + ?Sized,
        F: FnMut(RawFd) -> ListenerResult + 'static,
    {
        self.shared
            .multiplexer
            .on_readable(stream.as_raw_fd(), listener)
    }

    /// Registers a writable listener; a no-op returning `false` if the
    /// descriptor already has one.
    pub fn add_write_stream<S, F>(&self, stream: &S, listener: F) -> bool
    where
        S: AsRawFd + ?Sized,
        F: FnMut(RawFd) -> ListenerResult + 'static,
    {
        self.shared
            .multiplexer
            .on_writable(stream.as_raw_fd(), listener)
    }

    /// Removes the read listener of `stream`, returning whether one existed.
    /// Safe to call from inside that listener.
    pub fn remove_read_stream<S: AsRawFd + ?Sized>(&self, stream: &S) -> bool {
        self.shared
            .multiplexer
            .remove(stream.as_raw_fd(), Direction::Read)
    }

    /// Removes the write listener of `stream`, returning whether one existed.
    pub fn remove_write_stream<S: AsRawFd + ?Sized>(&self, stream: &S) -> bool {
        self.shared
            .multiplexer
            .remove(stream.as_raw_fd(), Direction::Write)
    }

    /// Appends a listener for `signum` and returns the id that removes it.
    ///
    /// # Errors
    ///
    /// Fails if the signal handler cannot be installed.
    pub fn add_signal<F>(&self, signum: libc::c_int, listener: F) -> io::Result<ListenerId>
    where
        F: FnMut(libc::c_int) -> ListenerResult + 'static,
    {
        self.shared.multiplexer.on_signal(signum, listener)
    }

    /// Removes one signal listener. The previous disposition of `signum` is
    /// restored once its last listener is gone.
    pub fn remove_signal(&self, signum: libc::c_int, listener: ListenerId) -> bool {
        self.shared.multiplexer.off_signal(signum, listener)
    }
}

/// Installs `handle` as the current scheduler for the duration of `function`,
/// restoring the previous one afterwards.
pub(crate) fn enter_context<F, R>(handle: Handle, function: F) -> R
where
    F: FnOnce() -> R,
{
    struct Restore(Option<Handle>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            CURRENT.with(|current| *current.borrow_mut() = previous);
        }
    }

    let previous = CURRENT.with(|current| current.borrow_mut().replace(handle));
    let _restore = Restore(previous);

    function()
}
