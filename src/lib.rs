//! Single-threaded cooperative task scheduler with a readiness-based I/O loop.
//!
//! This crate runs many logical operations (timers, descriptor I/O, deferred
//! cleanup) on one thread. Work is expressed as resumable computations that
//! suspend at explicit points and tell the scheduler what they want next.
//!
//! # Architecture
//!
//! - **Control**: what a suspended computation asks for (yield, sleep, defer, cancel)
//! - **Coroutine**: the resumable computation trait plus combinators
//! - **Task**: one computation with its scheduling state
//! - **TaskPool**: recycles retired tasks
//! - **Multiplexer**: descriptor and signal listeners behind one blocking wait
//! - **Scheduler**: the step-and-requeue loop tying it all together
//! - **FutureResult**: a computation plus a pipeline of stages and drive policies
//! - **SchedulerBuilder**: fluent, validated construction
//!
//! # Example
//! ```ignore
//! use spindle::{Scheduler, coroutine};
//! use std::time::Duration;
//!
//! let mut scheduler = Scheduler::new();
//! scheduler.spawn(
//!     |name: &str, _| coroutine::sleep(Duration::from_millis(10)).map(move |()| name.len()),
//!     "timer",
//! );
//! scheduler.run()?;
//! ```

mod builder;
pub mod control;
pub mod coroutine;
pub mod error;
pub mod reactor;
pub mod result;
pub mod runtime;
pub mod task;

pub use builder::{SchedulerBuilder, SchedulerConfig};
pub use control::{Control, Outcome, Value};
pub use coroutine::{Coroutine, Step};
pub use error::{ConfigError, Error, ListenerResult, TaskError};
pub use reactor::{Direction, ListenerId, Multiplexer};
pub use result::{FutureResult, Stage};
pub use runtime::{Handle, Scheduler, Stats, TaskPool};
pub use task::{TaskId, TaskState};

/// Spawns a task on the scheduler running on this thread.
///
/// # Panics
/// Panics when called outside of [`Scheduler::run`].
pub fn spawn<C, F, R>(body: F, context: C) -> TaskId
where
    C: 'static,
    F: FnOnce(C, &Handle) -> R + 'static,
    R: Coroutine + 'static,
    R::Output: 'static,
{
    let Some(handle) = Handle::current() else {
        panic!("spawn() called outside of a runtime context");
    };

    handle.spawn(body, context)
}
