//! Runtime subsystem modules.

pub(crate) mod context;
mod core;
pub mod pool;
pub(crate) mod queue;

pub use context::Handle;
pub use self::core::{Scheduler, Stats};
pub use pool::TaskPool;
