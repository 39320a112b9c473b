//! Readiness reactor.
//!
//! - [`core`]: the [`Multiplexer`] holding stream and signal listeners
//! - [`event`]: `poll(2)` wrappers
//! - [`signal`]: self-pipe delivery of OS signals

pub mod core;
pub(crate) mod event;
pub(crate) mod signal;

pub use self::core::{Direction, ListenerId, Multiplexer, SignalListener, StreamListener};
pub use event::set_nonblocking;
