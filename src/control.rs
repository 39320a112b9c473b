//! Control signals a coroutine yields to the scheduler.
//!
//! Every suspension point of a [`Coroutine`](crate::Coroutine) produces one
//! [`Control`]. The scheduler matches on it exhaustively:
//!
//! - [`Control::Yield`]: plain cooperative yield, the task is retried next cycle
//! - [`Control::Sleep`]: park the task until the duration has elapsed
//! - [`Control::Defer`]: register a callback fired once the task is terminal
//! - [`Control::Cancel`]: finish now with whatever value is already available

use crate::error::TaskError;

use std::any::Any;
use std::fmt;
use std::time::Duration;

/// Type-erased final value of a task.
pub type Value = Box<dyn Any>;

/// Final result of a task as seen by its deferred callbacks.
pub type Outcome<'a> = Result<&'a Value, &'a TaskError>;

/// Callback registered through [`Control::Defer`].
pub type DeferFn = Box<dyn FnOnce(Outcome<'_>)>;

pub enum Control {
    Yield,
    Sleep(Duration),
    Defer(DeferFn),
    Cancel,
}

impl Control {
    /// Sleep for a fractional number of seconds. Negative or NaN durations
    /// are treated as zero; durations too large to represent saturate.
    pub fn sleep_secs(seconds: f64) -> Self {
        if seconds.is_nan() || seconds <= 0.0 {
            return Control::Sleep(Duration::ZERO);
        }

        Control::Sleep(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
    }

    pub fn defer<F>(callback: F) -> Self
    where
        F: FnOnce(Outcome<'_>) + 'static,
    {
        Control::Defer(Box::new(callback))
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Yield => f.write_str("Yield"),
            Control::Sleep(duration) => f.debug_tuple("Sleep").field(duration).finish(),
            Control::Defer(_) => f.write_str("Defer(..)"),
            Control::Cancel => f.write_str("Cancel"),
        }
    }
}
