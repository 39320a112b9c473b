//! Error types shared by the scheduler, the multiplexer and the result pipeline.

use std::io;

use thiserror::Error;

/// Boxed error type returned by stream and signal listeners.
pub type BoxError = Box<dyn std::error::Error + 'static>;

/// Return type of every stream and signal listener.
pub type ListenerResult = Result<(), BoxError>;

/// Failure of a single task, or of a pipeline stage inside a [`FutureResult`].
///
/// Task errors never cross task boundaries: the scheduler captures them in the
/// failing task and hands them to that task's deferred callbacks.
///
/// [`FutureResult`]: crate::FutureResult
#[derive(Debug, Error)]
pub enum TaskError {
    /// Plain failure raised by a coroutine or a pipeline callback.
    #[error("{0}")]
    Failed(String),

    /// A coroutine panicked while being resumed.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Raised by [`FutureResult::expect`](crate::FutureResult::expect).
    #[error("{message}")]
    Expect {
        message: String,
        #[source]
        source: Box<TaskError>,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(BoxError),
}

impl TaskError {
    /// Shorthand for [`TaskError::Failed`].
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "non-string panic payload".to_string()
        };

        TaskError::Panicked(message)
    }
}

/// Invalid scheduler configuration. Always reported synchronously.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    #[error("iteration limit must be at least 1")]
    ZeroIterationLimit,

    #[error("pool capacity must be at least 1")]
    ZeroPoolCapacity,

    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Errors that abort [`Scheduler::run`](crate::Scheduler::run).
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The readiness syscall itself failed (anything other than `EINTR`).
    #[error("readiness wait failed: {0}")]
    Poll(#[source] io::Error),
}
