//! Future/Result continuation pipeline.
//!
//! A [`FutureResult`] wraps a factory for one resumable computation plus an
//! ordered list of transformation stages. Building one is cheap and starts
//! nothing. Each drive operation ([`unwrap`](FutureResult::unwrap),
//! [`unwrap_or`](FutureResult::unwrap_or), [`expect`](FutureResult::expect),
//! [`invoke`](FutureResult::invoke)) returns a fresh coroutine that re-runs the
//! computation and replays every stage; nothing is memoized between drives.
//!
//! Drives are meant to be delegated to from inside a running task:
//!
//! ```ignore
//! let lookup = FutureResult::new(|| resolve("example.org"))
//!     .map(|addr| Ok(Stage::Value(addr)))
//!     .map(|addr| Ok(Stage::Routine(connect(addr).boxed())));
//!
//! scheduler.spawn(move |(), _| lookup.unwrap_or(fallback()), ());
//! ```
//!
//! A stage that fails short-circuits the pipeline: the error becomes the
//! running value and the remaining stages are skipped. Only the drive
//! operation decides whether it surfaces as a task failure.

use crate::coroutine::{BoxCoroutine, Coroutine, Step};
use crate::error::TaskError;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use tracing::trace;

/// What a stage hands to the next one.
pub enum Stage<T> {
    /// A plain value, fed to the next stage immediately.
    Value(T),
    /// A computation delegated to completion first; its result is fed on.
    Routine(BoxCoroutine<T>),
}

impl<T> Stage<T> {
    pub fn routine<C>(routine: C) -> Self
    where
        C: Coroutine<Output = T> + 'static,
    {
        Stage::Routine(Box::new(routine))
    }
}

type Factory<T> = Rc<dyn Fn() -> BoxCoroutine<T>>;
type Callback<T> = Rc<dyn Fn(T) -> Result<Stage<T>, TaskError>>;

pub struct FutureResult<T> {
    factory: Factory<T>,
    callbacks: Vec<Callback<T>>,
}

impl<T> Clone for FutureResult<T> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            callbacks: self.callbacks.clone(),
        }
    }
}

impl<T: 'static> FutureResult<T> {
    /// Wraps the computation produced by `factory`. The factory is called once
    /// per drive, never here.
    pub fn new<F, C>(factory: F) -> Self
    where
        F: Fn() -> C + 'static,
        C: Coroutine<Output = T> + 'static,
    {
        Self {
            factory: Rc::new(move || -> BoxCoroutine<T> { Box::new(factory()) }),
            callbacks: Vec::new(),
        }
    }

    /// Appends a stage to the pipeline.
    pub fn map<F>(mut self, callback: F) -> Self
    where
        F: Fn(T) -> Result<Stage<T>, TaskError> + 'static,
    {
        self.callbacks.push(Rc::new(callback));
        self
    }

    pub fn stages(&self) -> usize {
        self.callbacks.len()
    }

    /// Drives to completion, failing the caller with the pipeline's error.
    pub fn unwrap(&self) -> Drive<T, Unwrap> {
        self.drive(Unwrap)
    }

    /// Drives to completion, substituting `default` for any error.
    pub fn unwrap_or(&self, default: T) -> Drive<T, UnwrapOr<T>> {
        self.drive(UnwrapOr(default))
    }

    /// Drives to completion, failing with `message` and the error as its source.
    pub fn expect(&self, message: impl Into<String>) -> Drive<T, Expect> {
        self.drive(Expect(message.into()))
    }

    /// Drives to completion and returns the error's message instead of failing.
    pub fn invoke(&self) -> Drive<T, Invoke> {
        self.drive(Invoke)
    }

    fn drive<P: Settle<T>>(&self, policy: P) -> Drive<T, P> {
        Drive {
            factory: self.factory.clone(),
            callbacks: self.callbacks.clone(),
            state: DriveState::Start,
            policy: Some(policy),
        }
    }
}

/// How a drive turns the pipeline's final result into its own output.
pub trait Settle<T> {
    type Output;

    fn settle(self, result: Result<T, TaskError>) -> Result<Self::Output, TaskError>;
}

pub struct Unwrap;

impl<T> Settle<T> for Unwrap {
    type Output = T;

    fn settle(self, result: Result<T, TaskError>) -> Result<T, TaskError> {
        result
    }
}

pub struct UnwrapOr<T>(T);

impl<T> Settle<T> for UnwrapOr<T> {
    type Output = T;

    fn settle(self, result: Result<T, TaskError>) -> Result<T, TaskError> {
        Ok(result.unwrap_or(self.0))
    }
}

pub struct Expect(String);

impl<T> Settle<T> for Expect {
    type Output = T;

    fn settle(self, result: Result<T, TaskError>) -> Result<T, TaskError> {
        result.map_err(|source| TaskError::Expect {
            message: self.0,
            source: Box::new(source),
        })
    }
}

pub struct Invoke;

impl<T> Settle<T> for Invoke {
    type Output = Result<T, String>;

    fn settle(self, result: Result<T, TaskError>) -> Result<Result<T, String>, TaskError> {
        Ok(result.map_err(|err| err.to_string()))
    }
}

enum DriveState<T> {
    Start,
    Source(BoxCoroutine<T>),
    Stage { next: usize, routine: BoxCoroutine<T> },
    Done,
}

/// One drive of a [`FutureResult`]; a coroutine forwarding every control
/// signal of the computations it delegates to.
pub struct Drive<T, P> {
    factory: Factory<T>,
    callbacks: Vec<Callback<T>>,
    state: DriveState<T>,
    policy: Option<P>,
}

impl<T, P: Settle<T>> Drive<T, P> {
    /// Feeds `value` through the stages from `index` on. Returns `None` when a
    /// stage handed back a routine that must be delegated to first.
    fn advance(&mut self, mut index: usize, mut value: T) -> Option<Result<Step<P::Output>, TaskError>> {
        while let Some(callback) = self.callbacks.get(index).cloned() {
            index += 1;

            let stage = catch_unwind(AssertUnwindSafe(|| callback(value)))
                .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));

            match stage {
                Ok(Stage::Value(next)) => value = next,
                Ok(Stage::Routine(routine)) => {
                    self.state = DriveState::Stage {
                        next: index,
                        routine,
                    };
                    return None;
                }
                Err(err) => {
                    trace!(stage = index - 1, error = %err, "pipeline short-circuited");
                    return Some(self.settle(Err(err)));
                }
            }
        }

        Some(self.settle(Ok(value)))
    }

    fn settle(&mut self, result: Result<T, TaskError>) -> Result<Step<P::Output>, TaskError> {
        self.state = DriveState::Done;

        let policy = self
            .policy
            .take()
            .ok_or_else(|| TaskError::msg("pipeline drive settled twice"))?;

        policy.settle(result).map(Step::Complete)
    }
}

impl<T, P: Settle<T>> Coroutine for Drive<T, P> {
    type Output = P::Output;

    fn resume(&mut self) -> Result<Step<P::Output>, TaskError> {
        loop {
            let (next, step) = match &mut self.state {
                DriveState::Start => {
                    self.state = DriveState::Source((self.factory)());
                    continue;
                }
                DriveState::Source(routine) => (0, routine.resume()),
                DriveState::Stage { next, routine } => (*next, routine.resume()),
                DriveState::Done => {
                    return Err(TaskError::msg("pipeline drive resumed after completion"));
                }
            };

            match step {
                Ok(Step::Suspend(control)) => return Ok(Step::Suspend(control)),
                Ok(Step::Complete(value)) => {
                    if let Some(settled) = self.advance(next, value) {
                        return settled;
                    }
                }
                Err(err) => return self.settle(Err(err)),
            }
        }
    }
}
