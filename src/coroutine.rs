//! Resumable computations.
//!
//! A [`Coroutine`] runs until its next suspension point and hands a
//! [`Control`] back to whoever resumed it. The scheduler only ever talks to
//! tasks through [`Coroutine::resume`]; everything else in this module builds
//! coroutines out of closures or composes them by delegation.
//!
//! # Delegation
//!
//! [`Coroutine::then`] runs one coroutine to completion, forwarding each of
//! its control signals unchanged, then feeds the result into the next stage:
//!
//! ```ignore
//! use spindle::coroutine::{self, Coroutine};
//! use std::time::Duration;
//!
//! let job = coroutine::sleep(Duration::from_millis(5))
//!     .then(|()| coroutine::ready(42))
//!     .map(|n| n * 2);
//! ```

use crate::control::{Control, Outcome};
use crate::error::TaskError;

use std::mem;
use std::time::Duration;

/// Result of resuming a coroutine once.
#[derive(Debug)]
pub enum Step<T> {
    /// The coroutine reached a suspension point.
    Suspend(Control),
    /// The coroutine returned; it must not be resumed again.
    Complete(T),
}

impl<T> Step<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Step::Complete(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Step::Suspend(control) => Step::Suspend(control),
            Step::Complete(value) => Step::Complete(f(value)),
        }
    }
}

pub type BoxCoroutine<T> = Box<dyn Coroutine<Output = T>>;

pub trait Coroutine {
    type Output;

    /// Runs to the next suspension point or to completion.
    fn resume(&mut self) -> Result<Step<Self::Output>, TaskError>;

    /// Value available right now, used when the coroutine yields
    /// [`Control::Cancel`].
    fn current(&mut self) -> Option<Self::Output> {
        None
    }

    /// Delegates to `self`, then to the coroutine built from its result.
    fn then<F, B>(self, f: F) -> Then<Self, F, B>
    where
        Self: Sized,
        F: FnOnce(Self::Output) -> B,
        B: Coroutine,
    {
        Then {
            state: ThenState::First(self, f),
        }
    }

    fn map<F, U>(self, f: F) -> Map<Self, F>
    where
        Self: Sized,
        F: FnMut(Self::Output) -> U,
    {
        Map { inner: self, f }
    }

    fn boxed(self) -> BoxCoroutine<Self::Output>
    where
        Self: Sized + 'static,
    {
        Box::new(self)
    }
}

impl<C: Coroutine + ?Sized> Coroutine for Box<C> {
    type Output = C::Output;

    fn resume(&mut self) -> Result<Step<Self::Output>, TaskError> {
        (**self).resume()
    }

    fn current(&mut self) -> Option<Self::Output> {
        (**self).current()
    }
}

/// Coroutine driven by a closure, see [`from_fn`].
pub struct FromFn<F> {
    f: F,
}

/// Builds a coroutine whose every resume calls `f`.
///
/// The closure keeps its own state between calls and returns
/// [`Step::Complete`] exactly once.
pub fn from_fn<T, F>(f: F) -> FromFn<F>
where
    F: FnMut() -> Result<Step<T>, TaskError>,
{
    FromFn { f }
}

impl<T, F> Coroutine for FromFn<F>
where
    F: FnMut() -> Result<Step<T>, TaskError>,
{
    type Output = T;

    fn resume(&mut self) -> Result<Step<T>, TaskError> {
        (self.f)()
    }
}

/// Coroutine that completes on its first resume.
pub struct Ready<T> {
    value: Option<T>,
}

pub fn ready<T>(value: T) -> Ready<T> {
    Ready { value: Some(value) }
}

/// Coroutine that fails on its first resume.
pub fn fail<T>(error: TaskError) -> FromFn<impl FnMut() -> Result<Step<T>, TaskError>> {
    let mut error = Some(error);
    from_fn(move || Err(error.take().unwrap_or_else(resumed_after_completion)))
}

impl<T> Coroutine for Ready<T> {
    type Output = T;

    fn resume(&mut self) -> Result<Step<T>, TaskError> {
        self.value
            .take()
            .map(Step::Complete)
            .ok_or_else(resumed_after_completion)
    }
}

/// Yields one control signal, then completes with `()`.
pub struct Signal {
    control: Option<Control>,
    done: bool,
}

impl Signal {
    fn new(control: Control) -> Self {
        Self {
            control: Some(control),
            done: false,
        }
    }
}

impl Coroutine for Signal {
    type Output = ();

    fn resume(&mut self) -> Result<Step<()>, TaskError> {
        if let Some(control) = self.control.take() {
            return Ok(Step::Suspend(control));
        }

        if self.done {
            return Err(resumed_after_completion());
        }

        self.done = true;
        Ok(Step::Complete(()))
    }
}

pub fn sleep(duration: Duration) -> Signal {
    Signal::new(Control::Sleep(duration))
}

/// Cooperative scheduler hint: yields once so other tasks get a turn.
pub fn yield_now() -> Signal {
    Signal::new(Control::Yield)
}

pub fn defer<F>(callback: F) -> Signal
where
    F: FnOnce(Outcome<'_>) + 'static,
{
    Signal::new(Control::defer(callback))
}

/// Asks the scheduler to finish the enclosing task with its current value.
pub fn cancel() -> Signal {
    Signal::new(Control::Cancel)
}

/// Sequential composition, see [`Coroutine::then`].
pub struct Then<A, F, B> {
    state: ThenState<A, F, B>,
}

enum ThenState<A, F, B> {
    First(A, F),
    Second(B),
    Done,
}

impl<A, F, B> Coroutine for Then<A, F, B>
where
    A: Coroutine,
    F: FnOnce(A::Output) -> B,
    B: Coroutine,
{
    type Output = B::Output;

    fn resume(&mut self) -> Result<Step<B::Output>, TaskError> {
        loop {
            match &mut self.state {
                ThenState::First(first, _) => match first.resume()? {
                    Step::Suspend(control) => return Ok(Step::Suspend(control)),
                    Step::Complete(value) => {
                        if let ThenState::First(_, f) = mem::replace(&mut self.state, ThenState::Done)
                        {
                            self.state = ThenState::Second(f(value));
                        }
                    }
                },
                ThenState::Second(second) => {
                    let step = second.resume()?;
                    if step.is_complete() {
                        self.state = ThenState::Done;
                    }
                    return Ok(step);
                }
                ThenState::Done => return Err(resumed_after_completion()),
            }
        }
    }

    fn current(&mut self) -> Option<B::Output> {
        match &mut self.state {
            ThenState::Second(second) => second.current(),
            _ => None,
        }
    }
}

/// Output mapping, see [`Coroutine::map`].
pub struct Map<C, F> {
    inner: C,
    f: F,
}

impl<C, F, U> Coroutine for Map<C, F>
where
    C: Coroutine,
    F: FnMut(C::Output) -> U,
{
    type Output = U;

    fn resume(&mut self) -> Result<Step<U>, TaskError> {
        Ok(self.inner.resume()?.map(&mut self.f))
    }

    fn current(&mut self) -> Option<U> {
        self.inner.current().map(&mut self.f)
    }
}

fn resumed_after_completion() -> TaskError {
    TaskError::msg("coroutine resumed after completion")
}
