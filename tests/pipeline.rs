mod common;

use common::{init_test_logging, yielding};
use spindle::coroutine::{self, Coroutine};
use spindle::{FutureResult, Outcome, Scheduler, Stage, TaskError};

use std::cell::{Cell, RefCell};
use std::error::Error as _;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn lookup() -> FutureResult<u32> {
    FutureResult::new(|| yielding(2, 40))
}

/// Captures the failure message a task ended with, if any.
fn failure(slot: Rc<RefCell<Option<String>>>) -> impl FnOnce(Outcome<'_>) + 'static {
    move |outcome| {
        if let Err(err) = outcome {
            let cause = err.source().map(|source| format!(" <- {source}"));
            *slot.borrow_mut() = Some(format!("{err}{}", cause.unwrap_or_default()));
        }
    }
}

#[test]
fn test_failed_stage_falls_back_to_default() {
    init_test_logging();

    let mut scheduler = Scheduler::new();
    let result = Rc::new(Cell::new(None));
    let g_called = Rc::new(Cell::new(false));

    let flag = g_called.clone();
    let future = lookup()
        .map(|_| Err(TaskError::msg("f failed")))
        .map(move |n| {
            flag.set(true);
            Ok(Stage::Value(n + 1))
        });

    let out = result.clone();
    scheduler.spawn(
        move |future: FutureResult<u32>, _| future.unwrap_or(7).map(move |n| out.set(Some(n))),
        future,
    );

    scheduler.run().unwrap();

    assert_eq!(result.get(), Some(7));
    assert!(!g_called.get(), "Stages after a failure must be skipped");
    assert_eq!(scheduler.stats().tasks_failed, 0);
}

#[test]
fn test_unwrap_fails_the_driving_task() {
    let mut scheduler = Scheduler::new();
    let slot = Rc::new(RefCell::new(None));

    let future = lookup().map(|_| Err(TaskError::msg("host unreachable")));
    let callback = failure(slot.clone());

    scheduler.spawn(
        move |(), _| coroutine::defer(callback).then(move |()| future.unwrap()),
        (),
    );

    scheduler.run().unwrap();

    assert_eq!(slot.borrow().as_deref(), Some("host unreachable"));
    assert_eq!(scheduler.stats().tasks_failed, 1);
}

#[test]
fn test_expect_keeps_the_cause() {
    let mut scheduler = Scheduler::new();
    let slot = Rc::new(RefCell::new(None));

    let future = FutureResult::new(|| coroutine::fail::<u32>(TaskError::msg("timed out")));
    let callback = failure(slot.clone());

    scheduler.spawn(
        move |(), _| coroutine::defer(callback).then(move |()| future.expect("resolving host")),
        (),
    );

    scheduler.run().unwrap();

    assert_eq!(slot.borrow().as_deref(), Some("resolving host <- timed out"));
}

#[test]
fn test_invoke_returns_message_or_value() {
    let mut scheduler = Scheduler::new();
    let results = Rc::new(RefCell::new(Vec::new()));

    let good = lookup().map(|n| Ok(Stage::Value(n + 2)));
    let bad = lookup().map(|_| Err(TaskError::msg("parse error")));

    for future in [good, bad] {
        let results = results.clone();
        scheduler.spawn(
            move |future: FutureResult<u32>, _| {
                future.invoke().map(move |result| results.borrow_mut().push(result))
            },
            future,
        );
    }

    scheduler.run().unwrap();

    assert_eq!(
        *results.borrow(),
        vec![Ok(42), Err("parse error".to_string())]
    );
    assert_eq!(scheduler.stats().tasks_failed, 0);
}

#[test]
fn test_routine_stage_sleeps_inside_the_scheduler() {
    let mut scheduler = Scheduler::new();
    let result = Rc::new(Cell::new(None));

    let future = lookup().map(|n| {
        Ok(Stage::routine(
            coroutine::sleep(Duration::from_millis(20)).map(move |()| n * 2),
        ))
    });

    let out = result.clone();
    let start = Instant::now();
    scheduler.spawn(
        move |(), _| future.unwrap().map(move |n| out.set(Some(n))),
        (),
    );

    // Another task keeps making progress while the stage sleeps.
    let ticks = Rc::new(Cell::new(0));
    let counter = ticks.clone();
    scheduler.spawn(
        move |(), _| yielding(3, ()).map(move |()| counter.set(counter.get() + 1)),
        (),
    );

    scheduler.run().unwrap();

    assert_eq!(result.get(), Some(80));
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert_eq!(ticks.get(), 1);
}

#[test]
fn test_each_drive_reruns_the_computation() {
    let mut scheduler = Scheduler::new();
    let runs = Rc::new(Cell::new(0));
    let totals = Rc::new(RefCell::new(Vec::new()));

    let counter = runs.clone();
    let future = FutureResult::new(move || {
        counter.set(counter.get() + 1);
        yielding(1, counter.get())
    })
    .map(|n| Ok(Stage::Value(n * 100)));

    let sink = totals.clone();
    scheduler.spawn(
        move |(), _| {
            let again = future.clone();
            future
                .unwrap()
                .then(move |first| again.unwrap().map(move |second| (first, second)))
                .map(move |pair| sink.borrow_mut().push(pair))
        },
        (),
    );

    scheduler.run().unwrap();

    assert_eq!(runs.get(), 2);
    assert_eq!(*totals.borrow(), vec![(100, 200)]);
}
