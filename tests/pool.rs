use spindle::coroutine::{self, Coroutine};
use spindle::{Scheduler, SchedulerBuilder, TaskError};

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

fn spawn_round(scheduler: &Scheduler, count: usize, fail: bool) {
    for index in 0..count {
        scheduler.spawn(
            move |index, _| {
                coroutine::sleep(Duration::from_millis(1)).then(move |()| {
                    if fail {
                        coroutine::fail::<usize>(TaskError::msg("round failed")).boxed()
                    } else {
                        coroutine::ready(index).boxed()
                    }
                })
            },
            index,
        );
    }
}

#[test]
fn test_finished_tasks_are_reused() {
    let mut scheduler = Scheduler::new();

    spawn_round(&scheduler, 10, false);
    scheduler.run().unwrap();

    spawn_round(&scheduler, 10, false);
    scheduler.run().unwrap();

    let stats = scheduler.stats();
    assert_eq!(stats.tasks_created, 10);
    assert_eq!(stats.tasks_reused, 10);
    assert_eq!(stats.tasks_completed, 20);
}

#[test]
fn test_reused_tasks_carry_no_failure_state() {
    let mut scheduler = Scheduler::new();

    spawn_round(&scheduler, 5, true);
    scheduler.run().unwrap();
    assert_eq!(scheduler.stats().tasks_failed, 5);

    let seen = Rc::new(RefCell::new(Vec::new()));
    for index in 0..5usize {
        let seen = seen.clone();
        scheduler.spawn(
            move |index, _| {
                coroutine::defer(move |outcome| {
                    seen.borrow_mut().push(outcome.is_ok());
                })
                .then(move |()| coroutine::ready(index))
            },
            index,
        );
    }
    scheduler.run().unwrap();

    assert_eq!(*seen.borrow(), vec![true; 5]);

    let stats = scheduler.stats();
    assert_eq!(stats.tasks_reused, 5);
    assert_eq!(stats.tasks_failed, 5, "No new failures after reuse");
}

#[test]
fn test_pool_capacity_bounds_reuse() {
    let mut scheduler = SchedulerBuilder::new().pool_capacity(2).build().unwrap();

    spawn_round(&scheduler, 5, false);
    scheduler.run().unwrap();

    spawn_round(&scheduler, 5, false);
    scheduler.run().unwrap();

    let stats = scheduler.stats();
    assert_eq!(stats.tasks_reused, 2);
    assert_eq!(stats.tasks_created, 8);
}
