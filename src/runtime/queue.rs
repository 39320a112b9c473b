//! Task containers owned by the scheduler.
//!
//! [`ReadyQueue`] is the FIFO of runnable tasks. [`SleepQueue`] keeps
//! sleeping tasks ordered by deadline so the earliest one is always on top.

use crate::task::Task;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;

#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    tasks: VecDeque<Box<Task>>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueues at the tail.
    pub(crate) fn push(&mut self, task: Box<Task>) {
        self.tasks.push_back(task);
    }

    pub(crate) fn pop(&mut self) -> Option<Box<Task>> {
        self.tasks.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.tasks.clear();
    }
}

impl Extend<Box<Task>> for ReadyQueue {
    fn extend<I: IntoIterator<Item = Box<Task>>>(&mut self, iter: I) {
        self.tasks.extend(iter);
    }
}

struct Sleeper {
    deadline: Instant,
    seq: u64,
    task: Box<Task>,
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Sleeper {}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sleeper {
    // Reversed so the max-heap yields the earliest deadline first; ties
    // go to whoever fell asleep first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct SleepQueue {
    heap: BinaryHeap<Sleeper>,
    seq: u64,
}

impl SleepQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Parks a task that has already been moved to `Sleeping`.
    pub(crate) fn push(&mut self, task: Box<Task>) {
        let deadline = task.wake_at().unwrap_or_else(Instant::now);
        self.seq += 1;
        self.heap.push(Sleeper {
            deadline,
            seq: self.seq,
            task,
        });
    }

    /// Removes the earliest sleeper if its deadline has passed and wakes it.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<Box<Task>> {
        if self.heap.peek()?.deadline > now {
            return None;
        }

        let mut task = self.heap.pop()?.task;
        task.try_wake(now);
        Some(task)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|sleeper| sleeper.deadline)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}
