//! Recycling of retired tasks.
//!
//! High spawn rates would otherwise allocate and free a `Task` box per spawn.
//! Terminal tasks are reset and parked here, up to a fixed capacity.

use crate::task::{Body, Task, TaskId};

use tracing::warn;

pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Bounded free list of reset tasks.
#[derive(Debug)]
pub struct TaskPool {
    free: Vec<Box<Task>>,
    capacity: usize,
    created: u64,
    reused: u64,
}

impl TaskPool {
    /// Creates an empty pool that keeps at most `capacity` retired tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            capacity,
            created: 0,
            reused: 0,
        }
    }

    /// Hands out a reset pooled task when one is available, a fresh one otherwise.
    pub(crate) fn acquire(&mut self, id: TaskId, body: Body) -> Box<Task> {
        match self.free.pop() {
            Some(mut task) => {
                task.reuse(id, body);
                self.reused += 1;
                task
            }
            None => {
                self.created += 1;
                Box::new(Task::new(id, body))
            }
        }
    }

    /// Takes back a terminal task. Beyond capacity the task is simply dropped.
    pub(crate) fn release(&mut self, mut task: Box<Task>) {
        debug_assert!(task.state().is_terminal(), "released a live task");

        task.reset();

        if self.free.len() >= self.capacity {
            warn!(task = %task.id(), capacity = self.capacity, "pool full, dropping task");
            return;
        }

        self.free.push(task);
    }

    /// Number of tasks parked for reuse.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks allocated because the pool was empty.
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Tasks handed out from the pool instead of allocated.
    pub fn reused(&self) -> u64 {
        self.reused
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}
