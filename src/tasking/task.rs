// Tasks, task contexts and synchronization counters.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use context::stack::ProtectedFixedSizeStack;
use context::Context;

use crate::tasking::{current_thread_id, yield_now, INVALID_THREAD_ID};

/// A unit of work for the thread pool.
pub struct Task {
    pub(crate) f: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self { f: Box::new(f) }
    }
}

/// A submitted task plus everything the runtime needs to drive it: the
/// counter to decrement on completion, the suspended fiber continuation and
/// its stack, and the submitting task as parent. The parent always outlives
/// the child, because a parent awaiting children blocks in
/// `SyncCounter::join`.
pub(crate) struct TaskContext {
    pub task: Option<Task>,
    pub counter: Option<Arc<SyncCounter>>,
    /// The fiber continuation while the task is suspended.
    pub context: Option<Context>,
    /// The fiber stack, owned so it outlives the continuation.
    pub stack: Option<ProtectedFixedSizeStack>,
    pub finished: bool,
    /// Submitting task, if the submission came from inside a fiber.
    #[allow(dead_code)]
    pub parent: *mut TaskContext,
}

// SAFETY: a TaskContext is only ever driven by one worker at a time; it
// moves through the per-worker queues between suspensions and is never
// aliased while running.
unsafe impl Send for TaskContext {}

impl TaskContext {
    pub fn new(task: Task, counter: Option<Arc<SyncCounter>>, parent: *mut TaskContext) -> Self {
        Self {
            task: Some(task),
            counter,
            context: None,
            stack: None,
            finished: false,
            parent,
        }
    }
}

/// Atomic counter used to await the completion of a set of tasks.
pub struct SyncCounter {
    value: AtomicI32,
}

impl SyncCounter {
    pub fn new() -> Self {
        Self {
            value: AtomicI32::new(0),
        }
    }

    pub fn set_value(&self, value: i32) {
        self.value.store(value, Ordering::Release);
    }

    pub fn value(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }

    /// Increments and returns the previous value.
    pub fn fetch_increment(&self) -> i32 {
        self.value.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements and returns the previous value.
    pub fn fetch_decrement(&self) -> i32 {
        self.value.fetch_sub(1, Ordering::AcqRel)
    }

    /// Blocks until the counter reaches zero. On a worker fiber this yields
    /// so the worker keeps making progress; elsewhere it sleeps briefly
    /// between rechecks.
    pub fn join(&self) {
        while self.value.load(Ordering::Acquire) != 0 {
            if current_thread_id() == INVALID_THREAD_ID {
                thread::sleep(Duration::from_millis(1));
            } else {
                yield_now();
            }
        }
    }
}

impl Default for SyncCounter {
    fn default() -> Self {
        Self::new()
    }
}
