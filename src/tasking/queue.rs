// Per-worker task queues.
//
// One lock-free FIFO queue per worker; submissions name the worker
// explicitly, which buys affinity without work stealing. Within a queue,
// pop order equals push order, which is what makes per-worker start order
// equal submission order.

use crossbeam::queue::SegQueue;

use super::task::TaskContext;

pub(crate) struct TaskQueues {
    queues: Vec<SegQueue<Box<TaskContext>>>,
}

impl TaskQueues {
    pub fn new(num_queues: usize) -> Self {
        Self {
            queues: (0..num_queues).map(|_| SegQueue::new()).collect(),
        }
    }

    pub fn push(&self, queue_id: u32, task: Box<TaskContext>) {
        self.queues[queue_id as usize].push(task);
    }

    pub fn pop(&self, queue_id: u32) -> Option<Box<TaskContext>> {
        self.queues[queue_id as usize].pop()
    }

    /// Drains every queue, returning how many tasks were thrown away.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        for queue in &self.queues {
            while queue.pop().is_some() {
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasking::Task;

    #[test]
    fn queues_are_fifo_and_independent() {
        let queues = TaskQueues::new(2);
        for i in 0..3 {
            let mut ctx = Box::new(TaskContext::new(
                Task::new(|| {}),
                None,
                std::ptr::null_mut(),
            ));
            ctx.finished = i == 1;
            queues.push(0, ctx);
        }
        assert!(queues.pop(1).is_none());
        assert!(!queues.pop(0).unwrap().finished);
        assert!(queues.pop(0).unwrap().finished);
        assert!(!queues.pop(0).unwrap().finished);
        assert!(queues.pop(0).is_none());
    }
}
