//! Global job queues: three priority tiers over lock-free MPMC ring buffers.
//!
//! No per-worker queues and no stealing — every worker pops from the same
//! three tiers, high to low. Within one tier ordering is whatever the ring
//! buffer produces under contention (FIFO-ish); across tiers there is no
//! total order.

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;

use crate::job::{JobDescriptor, Priority};

/// Pushes into a bounded queue, spinning while it is transiently full.
/// Queue exhaustion is treated as back-pressure, never an error returned to
/// the submitter.
pub(crate) fn push_with_backoff<T>(queue: &ArrayQueue<T>, mut item: T) {
    let backoff = Backoff::new();
    loop {
        match queue.push(item) {
            Ok(()) => return,
            Err(rejected) => {
                item = rejected;
                backoff.snooze();
            }
        }
    }
}

pub(crate) struct JobQueues {
    high: ArrayQueue<JobDescriptor>,
    normal: ArrayQueue<JobDescriptor>,
    low: ArrayQueue<JobDescriptor>,
}

impl JobQueues {
    pub(crate) fn new(capacity_per_tier: usize) -> JobQueues {
        assert!(capacity_per_tier > 0, "job queue capacity must be non-zero");
        JobQueues {
            high: ArrayQueue::new(capacity_per_tier),
            normal: ArrayQueue::new(capacity_per_tier),
            low: ArrayQueue::new(capacity_per_tier),
        }
    }

    pub(crate) fn push(&self, job: JobDescriptor) {
        let queue = match job.priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        };
        push_with_backoff(queue, job);
    }

    /// Highest-priority job available, if any.
    pub(crate) fn pop(&self) -> Option<JobDescriptor> {
        self.high
            .pop()
            .or_else(|| self.normal.pop())
            .or_else(|| self.low.pop())
    }

    /// Priority aging: drains Normal into High, then Low into Normal, so
    /// sustained high-priority load cannot starve the lower tiers. Promoted
    /// jobs lose their original priority tag.
    pub(crate) fn promote(&self) {
        while let Some(job) = self.normal.pop() {
            push_with_backoff(&self.high, job);
        }
        while let Some(job) = self.low.pop() {
            push_with_backoff(&self.normal, job);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty() && self.low.is_empty()
    }
}
