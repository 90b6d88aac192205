//! Per-worker-thread fiber lifecycle registry.
//!
//! Each fiber worker owns one registry with two bounded queues: *sleeping*
//! fibers (suspended, ready to be resumed on this thread) and *completed*
//! fibers (job finished, awaiting return to their size-class pool). Both are
//! ring buffers with single-thread-only access — the owning OS thread is the
//! sole reader and writer, so no locking is involved.
//!
//! Contract: a fiber pushed to *completed* must not be touched again until
//! the worker retrieves it and returns it to its pool; a fiber pushed to
//! *sleeping* must already carry its resumption hand-off state (published to
//! whatever primitive parked it).

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::fiber::FiberRef;

pub(crate) struct FiberLifeCycle {
    sleeping: RefCell<VecDeque<FiberRef>>,
    completed: RefCell<VecDeque<FiberRef>>,
    capacity: usize,
}

impl FiberLifeCycle {
    /// `capacity` bounds each queue; the scheduler sizes it to the total
    /// fiber count so overflow is impossible unless the return discipline is
    /// broken.
    pub(crate) fn new(capacity: usize) -> FiberLifeCycle {
        FiberLifeCycle {
            sleeping: RefCell::new(VecDeque::with_capacity(capacity)),
            completed: RefCell::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub(crate) fn put_to_sleep(&self, fiber: FiberRef) {
        let mut queue = self.sleeping.borrow_mut();
        assert!(queue.len() < self.capacity, "sleep queue overflow");
        queue.push_back(fiber);
    }

    pub(crate) fn try_waking_up(&self) -> Option<FiberRef> {
        self.sleeping.borrow_mut().pop_front()
    }

    pub(crate) fn put_to_completed(&self, fiber: FiberRef) {
        let mut queue = self.completed.borrow_mut();
        assert!(queue.len() < self.capacity, "completed queue overflow");
        queue.push_back(fiber);
    }

    pub(crate) fn try_get_completed(&self) -> Option<FiberRef> {
        self.completed.borrow_mut().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{Fiber, StackSizeClass};
    use crate::fiber_pool::PoolSlot;

    fn test_fiber() -> Fiber {
        Fiber::initialize(PoolSlot {
            class: StackSizeClass::Micro,
            index: 0,
        })
    }

    #[test]
    fn queues_are_fifo_and_independent() {
        let registry = FiberLifeCycle::new(4);
        let a = test_fiber();
        let b = test_fiber();
        let ra = FiberRef(&a as *const Fiber as *mut Fiber);
        let rb = FiberRef(&b as *const Fiber as *mut Fiber);

        registry.put_to_sleep(ra);
        registry.put_to_sleep(rb);
        registry.put_to_completed(rb);

        assert_eq!(registry.try_waking_up(), Some(ra));
        assert_eq!(registry.try_waking_up(), Some(rb));
        assert_eq!(registry.try_waking_up(), None);

        assert_eq!(registry.try_get_completed(), Some(rb));
        assert_eq!(registry.try_get_completed(), None);
    }

    #[test]
    #[should_panic(expected = "sleep queue overflow")]
    fn sleep_overflow_asserts() {
        let registry = FiberLifeCycle::new(1);
        let a = test_fiber();
        let ra = FiberRef(&a as *const Fiber as *mut Fiber);
        registry.put_to_sleep(ra);
        registry.put_to_sleep(ra);
    }
}
