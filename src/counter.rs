//! Completion counters: the primitive used to wait for one or many jobs.
//!
//! A counter is incremented once per kicked job and decremented once when the
//! job's entry point returns; `is_zero` is the wait predicate. Counters are
//! drawn from a fixed-capacity pool and addressed by handle, never allocated
//! per job, so the kick path stays allocation-free.
//!
//! Waiting fibers link themselves into the counter's intrusive waiter list
//! (lock-free CAS push); the decrement that reaches zero swaps the whole list
//! out and requeues every signaled waiter for resumption.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;

use crate::fiber::{
    Fiber, FiberRef, SwitchReason, WAIT_STATE_RUNNING, WAIT_STATE_SIGNALED, WAIT_STATE_WAITING,
    switch_to_worker,
};
use crate::worker_context;

/// Index of a pooled counter. Acquired via `Scheduler::generate_counter` (or
/// [`CounterGuard`](crate::CounterGuard)) and released exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterHandle(pub(crate) u32);

impl CounterHandle {
    pub(crate) fn pack(self) -> u64 {
        u64::from(self.0)
    }

    pub(crate) fn unpack(raw: u64) -> CounterHandle {
        CounterHandle(raw as u32)
    }
}

/// Atomic completion count plus the intrusive list of fibers waiting for it
/// to reach zero.
pub(crate) struct Counter {
    value: AtomicUsize,
    waiters: AtomicPtr<Fiber>,
}

impl Counter {
    fn new() -> Counter {
        Counter {
            value: AtomicUsize::new(0),
            waiters: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub(crate) fn increment(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements by one; the decrement that reaches zero wakes every waiter.
    /// Decrementing a zero counter is a contract violation.
    pub(crate) fn decrement(&self) {
        // Release publishes the job's writes to whoever wakes.
        let previous = self.value.fetch_sub(1, Ordering::Release);
        assert!(previous > 0, "counter decremented below zero");
        if previous == 1 {
            self.flush_waiters();
        }
    }

    pub(crate) fn value(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    pub(crate) fn is_zero(&self) -> bool {
        self.value() == 0
    }

    /// Links a fiber into the waiter list.
    ///
    /// # Safety
    ///
    /// `fiber` must stay pinned (it lives in the pool arena) and must have
    /// its `wait_state` set to WAITING before the call.
    pub(crate) unsafe fn add_waiter(&self, fiber: *mut Fiber) {
        let mut head = self.waiters.load(Ordering::Relaxed);
        loop {
            unsafe { (*fiber).next_waiter.store(head, Ordering::Relaxed) };
            match self.waiters.compare_exchange_weak(
                head,
                fiber,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
    }

    /// Detaches the whole waiter list and requeues every fiber that was still
    /// waiting. Also used by waiters themselves to flush a list the zero
    /// decrement may have missed.
    pub(crate) fn flush_waiters(&self) {
        // Acquire pairs with the Release CAS in add_waiter.
        let mut head = self.waiters.swap(std::ptr::null_mut(), Ordering::Acquire);
        while !head.is_null() {
            let fiber = unsafe { &*head };
            let next = fiber.next_waiter.load(Ordering::Relaxed);
            let signaled = fiber
                .wait_state
                .compare_exchange(
                    WAIT_STATE_WAITING,
                    WAIT_STATE_SIGNALED,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok();
            if signaled {
                requeue_ready(FiberRef(head));
            }
            // RUNNING here means the waiter aborted; SIGNALED means someone
            // else already claimed the wake.
            head = next;
        }
    }
}

/// Hands a runnable fiber back to the scheduler: the local lifecycle registry
/// when called on a fiber worker, the global resume queue otherwise.
pub(crate) fn requeue_ready(fiber: FiberRef) {
    if let Some(ctx) = worker_context::current()
        && let Some(registry) = &ctx.registry
    {
        registry.put_to_sleep(fiber);
        return;
    }
    let core = fiber.get().core.get();
    assert!(!core.is_null(), "fiber requeued before scheduler wiring");
    unsafe { &*core }.push_resume(fiber);
}

/// Blocks until the counter reaches zero.
///
/// On a fiber: a bounded spin, then park in the waiter list and hand the OS
/// thread back to the scheduler. On a plain thread: busy-spin.
pub(crate) fn wait_on(counter: &Counter) {
    if counter.is_zero() {
        return;
    }

    let Some(fiber_ref) = worker_context::current_fiber() else {
        let backoff = Backoff::new();
        while !counter.is_zero() {
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
        return;
    };

    // Short jobs usually finish inside this window; parking costs two
    // context switches.
    const SPIN_LIMIT: usize = 5_000;
    let mut spins = 0;
    while !counter.is_zero() && spins < SPIN_LIMIT {
        std::hint::spin_loop();
        spins += 1;
    }

    let fiber = fiber_ref.get();
    loop {
        if counter.is_zero() {
            return;
        }

        fiber.wait_state.store(WAIT_STATE_WAITING, Ordering::Release);
        unsafe { counter.add_waiter(fiber_ref.0) };

        // The zero decrement may have swapped the list out just before we
        // linked in; flush so nobody is stranded. If that wakes us, the
        // requeued handle waits for our park flag before resuming.
        if counter.is_zero() {
            counter.flush_waiters();
        }

        switch_to_worker(SwitchReason::Waiting);
        fiber.wait_state.store(WAIT_STATE_RUNNING, Ordering::Relaxed);
    }
}

/// Fixed-capacity pool of counters, addressed by handle.
pub(crate) struct CounterPool {
    counters: Box<[Counter]>,
    free: ArrayQueue<u32>,
}

impl CounterPool {
    pub(crate) fn new(capacity: usize) -> CounterPool {
        assert!(capacity > 0, "counter pool capacity must be non-zero");
        let counters: Box<[Counter]> = (0..capacity).map(|_| Counter::new()).collect();
        let free = ArrayQueue::new(capacity);
        for index in 0..capacity as u32 {
            let _ = free.push(index);
        }
        CounterPool { counters, free }
    }

    /// Acquires a counter, spinning while the pool is transiently empty.
    pub(crate) fn acquire(&self) -> CounterHandle {
        let backoff = Backoff::new();
        loop {
            if let Some(index) = self.free.pop() {
                debug_assert!(self.counters[index as usize].is_zero());
                return CounterHandle(index);
            }
            backoff.snooze();
        }
    }

    /// Releases a counter. Releasing a non-zero counter, or the same handle
    /// twice, is a contract violation.
    pub(crate) fn release(&self, handle: CounterHandle) {
        let counter = self.get(handle);
        assert!(counter.is_zero(), "counter released while jobs are pending");
        assert!(
            self.free.push(handle.0).is_ok(),
            "counter handle released twice"
        );
    }

    pub(crate) fn get(&self, handle: CounterHandle) -> &Counter {
        &self.counters[handle.0 as usize]
    }
}

/// RAII counter lease: acquires from the scheduler's pool on construction,
/// releases on drop. The counter must be back at zero by then.
pub struct CounterGuard<'a> {
    scheduler: &'a crate::scheduler::Scheduler,
    handle: CounterHandle,
}

impl<'a> CounterGuard<'a> {
    pub(crate) fn new(scheduler: &'a crate::scheduler::Scheduler) -> CounterGuard<'a> {
        CounterGuard {
            handle: scheduler.generate_counter(),
            scheduler,
        }
    }

    pub fn handle(&self) -> CounterHandle {
        self.handle
    }

    /// Blocks until the counter reaches zero.
    pub fn wait(&self) {
        self.scheduler.wait(self.handle);
    }

    pub fn is_zero(&self) -> bool {
        self.scheduler.counter_is_zero(self.handle)
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.destroy_counter(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_decrement_round_trip() {
        let counter = Counter::new();
        assert!(counter.is_zero());
        counter.increment();
        counter.increment();
        assert_eq!(counter.value(), 2);
        counter.decrement();
        assert!(!counter.is_zero());
        counter.decrement();
        assert!(counter.is_zero());
    }

    #[test]
    #[should_panic(expected = "below zero")]
    fn zero_decrement_asserts() {
        Counter::new().decrement();
    }

    #[test]
    fn pool_hands_out_distinct_handles() {
        let pool = CounterPool::new(4);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a, b);
        pool.release(a);
        pool.release(b);
    }

    #[test]
    #[should_panic(expected = "jobs are pending")]
    fn releasing_pending_counter_asserts() {
        let pool = CounterPool::new(2);
        let handle = pool.acquire();
        pool.get(handle).increment();
        pool.release(handle);
    }

    #[test]
    fn released_handles_recirculate() {
        let pool = CounterPool::new(1);
        let a = pool.acquire();
        pool.release(a);
        let b = pool.acquire();
        assert_eq!(a, b);
        pool.release(b);
    }

    #[test]
    fn wait_on_zero_counter_returns_immediately() {
        let counter = Counter::new();
        wait_on(&counter);
    }

    #[test]
    fn plain_thread_wait_observes_concurrent_decrement() {
        let counter = std::sync::Arc::new(Counter::new());
        counter.increment();
        let worker = {
            let counter = counter.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                counter.decrement();
            })
        };
        wait_on(&counter);
        assert!(counter.is_zero());
        worker.join().unwrap();
    }
}
