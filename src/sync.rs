//! Fiber-aware synchronization primitives.
//!
//! Code using these may be running either as a fiber (cooperatively
//! scheduled — must never block the OS thread) or as a plain OS thread.
//! [`is_fiber`](crate::fiber::is_fiber) disambiguates; every wait here either
//! yields cooperatively or fully suspends the fiber, and degrades to OS-level
//! spinning/yielding on plain threads.
//!
//! Lock misuse — re-entrant lock, unlock of a lock not held — is a contract
//! violation and asserts.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::counter::requeue_ready;
use crate::fiber::{
    Fiber, FiberRef, SwitchReason, WAIT_STATE_RUNNING, WAIT_STATE_SIGNALED, WAIT_STATE_WAITING,
    switch_to_worker, yield_now,
};
use crate::worker_context;

// ---------------------------------------------------------------------------
// SimpleLock
// ---------------------------------------------------------------------------

/// Raw atomic-flag spin lock. The only primitive safe to use before any
/// fiber or worker context exists; never yields, just spins.
pub struct SimpleLock {
    flag: AtomicBool,
}

impl SimpleLock {
    pub const fn new() -> SimpleLock {
        SimpleLock {
            flag: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SimpleLockGuard<'_> {
        while self
            .flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SimpleLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SimpleLockGuard<'_>> {
        self.flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SimpleLockGuard { lock: self })
    }

    fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Default for SimpleLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimpleLockGuard<'a> {
    lock: &'a SimpleLock,
}

impl Drop for SimpleLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

// ---------------------------------------------------------------------------
// FiberSpinLock
// ---------------------------------------------------------------------------

/// Spin lock that yields the fiber between attempts instead of burning the
/// CPU. On a plain thread the yield degrades to an OS thread yield.
pub struct FiberSpinLock {
    flag: AtomicBool,
}

impl FiberSpinLock {
    pub const fn new() -> FiberSpinLock {
        FiberSpinLock {
            flag: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> FiberSpinLockGuard<'_> {
        while self
            .flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            yield_now();
        }
        FiberSpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<FiberSpinLockGuard<'_>> {
        self.flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| FiberSpinLockGuard { lock: self })
    }

    fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Default for FiberSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FiberSpinLockGuard<'a> {
    lock: &'a FiberSpinLock,
}

impl Drop for FiberSpinLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

// ---------------------------------------------------------------------------
// FiberMutex
// ---------------------------------------------------------------------------

const THREAD_TOKEN_BIT: u64 = 1 << 63;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 =
        NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed) | THREAD_TOKEN_BIT;
}

/// Identity of the locking context: fiber id, or a per-thread token for
/// plain threads.
fn lock_token() -> u64 {
    match crate::fiber::current_fiber_id() {
        Some(id) => id.as_u64(),
        None => THREAD_TOKEN.with(|token| *token),
    }
}

/// Exclusive fiber-aware mutex.
///
/// Acquisition tests-and-sets the owner field under a short spin-lock guard,
/// then yields (never busy-waits) until the mutex frees up. Re-entrant
/// locking by the same fiber asserts.
pub struct FiberMutex {
    guard: FiberSpinLock,
    owner: AtomicU64,
}

impl FiberMutex {
    pub const fn new() -> FiberMutex {
        FiberMutex {
            guard: FiberSpinLock::new(),
            owner: AtomicU64::new(0),
        }
    }

    pub fn lock(&self) {
        let me = lock_token();
        loop {
            {
                let _guard = self.guard.lock();
                let owner = self.owner.load(Ordering::Acquire);
                if owner == 0 {
                    self.owner.store(me, Ordering::Release);
                    return;
                }
                assert!(owner != me, "re-entrant FiberMutex lock");
            }
            yield_now();
        }
    }

    pub fn try_lock(&self) -> bool {
        let me = lock_token();
        let _guard = self.guard.lock();
        let owner = self.owner.load(Ordering::Acquire);
        if owner == 0 {
            self.owner.store(me, Ordering::Release);
            true
        } else {
            assert!(owner != me, "re-entrant FiberMutex lock");
            false
        }
    }

    pub fn unlock(&self) {
        let me = lock_token();
        let _guard = self.guard.lock();
        assert_eq!(
            self.owner.load(Ordering::Acquire),
            me,
            "FiberMutex unlocked by a non-owner"
        );
        self.owner.store(0, Ordering::Release);
    }

    /// Scoped lock.
    pub fn lock_guard(&self) -> FiberLockGuard<'_> {
        self.lock();
        FiberLockGuard { mutex: self }
    }
}

impl Default for FiberMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FiberLockGuard<'a> {
    mutex: &'a FiberMutex,
}

impl Drop for FiberLockGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// Owning lock wrapper with deferred-lock support, for hand-off into
/// [`FiberCondvar::wait`]. May be constructed already-unlocked.
pub struct FiberUniqueLock<'a> {
    mutex: &'a FiberMutex,
    owned: bool,
}

impl<'a> FiberUniqueLock<'a> {
    /// Acquires the mutex immediately.
    pub fn new(mutex: &'a FiberMutex) -> FiberUniqueLock<'a> {
        mutex.lock();
        FiberUniqueLock { mutex, owned: true }
    }

    /// Wraps without acquiring.
    pub fn defer_lock(mutex: &'a FiberMutex) -> FiberUniqueLock<'a> {
        FiberUniqueLock { mutex, owned: false }
    }

    pub fn lock(&mut self) {
        assert!(!self.owned, "FiberUniqueLock locked twice");
        self.mutex.lock();
        self.owned = true;
    }

    pub fn unlock(&mut self) {
        assert!(self.owned, "FiberUniqueLock unlocked while not held");
        self.mutex.unlock();
        self.owned = false;
    }

    pub fn owns_lock(&self) -> bool {
        self.owned
    }
}

impl Drop for FiberUniqueLock<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.mutex.unlock();
        }
    }
}

// ---------------------------------------------------------------------------
// FiberCondvar
// ---------------------------------------------------------------------------

/// Fiber-aware condition variable.
///
/// `wait` atomically releases the associated mutex and fully suspends the
/// calling fiber — the OS thread goes back to the scheduler instead of
/// spinning. Waiters are requeued by `notify_one`/`notify_all` through the
/// lifecycle registry (or the global resume queue when notified from a
/// non-worker thread).
pub struct FiberCondvar {
    list_lock: SimpleLock,
    waiters: AtomicPtr<Fiber>,
    /// Bumped on every notify; plain-thread waiters spin on it.
    generation: AtomicU64,
}

impl FiberCondvar {
    pub const fn new() -> FiberCondvar {
        FiberCondvar {
            list_lock: SimpleLock::new(),
            waiters: AtomicPtr::new(std::ptr::null_mut()),
            generation: AtomicU64::new(0),
        }
    }

    /// Suspends the caller until notified. `lock` must be held on entry; it
    /// is released for the duration of the wait and reacquired before
    /// returning.
    ///
    /// On a fiber the suspension is complete — the OS thread goes back to the
    /// scheduler. On a plain thread the wait degrades to an OS-yield spin on
    /// the notify generation and may wake spuriously; callers re-check their
    /// predicate in a loop as with any condition variable.
    ///
    /// # Panics
    ///
    /// Panics when `lock` is not held.
    pub fn wait(&self, lock: &mut FiberUniqueLock<'_>) {
        assert!(lock.owns_lock(), "FiberCondvar::wait requires a held lock");

        let Some(fiber_ref) = worker_context::current_fiber() else {
            // Generation read happens under the lock, so a notify that races
            // the release below is never missed.
            let observed = self.generation.load(Ordering::Acquire);
            lock.unlock();
            while self.generation.load(Ordering::Acquire) == observed {
                std::thread::yield_now();
            }
            lock.lock();
            return;
        };
        let fiber = fiber_ref.get();

        fiber.wait_state.store(WAIT_STATE_WAITING, Ordering::Release);
        {
            let _guard = self.list_lock.lock();
            let head = self.waiters.load(Ordering::Relaxed);
            fiber.next_waiter.store(head, Ordering::Relaxed);
            self.waiters.store(fiber_ref.0, Ordering::Release);
        }

        // Registered first, released second: a notifier that takes the list
        // lock after this point sees us.
        lock.unlock();
        switch_to_worker(SwitchReason::Waiting);
        fiber.wait_state.store(WAIT_STATE_RUNNING, Ordering::Relaxed);
        lock.lock();
    }

    /// Re-checks `condition` with a cooperative yield in between, releasing
    /// the lock across each yield. Returns once `condition` is false. Used
    /// where full suspend/resume coupling to the scheduler isn't required.
    pub fn wait_while(
        &self,
        lock: &mut FiberUniqueLock<'_>,
        mut condition: impl FnMut() -> bool,
    ) {
        assert!(lock.owns_lock(), "FiberCondvar::wait_while requires a held lock");
        while condition() {
            lock.unlock();
            yield_now();
            lock.lock();
        }
    }

    /// Wakes at most one suspended fiber (plain-thread waiters may observe
    /// this as a spurious wake).
    pub fn notify_one(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        let woken = {
            let _guard = self.list_lock.lock();
            let head = self.waiters.load(Ordering::Acquire);
            if head.is_null() {
                None
            } else {
                let next = unsafe { (*head).next_waiter.load(Ordering::Relaxed) };
                self.waiters.store(next, Ordering::Release);
                Some(head)
            }
        };
        if let Some(fiber) = woken {
            signal_and_requeue(fiber);
        }
    }

    /// Wakes every fiber currently waiting, and no others: fibers arriving
    /// after the list swap wait for the next notify.
    pub fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        let mut head = {
            let _guard = self.list_lock.lock();
            self.waiters.swap(std::ptr::null_mut(), Ordering::AcqRel)
        };
        while !head.is_null() {
            let next = unsafe { (*head).next_waiter.load(Ordering::Relaxed) };
            signal_and_requeue(head);
            head = next;
        }
    }
}

impl Default for FiberCondvar {
    fn default() -> Self {
        Self::new()
    }
}

fn signal_and_requeue(fiber: *mut Fiber) {
    let signaled = unsafe { &*fiber }
        .wait_state
        .compare_exchange(
            WAIT_STATE_WAITING,
            WAIT_STATE_SIGNALED,
            Ordering::AcqRel,
            Ordering::Relaxed,
        )
        .is_ok();
    if signaled {
        requeue_ready(FiberRef(fiber));
    }
}

// ---------------------------------------------------------------------------
// FiberSharedMutex
// ---------------------------------------------------------------------------

/// Reader/writer lock composed from a [`FiberMutex`], a [`FiberCondvar`] and
/// an atomic reader count. Writers wait while readers are inside; readers
/// wait while the writer flag is set; the last reader out and every writer
/// notify all waiters.
pub struct FiberSharedMutex {
    mutex: FiberMutex,
    cv: FiberCondvar,
    readers: AtomicU32,
    writer: AtomicBool,
}

impl FiberSharedMutex {
    pub const fn new() -> FiberSharedMutex {
        FiberSharedMutex {
            mutex: FiberMutex::new(),
            cv: FiberCondvar::new(),
            readers: AtomicU32::new(0),
            writer: AtomicBool::new(false),
        }
    }

    pub fn lock_shared(&self) {
        let mut lock = FiberUniqueLock::new(&self.mutex);
        while self.writer.load(Ordering::Acquire) {
            self.cv.wait(&mut lock);
        }
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock_shared(&self) {
        let previous = self.readers.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "unlock_shared without a shared lock held");
        if previous == 1 {
            // Notify under the mutex so a writer between its predicate check
            // and its wait registration cannot miss the wake.
            let _lock = self.mutex.lock_guard();
            self.cv.notify_all();
        }
    }

    pub fn lock(&self) {
        let mut lock = FiberUniqueLock::new(&self.mutex);
        while self.writer.load(Ordering::Acquire) {
            self.cv.wait(&mut lock);
        }
        self.writer.store(true, Ordering::Release);
        while self.readers.load(Ordering::Acquire) > 0 {
            self.cv.wait(&mut lock);
        }
    }

    pub fn unlock(&self) {
        assert!(
            self.writer.swap(false, Ordering::AcqRel),
            "unlock without the write lock held"
        );
        let _lock = self.mutex.lock_guard();
        self.cv.notify_all();
    }

    pub fn read_guard(&self) -> FiberSharedReadGuard<'_> {
        self.lock_shared();
        FiberSharedReadGuard { shared: self }
    }

    pub fn write_guard(&self) -> FiberSharedWriteGuard<'_> {
        self.lock();
        FiberSharedWriteGuard { shared: self }
    }
}

impl Default for FiberSharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FiberSharedReadGuard<'a> {
    shared: &'a FiberSharedMutex,
}

impl Drop for FiberSharedReadGuard<'_> {
    fn drop(&mut self) {
        self.shared.unlock_shared();
    }
}

pub struct FiberSharedWriteGuard<'a> {
    shared: &'a FiberSharedMutex,
}

impl Drop for FiberSharedWriteGuard<'_> {
    fn drop(&mut self) {
        self.shared.unlock();
    }
}
