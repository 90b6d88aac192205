//! Fibers: suspendable execution contexts with independently allocated stacks.
//!
//! A fiber owns a raw stack drawn from a fixed set of size classes and a
//! saved register context. Workers switch into a fiber to run a job; the
//! fiber switches back out when the job finishes, yields, or blocks on a
//! fiber primitive. Fibers are allocated once at pool-initialization time and
//! recycled through [`attach`](Fiber::attach)/[`detach`](Fiber::detach)/
//! [`reset`](Fiber::reset); they are only destroyed at pool teardown.

use std::alloc::{Layout, alloc, dealloc};
use std::cell::{Cell, UnsafeCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::context::{ExecutionContext, SanitizerState, switch_execution_context};
use crate::fiber_pool::PoolSlot;
use crate::job::{JobEntry, JobParam};
use crate::scheduler::SchedulerCore;
use crate::worker_context;

/// Fixed stack capacities a job may request. The oversized `External*`
/// classes exist for jobs that call into external libraries with unknown
/// stack appetites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum StackSizeClass {
    Micro,
    Tiny,
    Small,
    #[default]
    Normal,
    Elevated,
    Large,
    Huge,
    Gigantic,
    External,
    ExternalHuge,
}

impl StackSizeClass {
    pub const COUNT: usize = 10;

    pub const ALL: [StackSizeClass; Self::COUNT] = [
        StackSizeClass::Micro,
        StackSizeClass::Tiny,
        StackSizeClass::Small,
        StackSizeClass::Normal,
        StackSizeClass::Elevated,
        StackSizeClass::Large,
        StackSizeClass::Huge,
        StackSizeClass::Gigantic,
        StackSizeClass::External,
        StackSizeClass::ExternalHuge,
    ];

    /// Stack capacity in bytes.
    pub fn bytes(self) -> usize {
        match self {
            StackSizeClass::Micro => 16 * 1024,
            StackSizeClass::Tiny => 32 * 1024,
            StackSizeClass::Small => 64 * 1024,
            StackSizeClass::Normal => 128 * 1024,
            StackSizeClass::Elevated => 256 * 1024,
            StackSizeClass::Large => 512 * 1024,
            StackSizeClass::Huge => 1024 * 1024,
            StackSizeClass::Gigantic => 2 * 1024 * 1024,
            StackSizeClass::External => 4 * 1024 * 1024,
            StackSizeClass::ExternalHuge => 8 * 1024 * 1024,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`index`](StackSizeClass::index). Panics on an unknown
    /// class index.
    pub fn from_index(index: usize) -> StackSizeClass {
        Self::ALL[index]
    }
}

/// Monotonically assigned fiber identifier, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

impl FiberId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fiber({})", self.0)
    }
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Why a fiber handed control back to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchReason {
    /// Job ran to completion; return the fiber to its pool.
    Completed,
    /// Cooperative yield; requeue for resumption soon.
    Yielded,
    /// Parked in a primitive's waiter list; resumed by a notify/decrement.
    Waiting,
}

/// Lifecycle of a pooled fiber, used to assert the attach/detach contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Pooled,
    Attached,
    Finished,
    Detached,
}

// Waiter hand-off states, one transition per wake.
pub(crate) const WAIT_STATE_RUNNING: u32 = 0;
pub(crate) const WAIT_STATE_WAITING: u32 = 1;
pub(crate) const WAIT_STATE_SIGNALED: u32 = 2;

/// Shared raw reference to a pooled fiber. The arena keeps every fiber at a
/// stable address for the scheduler's lifetime, so the pointer stays valid
/// from pool initialization to teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FiberRef(pub(crate) *mut Fiber);

unsafe impl Send for FiberRef {}
unsafe impl Sync for FiberRef {}

impl FiberRef {
    #[inline]
    pub(crate) fn get(&self) -> &Fiber {
        unsafe { &*self.0 }
    }
}

const STACK_ALIGN: usize = 4096;
const STACK_RED_ZONE: usize = 1024;
const CANARY: u64 = 0xfbca_11ed_0dd5_7ac5;
const CANARY_WORDS: usize = 8;

/// Raw memory block used as a fiber stack.
struct FiberStack {
    base: NonNull<u8>,
    len: usize,
}

impl FiberStack {
    fn new(len: usize) -> FiberStack {
        let layout = Layout::from_size_align(len, STACK_ALIGN).expect("bad fiber stack layout");
        let ptr = unsafe { alloc(layout) };
        let base = NonNull::new(ptr).expect("fiber stack allocation failed");
        FiberStack { base, len }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, STACK_ALIGN).unwrap();
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

/// End-of-execution callback installed by the scheduler at attach time; fires
/// on the fiber after the entry point returns (even if the job panicked).
pub(crate) type EndCallback = fn(u64);

/// A suspendable execution context: stack + saved registers + the job
/// currently bound to it.
///
/// Cross-thread traffic goes exclusively through the atomic fields (`parked`,
/// `wait_state`, `next_waiter`); everything else is touched only by the OS
/// thread currently carrying the fiber.
pub(crate) struct Fiber {
    pub(crate) context: UnsafeCell<ExecutionContext>,
    stack: FiberStack,
    id: FiberId,
    pub(crate) slot: PoolSlot,

    entry: Cell<Option<JobEntry>>,
    param: Cell<JobParam>,
    end_callback: Cell<Option<EndCallback>>,
    end_callback_data: Cell<u64>,
    label: Cell<Option<&'static str>>,
    state: Cell<RunState>,
    switch_reason: Cell<SwitchReason>,

    /// True once the fiber's context save is complete after a suspend; a
    /// resumer must observe this before switching in.
    pub(crate) parked: AtomicBool,
    /// Intrusive link for counter/condvar waiter lists.
    pub(crate) next_waiter: AtomicPtr<Fiber>,
    pub(crate) wait_state: AtomicU32,
    /// Owning scheduler core; set once during pool initialization.
    pub(crate) core: Cell<*const SchedulerCore>,

    pub(crate) san: SanitizerState,
}

// See the struct docs for the field-access contract.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Allocates the stack and builds a poolable fiber. Called once per slot
    /// at pool-initialization time.
    pub(crate) fn initialize(slot: PoolSlot) -> Fiber {
        Fiber {
            context: UnsafeCell::new(ExecutionContext::new()),
            stack: FiberStack::new(slot.class.bytes()),
            id: FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed)),
            slot,
            entry: Cell::new(None),
            param: Cell::new(JobParam::null()),
            end_callback: Cell::new(None),
            end_callback_data: Cell::new(0),
            label: Cell::new(None),
            state: Cell::new(RunState::Pooled),
            switch_reason: Cell::new(SwitchReason::Completed),
            parked: AtomicBool::new(false),
            next_waiter: AtomicPtr::new(std::ptr::null_mut()),
            wait_state: AtomicU32::new(WAIT_STATE_RUNNING),
            core: Cell::new(std::ptr::null()),
            san: SanitizerState::for_fiber(),
        }
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn label(&self) -> Option<&'static str> {
        self.label.get()
    }

    /// Binds a job to this fiber and primes the saved context so the next
    /// switch into it begins executing `entry(param)`.
    pub(crate) fn attach(
        &self,
        entry: JobEntry,
        param: JobParam,
        end_callback: Option<EndCallback>,
        end_callback_data: u64,
        label: Option<&'static str>,
    ) {
        assert_eq!(
            self.state.get(),
            RunState::Pooled,
            "attach on a fiber that is not in the poolable state"
        );
        self.state.set(RunState::Attached);
        self.entry.set(Some(entry));
        self.param.set(param);
        self.end_callback.set(end_callback);
        self.end_callback_data.set(end_callback_data);
        self.label.set(label);
        self.parked.store(false, Ordering::Relaxed);
        self.wait_state.store(WAIT_STATE_RUNNING, Ordering::Relaxed);
        self.next_waiter.store(std::ptr::null_mut(), Ordering::Relaxed);

        self.write_canary();
        unsafe {
            (*self.context.get()).prime(
                self.stack.top(),
                fiber_entry,
                self as *const Fiber as *mut (),
            );
        }
    }

    /// Clears job-specific fields after completion. The stack is kept.
    pub(crate) fn detach(&self) {
        assert_eq!(
            self.state.get(),
            RunState::Finished,
            "detach on a fiber that has not finished its job"
        );
        self.check_canary();
        self.entry.set(None);
        self.param.set(JobParam::null());
        self.end_callback.set(None);
        self.end_callback_data.set(0);
        self.label.set(None);
        self.state.set(RunState::Detached);
    }

    /// Returns the fiber to a pristine, poolable state.
    pub(crate) fn reset(&self) {
        assert_eq!(self.state.get(), RunState::Detached, "reset before detach");
        self.parked.store(false, Ordering::Relaxed);
        self.wait_state.store(WAIT_STATE_RUNNING, Ordering::Relaxed);
        self.next_waiter.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.state.set(RunState::Pooled);
    }

    pub(crate) fn take_switch_reason(&self) -> SwitchReason {
        self.switch_reason.get()
    }

    pub(crate) fn stack_bottom(&self) -> *const u8 {
        self.stack.base()
    }

    pub(crate) fn stack_len(&self) -> usize {
        self.stack.len
    }

    /// Remaining bytes between an address on this fiber's stack and the
    /// red-zone floor. Used by the pre-switch overflow check.
    pub(crate) fn stack_headroom(&self, sp: usize) -> Option<usize> {
        let base = self.stack.base() as usize;
        let top = base + self.stack.len;
        if sp <= base + STACK_RED_ZONE || sp > top {
            return None;
        }
        Some(sp - (base + STACK_RED_ZONE))
    }

    fn check_stack_pointer(&self) {
        let marker = 0u8;
        let sp = &marker as *const u8 as usize;
        assert!(
            self.stack_headroom(sp).is_some(),
            "stack overflow on {} ({:?}, {} bytes)",
            self.id,
            self.slot.class,
            self.stack.len,
        );
    }

    fn write_canary(&self) {
        let words = self.stack.base() as *mut u64;
        for i in 0..CANARY_WORDS {
            unsafe { words.add(i).write(CANARY) };
        }
    }

    fn check_canary(&self) {
        let words = self.stack.base() as *const u64;
        for i in 0..CANARY_WORDS {
            let intact = unsafe { words.add(i).read() } == CANARY;
            assert!(
                intact,
                "stack overflow on {} ({:?}): canary clobbered",
                self.id, self.slot.class,
            );
        }
    }
}

/// First Rust frame on a fresh fiber stack. Runs the attached job, fires the
/// end callback and switches back to the worker for the last time.
extern "C" fn fiber_entry(raw: *mut ()) -> ! {
    let fiber: &Fiber = unsafe { &*(raw as *const Fiber) };
    SanitizerState::after_switch(&fiber.san);

    let entry = fiber.entry.take().expect("fiber entered without an attached job");
    let param = fiber.param.get();

    // Panics must not unwind across the context-switch boundary.
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| entry(param))) {
        log::error!(
            "job panicked on {}: {}",
            fiber.id,
            panic_message(payload.as_ref())
        );
    }

    if let Some(callback) = fiber.end_callback.get() {
        callback(fiber.end_callback_data.get());
    }

    fiber.state.set(RunState::Finished);
    switch_to_worker(SwitchReason::Completed);
    // A finished fiber must never be resumed.
    std::process::abort();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

/// Suspends the current fiber and resumes its worker's scheduling loop.
///
/// For `Waiting` the caller must already have published the fiber to the
/// waiter list it blocks on; the worker flips `parked` once the context save
/// is complete, and only then may a resumer switch back in.
pub(crate) fn switch_to_worker(reason: SwitchReason) {
    let ctx = worker_context::current().expect("fiber suspend outside a worker thread");
    let fiber_ref = ctx.current_fiber().expect("fiber suspend outside a fiber");
    let fiber = fiber_ref.get();

    fiber.check_stack_pointer();
    fiber.switch_reason.set(reason);

    SanitizerState::before_switch(&fiber.san, &ctx.san, std::ptr::null(), 0);
    unsafe { switch_execution_context(fiber.context.get(), ctx.worker_context_ptr()) };
    // Back on the fiber: someone resumed us.
    SanitizerState::after_switch(&fiber.san);
}

/// Switches a worker thread into a fiber and handles the return. Only worker
/// loops call this; `ctx` must be the calling thread's own context.
pub(crate) fn switch_into_fiber(ctx: &worker_context::WorkerContext, fiber_ref: FiberRef) {
    let fiber = fiber_ref.get();
    if let Some(current) = ctx.current_fiber() {
        assert!(current.0 != fiber_ref.0, "fiber switching into itself");
    }

    ctx.set_current_fiber(Some(fiber_ref));
    SanitizerState::before_switch(&ctx.san, &fiber.san, fiber.stack_bottom(), fiber.stack_len());
    unsafe { switch_execution_context(ctx.worker_context_ptr(), fiber.context.get()) };
    SanitizerState::after_switch(&ctx.san);
    ctx.set_current_fiber(None);
}

/// Cooperatively yields. On a fiber this suspends it and resumes the worker's
/// scheduling loop; on a plain OS thread it degrades to an OS yield.
pub fn yield_now() {
    if worker_context::current_fiber().is_some() {
        switch_to_worker(SwitchReason::Yielded);
    } else {
        std::thread::yield_now();
    }
}

/// True when the calling code is running on a fiber.
pub fn is_fiber() -> bool {
    worker_context::current_fiber().is_some()
}

/// Identifier of the current fiber, if any.
pub fn current_fiber_id() -> Option<FiberId> {
    worker_context::current_fiber().map(|f| f.get().id())
}

/// Cooperatively sleeps until the deadline elapses. This is the runtime's
/// only timeout facility; precision is bounded by scheduling latency.
pub fn sleep(duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_classes_are_ordered_and_distinct() {
        let mut previous = 0;
        for class in StackSizeClass::ALL {
            assert!(class.bytes() > previous);
            previous = class.bytes();
            assert_eq!(StackSizeClass::from_index(class.index()), class);
        }
    }

    #[test]
    fn headroom_math() {
        let fiber = Fiber::initialize(PoolSlot {
            class: StackSizeClass::Micro,
            index: 0,
        });
        let base = fiber.stack_bottom() as usize;
        let top = base + fiber.stack_len();

        // Deep inside the stack: plenty of headroom.
        assert!(fiber.stack_headroom(top - 64).unwrap() > 14 * 1024);
        // Inside the red zone: overflow.
        assert!(fiber.stack_headroom(base + 8).is_none());
        // Off-stack entirely: overflow.
        assert!(fiber.stack_headroom(base + fiber.stack_len() + 64).is_none());
    }

    #[test]
    fn overflow_detected_before_the_normal_stack_is_exceeded() {
        let fiber = Fiber::initialize(PoolSlot {
            class: StackSizeClass::Normal,
            index: 0,
        });
        let base = fiber.stack_bottom() as usize;

        // A stack pointer that has recursed down to the red zone trips the
        // pre-switch check while still inside the allocation, i.e. before any
        // write past the base could corrupt neighboring memory.
        assert!(fiber.stack_headroom(base + STACK_RED_ZONE).is_none());
        assert!(fiber.stack_headroom(base + STACK_RED_ZONE + 1).is_some());
        assert_eq!(
            fiber.stack_headroom(base + fiber.stack_len()),
            Some(fiber.stack_len() - STACK_RED_ZONE)
        );
    }

    #[test]
    fn canary_survives_attach_detach() {
        fn noop(_: JobParam) {}

        let fiber = Fiber::initialize(PoolSlot {
            class: StackSizeClass::Micro,
            index: 0,
        });
        fiber.attach(noop, JobParam::null(), None, 0, None);
        // Simulate completion without running: the canary block is untouched.
        fiber.state.set(RunState::Finished);
        fiber.detach();
        fiber.reset();
        fiber.attach(noop, JobParam::null(), None, 0, Some("again"));
        assert_eq!(fiber.label(), Some("again"));
    }

    #[test]
    #[should_panic(expected = "not in the poolable state")]
    fn double_attach_asserts() {
        fn noop(_: JobParam) {}

        let fiber = Fiber::initialize(PoolSlot {
            class: StackSizeClass::Micro,
            index: 0,
        });
        fiber.attach(noop, JobParam::null(), None, 0, None);
        fiber.attach(noop, JobParam::null(), None, 0, None);
    }

    #[test]
    fn ids_are_monotonic() {
        let a = Fiber::initialize(PoolSlot {
            class: StackSizeClass::Micro,
            index: 0,
        });
        let b = Fiber::initialize(PoolSlot {
            class: StackSizeClass::Micro,
            index: 1,
        });
        assert!(b.id().as_u64() > a.id().as_u64());
    }
}
