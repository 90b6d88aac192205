//! Thread-local state attached to each worker thread.
//!
//! This is the runtime's one sanctioned use of thread-local storage: each
//! worker thread carries its scheduler handle, its saved "worker fiber"
//! context (the OS thread converted into the first fiber), the per-thread
//! lifecycle registry, and a frame allocator for job scratch memory.
//! `attach`/`detach` are called exactly once each, in that order, per worker
//! lifetime; everything else is accessors.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::Arc;

use crate::allocator::FrameAllocator;
use crate::context::{ExecutionContext, SanitizerState};
use crate::fiber::FiberRef;
use crate::life_cycle::FiberLifeCycle;
use crate::scheduler::SchedulerCore;
use crate::worker::WorkerId;

pub(crate) struct WorkerContext {
    pub(crate) core: Arc<SchedulerCore>,
    pub(crate) id: WorkerId,
    /// Saved context of the worker's scheduling loop; fibers switch back into
    /// this to hand the OS thread to the scheduler.
    worker_context: UnsafeCell<ExecutionContext>,
    current_fiber: Cell<Option<FiberRef>>,
    /// Present on fiber workers only; I/O workers never run fibers.
    pub(crate) registry: Option<FiberLifeCycle>,
    allocator: RefCell<FrameAllocator>,
    pub(crate) san: SanitizerState,
}

impl WorkerContext {
    pub(crate) fn new(
        core: Arc<SchedulerCore>,
        id: WorkerId,
        registry: Option<FiberLifeCycle>,
        frame_allocator_bytes: usize,
    ) -> WorkerContext {
        WorkerContext {
            core,
            id,
            worker_context: UnsafeCell::new(ExecutionContext::new()),
            current_fiber: Cell::new(None),
            registry,
            allocator: RefCell::new(FrameAllocator::new(frame_allocator_bytes)),
            san: SanitizerState::for_thread(),
        }
    }

    pub(crate) fn worker_context_ptr(&self) -> *mut ExecutionContext {
        self.worker_context.get()
    }

    pub(crate) fn current_fiber(&self) -> Option<FiberRef> {
        self.current_fiber.get()
    }

    pub(crate) fn set_current_fiber(&self, fiber: Option<FiberRef>) {
        self.current_fiber.set(fiber);
    }

    /// Resets the frame allocator between job run segments. All scratch
    /// allocations from the previous segment die here.
    pub(crate) fn reset_frame_allocator(&self) {
        unsafe { self.allocator.borrow_mut().reset() };
    }
}

thread_local! {
    static CONTEXT: Cell<*mut WorkerContext> = const { Cell::new(std::ptr::null_mut()) };
}

/// Installs the context on the calling thread. Asserts it was not attached
/// already.
pub(crate) fn attach(context: Box<WorkerContext>) {
    let raw = Box::into_raw(context);
    CONTEXT.with(|slot| {
        assert!(slot.get().is_null(), "worker context attached twice");
        slot.set(raw);
    });
}

/// Removes and returns the context. Asserts one was attached.
pub(crate) fn detach() -> Box<WorkerContext> {
    CONTEXT.with(|slot| {
        let raw = slot.replace(std::ptr::null_mut());
        assert!(!raw.is_null(), "worker context detached without attach");
        unsafe { Box::from_raw(raw) }
    })
}

/// The calling thread's worker context, if this thread is a worker.
///
/// The returned reference is valid until `detach`, which only runs after the
/// worker loop has exited; callers must not store it beyond the current
/// operation.
pub(crate) fn current() -> Option<&'static WorkerContext> {
    let raw = CONTEXT.with(Cell::get);
    if raw.is_null() { None } else { Some(unsafe { &*raw }) }
}

/// The fiber the calling thread is currently executing, if any.
pub(crate) fn current_fiber() -> Option<FiberRef> {
    current().and_then(|ctx| ctx.current_fiber())
}

/// Runs `f` with the calling worker's frame allocator. Scratch allocations
/// live until the current job yields, waits or finishes; the borrow must not
/// be held across any of those.
///
/// # Panics
///
/// Panics when called from a thread that is not a worker.
pub fn with_frame_allocator<R>(f: impl FnOnce(&mut FrameAllocator) -> R) -> R {
    let ctx = current().expect("no worker context on this thread");
    f(&mut ctx.allocator.borrow_mut())
}
