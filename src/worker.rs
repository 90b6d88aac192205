//! Worker threads: thin OS-thread wrappers running one of the scheduler's
//! two loop bodies.
//!
//! A fiber worker converts its OS thread into the "worker fiber" (the context
//! every job fiber switches back into) and owns a lifecycle registry. An I/O
//! worker never runs fibers; it executes blocking jobs directly on its OS
//! thread. Exactly one fiber worker may run inline on the thread that calls
//! `Scheduler::run`; all others are spawned here.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::life_cycle::FiberLifeCycle;
use crate::scheduler::SchedulerCore;
use crate::trace;
use crate::worker_context::{self, WorkerContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerKind {
    Fiber = 0,
    Io = 1,
}

/// Worker identity: kind tag + monotonic per-kind index, packed into one
/// comparable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId {
    kind: WorkerKind,
    index: u32,
}

impl WorkerId {
    pub(crate) fn new(kind: WorkerKind, index: u32) -> WorkerId {
        WorkerId { kind, index }
    }

    pub fn kind(self) -> WorkerKind {
        self.kind
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn as_u64(self) -> u64 {
        ((self.kind as u64) << 32) | u64::from(self.index)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            WorkerKind::Fiber => write!(f, "fiber-{}", self.index),
            WorkerKind::Io => write!(f, "io-{}", self.index),
        }
    }
}

/// One spawned OS worker thread.
pub(crate) struct Worker {
    id: WorkerId,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the thread and runs the loop matching `id`'s kind until
    /// shutdown. `pin` optionally pins the thread to a logical core (linear
    /// mapping).
    pub(crate) fn spawn(core: Arc<SchedulerCore>, id: WorkerId, pin: Option<usize>) -> Worker {
        let handle = thread::Builder::new()
            .name(format!("fk-{id}"))
            .spawn(move || {
                if let Some(core_index) = pin {
                    pin_to_core(core_index);
                }
                match id.kind() {
                    WorkerKind::Fiber => run_fiber_worker(&core, id, false),
                    WorkerKind::Io => run_io_worker(&core, id),
                }
            })
            .expect("failed to spawn worker thread");
        Worker {
            id,
            handle: Some(handle),
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

fn pin_to_core(index: usize) {
    if let Some(core_ids) = core_affinity::get_core_ids() {
        match core_ids.get(index) {
            Some(core_id) => {
                core_affinity::set_for_current(*core_id);
            }
            None => log::warn!("no logical core {index} to pin a worker to"),
        }
    }
}

/// Attach → scheduling loop → detach, for a fiber worker. `drain_main` is set
/// only for the worker occupying the designated main thread.
pub(crate) fn run_fiber_worker(core: &Arc<SchedulerCore>, id: WorkerId, drain_main: bool) {
    let registry = FiberLifeCycle::new(core.total_fiber_capacity().max(1));
    worker_context::attach(Box::new(WorkerContext::new(
        core.clone(),
        id,
        Some(registry),
        core.config().frame_allocator_bytes,
    )));
    {
        let _collector = trace::CollectorGuard;
        let ctx = worker_context::current().expect("worker context missing after attach");
        core.work_on_fibers(ctx, drain_main);
    }
    let _ = worker_context::detach();
}

/// Attach → I/O loop → detach. No fiber conversion and no registry.
pub(crate) fn run_io_worker(core: &Arc<SchedulerCore>, id: WorkerId) {
    worker_context::attach(Box::new(WorkerContext::new(
        core.clone(),
        id,
        None,
        core.config().frame_allocator_bytes,
    )));
    {
        let _collector = trace::CollectorGuard;
        let ctx = worker_context::current().expect("worker context missing after attach");
        core.work_on_io(ctx);
    }
    let _ = worker_context::detach();
}

/// True when the calling thread is a fiber worker.
pub fn is_fiber_worker() -> bool {
    worker_context::current().is_some_and(|ctx| ctx.id.kind() == WorkerKind::Fiber)
}

/// True when the calling thread is an I/O worker.
pub fn is_io_worker() -> bool {
    worker_context::current().is_some_and(|ctx| ctx.id.kind() == WorkerKind::Io)
}
