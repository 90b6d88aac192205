//! The scheduler: queues, pools, worker threads and the two scheduling loops.
//!
//! External code builds a [`JobDescriptor`] and calls [`Scheduler::kick`] or
//! [`Scheduler::kick_and_wait`]. A fiber worker pops the descriptor, borrows
//! a fiber of the matching stack class, switches into it and runs the job to
//! completion (or until it suspends on a primitive). I/O jobs bypass fibers
//! entirely and run directly on dedicated I/O worker threads.
//!
//! One scheduler exists per process. It is an explicit object handed to
//! workers at spawn time — the only process-global state is the per-thread
//! worker context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::counter::{CounterGuard, CounterHandle, CounterPool, wait_on};
use crate::fiber::{FiberRef, StackSizeClass, SwitchReason, switch_into_fiber};
use crate::fiber_pool::FiberPool;
use crate::job::{IoJobDescriptor, JobDescriptor};
use crate::life_cycle::FiberLifeCycle;
use crate::queue::{JobQueues, push_with_backoff};
use crate::trace;
use crate::worker::{Worker, WorkerId, WorkerKind};
use crate::worker_context::{self, WorkerContext};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Number of pooled fibers per stack-size class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberCounts {
    pub micro: usize,
    pub tiny: usize,
    pub small: usize,
    pub normal: usize,
    pub elevated: usize,
    pub large: usize,
    pub huge: usize,
    pub gigantic: usize,
    pub external: usize,
    pub external_huge: usize,
}

impl Default for FiberCounts {
    fn default() -> Self {
        FiberCounts {
            micro: 32,
            tiny: 32,
            small: 32,
            normal: 64,
            elevated: 16,
            large: 8,
            huge: 4,
            gigantic: 2,
            external: 2,
            external_huge: 1,
        }
    }
}

impl FiberCounts {
    pub fn for_class(&self, class: StackSizeClass) -> usize {
        match class {
            StackSizeClass::Micro => self.micro,
            StackSizeClass::Tiny => self.tiny,
            StackSizeClass::Small => self.small,
            StackSizeClass::Normal => self.normal,
            StackSizeClass::Elevated => self.elevated,
            StackSizeClass::Large => self.large,
            StackSizeClass::Huge => self.huge,
            StackSizeClass::Gigantic => self.gigantic,
            StackSizeClass::External => self.external,
            StackSizeClass::ExternalHuge => self.external_huge,
        }
    }

    pub fn total(&self) -> usize {
        StackSizeClass::ALL
            .iter()
            .map(|class| self.for_class(*class))
            .sum()
    }
}

/// Scheduler configuration, supplied by an external configuration
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Forced fiber-worker count; derived from hardware concurrency when
    /// absent.
    pub fiber_workers: Option<usize>,
    /// Forced I/O-worker count; [`SchedulerConfig::DEFAULT_IO_WORKERS`] when
    /// absent.
    pub io_workers: Option<usize>,
    pub fiber_counts: FiberCounts,
    pub counter_capacity: usize,
    /// Capacity of each priority tier, the I/O queue and the main-thread
    /// queue.
    pub queue_capacity: usize,
    /// When set, the thread calling [`Scheduler::run`] becomes fiber worker 0
    /// and `run` blocks until shutdown is requested.
    pub main_thread_is_worker: bool,
    /// Priority-aging interval. Zero promotes on every loop iteration.
    pub promotion_interval_ms: u64,
    /// Linear core pinning for fiber workers.
    pub pin_fiber_workers: bool,
    /// Per-worker scratch frame capacity.
    pub frame_allocator_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            fiber_workers: None,
            io_workers: None,
            fiber_counts: FiberCounts::default(),
            counter_capacity: 1024,
            queue_capacity: 4096,
            main_thread_is_worker: true,
            promotion_interval_ms: 1000,
            pin_fiber_workers: false,
            frame_allocator_bytes: 256 * 1024,
        }
    }
}

impl SchedulerConfig {
    pub const DEFAULT_IO_WORKERS: usize = 2;
}

/// Worker threads that died with a panic during shutdown.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("{0} worker thread(s) panicked")]
    WorkersPanicked(usize),
}

/// Shared scheduler state: everything the worker loops touch. Queues and
/// pools are lock-free MPMC; the remaining fields are written only during
/// initialize/shutdown, which are never concurrent with job execution.
pub(crate) struct SchedulerCore {
    config: SchedulerConfig,
    queues: JobQueues,
    io_queue: ArrayQueue<IoJobDescriptor>,
    main_queue: ArrayQueue<IoJobDescriptor>,
    /// Fibers made runnable from non-fiber-worker threads.
    resume_queue: ArrayQueue<FiberRef>,
    fiber_pools: Box<[FiberPool]>,
    counters: CounterPool,
    shutdown: AtomicBool,
    next_fiber_worker: AtomicU32,
    next_io_worker: AtomicU32,
    main_thread: std::sync::OnceLock<ThreadId>,
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Metrics,
}

impl SchedulerCore {
    fn new(config: SchedulerConfig) -> SchedulerCore {
        let fiber_pools: Box<[FiberPool]> = StackSizeClass::ALL
            .iter()
            .map(|class| FiberPool::new(*class, config.fiber_counts.for_class(*class)))
            .collect();
        let total_fibers = config.fiber_counts.total();
        SchedulerCore {
            queues: JobQueues::new(config.queue_capacity),
            io_queue: ArrayQueue::new(config.queue_capacity),
            main_queue: ArrayQueue::new(config.queue_capacity),
            resume_queue: ArrayQueue::new(total_fibers.max(1)),
            fiber_pools,
            counters: CounterPool::new(config.counter_capacity),
            shutdown: AtomicBool::new(false),
            next_fiber_worker: AtomicU32::new(0),
            next_io_worker: AtomicU32::new(0),
            main_thread: std::sync::OnceLock::new(),
            #[cfg(feature = "metrics")]
            metrics: Metrics::new(),
            config,
        }
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn counters(&self) -> &CounterPool {
        &self.counters
    }

    pub(crate) fn total_fiber_capacity(&self) -> usize {
        self.fiber_pools.iter().map(FiberPool::capacity).sum()
    }

    fn pool_for(&self, class: StackSizeClass) -> &FiberPool {
        &self.fiber_pools[class.index()]
    }

    pub(crate) fn push_resume(&self, fiber: FiberRef) {
        push_with_backoff(&self.resume_queue, fiber);
    }

    pub(crate) fn next_worker_id(&self, kind: WorkerKind) -> WorkerId {
        let counter = match kind {
            WorkerKind::Fiber => &self.next_fiber_worker,
            WorkerKind::Io => &self.next_io_worker,
        };
        WorkerId::new(kind, counter.fetch_add(1, Ordering::Relaxed))
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // -- fiber worker loop --------------------------------------------------

    /// Scheduling loop for one fiber worker. `drain_main` is set only on the
    /// worker occupying the designated main thread.
    pub(crate) fn work_on_fibers(&self, ctx: &WorkerContext, drain_main: bool) {
        let interval = Duration::from_millis(self.config.promotion_interval_ms);
        let mut last_promotion = Instant::now();
        let backoff = Backoff::new();

        while !self.shutdown_requested() {
            if last_promotion.elapsed() >= interval {
                self.queues.promote();
                #[cfg(feature = "metrics")]
                self.metrics.promotions.fetch_add(1, Ordering::Relaxed);
                last_promotion = Instant::now();
            }

            if drain_main {
                self.drain_main_thread_jobs(ctx.id.as_u64());
            }

            if let Some(job) = self.queues.pop() {
                self.execute_job(ctx, job);
                // Recycle and resume between jobs so yielded fibers make
                // progress even while the queues stay full.
                self.drain_completed(ctx);
                self.wake_one_sleeping(ctx);
                backoff.reset();
                continue;
            }

            self.drain_completed(ctx);
            if self.wake_one_sleeping(ctx) {
                backoff.reset();
                continue;
            }
            backoff.snooze();
        }

        self.drain_completed(ctx);
    }

    fn execute_job(&self, ctx: &WorkerContext, job: JobDescriptor) {
        let pool = self.pool_for(job.stack_class);
        assert!(
            pool.capacity() > 0,
            "no fibers configured for stack class {:?}",
            job.stack_class
        );

        // Pool exhaustion is transient: keep recycling completed fibers and
        // resuming sleepers until a fiber of this class frees up.
        let backoff = Backoff::new();
        let fiber_ref = loop {
            if let Some(fiber) = pool.acquire() {
                break fiber;
            }
            #[cfg(feature = "metrics")]
            self.metrics
                .fiber_exhaustion_spins
                .fetch_add(1, Ordering::Relaxed);
            self.drain_completed(ctx);
            self.wake_one_sleeping(ctx);
            backoff.snooze();
        };
        #[cfg(feature = "metrics")]
        self.metrics.fibers_acquired.fetch_add(1, Ordering::Relaxed);

        let (end_callback, end_callback_data) = match job.counter {
            Some(handle) => (
                Some(job_completion_callback as crate::fiber::EndCallback),
                handle.pack(),
            ),
            None => (None, 0),
        };
        fiber_ref.get().attach(
            job.entry,
            job.param,
            end_callback,
            end_callback_data,
            job.label,
        );

        {
            let _span = trace::TraceGuard::new(job.label.unwrap_or("job"), ctx.id.as_u64());
            switch_into_fiber(ctx, fiber_ref);
        }
        ctx.reset_frame_allocator();
        self.handle_switch_return(ctx, fiber_ref);

        #[cfg(feature = "metrics")]
        self.metrics.jobs_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Files the fiber according to why it switched back.
    fn handle_switch_return(&self, ctx: &WorkerContext, fiber_ref: FiberRef) {
        let registry = self.registry(ctx);
        let fiber = fiber_ref.get();
        match fiber.take_switch_reason() {
            SwitchReason::Completed => registry.put_to_completed(fiber_ref),
            SwitchReason::Yielded => {
                // Park flag ordering: the flag must only flip after the
                // context save completed, which it has once we are here.
                fiber.parked.store(true, Ordering::Release);
                registry.put_to_sleep(fiber_ref);
            }
            SwitchReason::Waiting => {
                // The fiber already sits in some primitive's waiter list;
                // flipping the flag licenses its resumer.
                fiber.parked.store(true, Ordering::Release);
            }
        }
    }

    fn registry<'a>(&self, ctx: &'a WorkerContext) -> &'a FiberLifeCycle {
        ctx.registry
            .as_ref()
            .expect("fiber scheduling on a worker without a lifecycle registry")
    }

    /// Returns completed fibers to their pools.
    fn drain_completed(&self, ctx: &WorkerContext) {
        let registry = self.registry(ctx);
        while let Some(fiber_ref) = registry.try_get_completed() {
            let fiber = fiber_ref.get();
            fiber.detach();
            fiber.reset();
            self.pool_for(fiber.slot.class).release(fiber_ref);
        }
    }

    /// Resumes one runnable fiber: local sleep queue first, then the global
    /// resume queue. Returns whether anything ran.
    fn wake_one_sleeping(&self, ctx: &WorkerContext) -> bool {
        let fiber_ref = if let Some(local) = self.registry(ctx).try_waking_up() {
            #[cfg(feature = "metrics")]
            self.metrics.resumes_local.fetch_add(1, Ordering::Relaxed);
            local
        } else if let Some(global) = self.resume_queue.pop() {
            #[cfg(feature = "metrics")]
            self.metrics.resumes_global.fetch_add(1, Ordering::Relaxed);
            global
        } else {
            return false;
        };
        self.resume_fiber(ctx, fiber_ref);
        true
    }

    fn resume_fiber(&self, ctx: &WorkerContext, fiber_ref: FiberRef) {
        let fiber = fiber_ref.get();
        // The fiber may have been handed to us before its switch-out finished
        // saving the context; wait for the park flag.
        let backoff = Backoff::new();
        while !fiber.parked.load(Ordering::Acquire) {
            backoff.snooze();
        }
        fiber.parked.store(false, Ordering::Relaxed);

        {
            let _span = trace::TraceGuard::new(fiber.label().unwrap_or("resume"), ctx.id.as_u64());
            switch_into_fiber(ctx, fiber_ref);
        }
        ctx.reset_frame_allocator();
        self.handle_switch_return(ctx, fiber_ref);
    }

    // -- I/O worker loop ----------------------------------------------------

    /// Loop for one I/O worker: execute blocking jobs directly on this OS
    /// thread, never on a fiber.
    pub(crate) fn work_on_io(&self, ctx: &WorkerContext) {
        let backoff = Backoff::new();
        while !self.shutdown_requested() {
            match self.io_queue.pop() {
                Some(job) => {
                    self.run_blocking_job(&job, "io_job", ctx.id.as_u64());
                    ctx.reset_frame_allocator();
                    #[cfg(feature = "metrics")]
                    self.metrics.io_jobs_executed.fetch_add(1, Ordering::Relaxed);
                    backoff.reset();
                }
                None => backoff.snooze(),
            }
        }
    }

    fn run_blocking_job(&self, job: &IoJobDescriptor, default_label: &'static str, worker: u64) {
        {
            let _span = trace::TraceGuard::new(job.label.unwrap_or(default_label), worker);
            let entry = job.entry;
            let param = job.param;
            if let Err(payload) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry(param)))
            {
                let message: &str = if let Some(s) = payload.downcast_ref::<&str>() {
                    s
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.as_str()
                } else {
                    "unknown panic payload"
                };
                log::error!("blocking job panicked: {message}");
            }
        }
        if let Some(handle) = job.counter {
            self.counters.get(handle).decrement();
        }
    }

    // -- main-thread queue --------------------------------------------------

    pub(crate) fn kick_on_main(&self, job: IoJobDescriptor) {
        if let Some(handle) = job.counter {
            self.counters.get(handle).increment();
        }
        push_with_backoff(&self.main_queue, job);
    }

    pub(crate) fn drain_main_thread_jobs(&self, worker: u64) -> usize {
        let mut executed = 0;
        while let Some(job) = self.main_queue.pop() {
            self.run_blocking_job(&job, "main_thread_job", worker);
            #[cfg(feature = "metrics")]
            self.metrics
                .main_thread_jobs_executed
                .fetch_add(1, Ordering::Relaxed);
            executed += 1;
        }
        executed
    }
}

/// Decrements the job's counter when its entry point returns. Installed on
/// the fiber at attach time; runs on the fiber, inside a worker thread.
fn job_completion_callback(data: u64) {
    let ctx = worker_context::current().expect("job completion outside a worker thread");
    let handle = CounterHandle::unpack(data);
    ctx.core.counters().get(handle).decrement();
}

/// Resolved worker-thread counts.
fn resolve_worker_counts(config: &SchedulerConfig) -> (usize, usize) {
    let hardware = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let io = config
        .io_workers
        .unwrap_or(SchedulerConfig::DEFAULT_IO_WORKERS)
        .max(1);
    let fiber = config
        .fiber_workers
        .unwrap_or_else(|| hardware.saturating_sub(io).max(1));
    if fiber + io > hardware {
        log::warn!(
            "worker oversubscription: {fiber} fiber + {io} I/O workers on {hardware} hardware threads"
        );
    }
    (fiber, io)
}

/// The process-wide job scheduler.
///
/// Construct with [`initialize`](Scheduler::initialize), start workers with
/// [`run`](Scheduler::run), stop with [`request_shutdown`](Scheduler::request_shutdown)
/// + [`shutdown`](Scheduler::shutdown).
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    workers: Vec<Worker>,
    running: bool,
}

impl Scheduler {
    /// Builds every fiber pool, the counter pool and all queues. No threads
    /// are started yet.
    pub fn initialize(config: SchedulerConfig) -> Scheduler {
        let core = Arc::new(SchedulerCore::new(config));
        // Back-wire each pooled fiber to its owning core so primitives can
        // requeue fibers from non-worker threads.
        let raw = Arc::as_ptr(&core);
        for pool in core.fiber_pools.iter() {
            for fiber in pool.fibers() {
                fiber.core.set(raw);
            }
        }
        Scheduler {
            core,
            workers: Vec::new(),
            running: false,
        }
    }

    /// Resolves worker counts, spawns the worker threads and — when the
    /// configuration marks the main thread as a worker — converts the calling
    /// thread into fiber worker 0 and runs its scheduling loop until shutdown
    /// is requested. Otherwise returns immediately.
    pub fn run(&mut self) {
        assert!(!self.running, "Scheduler::run called twice");
        self.running = true;
        self.core
            .main_thread
            .set(std::thread::current().id())
            .expect("main thread recorded twice");

        let (fiber_workers, io_workers) = resolve_worker_counts(&self.core.config);

        for _ in 0..io_workers {
            let id = self.core.next_worker_id(WorkerKind::Io);
            self.workers.push(Worker::spawn(self.core.clone(), id, None));
        }

        let inline_id = if self.core.config.main_thread_is_worker {
            Some(self.core.next_worker_id(WorkerKind::Fiber))
        } else {
            None
        };
        let spawned_fiber_workers = fiber_workers.saturating_sub(usize::from(inline_id.is_some()));
        for _ in 0..spawned_fiber_workers {
            let id = self.core.next_worker_id(WorkerKind::Fiber);
            let pin = self
                .core
                .config
                .pin_fiber_workers
                .then_some(id.index() as usize);
            self.workers.push(Worker::spawn(self.core.clone(), id, pin));
        }

        if let Some(id) = inline_id {
            crate::worker::run_fiber_worker(&self.core, id, true);
        }
    }

    /// Signals both loop kinds to exit after their current iteration.
    pub fn request_shutdown(&self) {
        self.core.shutdown.store(true, Ordering::Release);
    }

    /// Requests shutdown, joins every worker thread and destroys the pools.
    pub fn shutdown(mut self) -> Result<(), ShutdownError> {
        self.request_shutdown();
        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            let id = worker.id();
            if worker.join().is_err() {
                panicked += 1;
                log::error!("worker {id} panicked");
            }
        }
        if panicked == 0 {
            Ok(())
        } else {
            Err(ShutdownError::WorkersPanicked(panicked))
        }
    }

    // -- submission ---------------------------------------------------------

    /// Enqueues one fiber job. Increments its counter (when present) before
    /// the push, so a wait issued right after `kick` can never miss the job.
    pub fn kick(&self, job: JobDescriptor) {
        assert!(
            self.core.pool_for(job.stack_class).capacity() > 0,
            "no fibers configured for stack class {:?}",
            job.stack_class
        );
        if let Some(handle) = job.counter {
            self.core.counters.get(handle).increment();
        }
        self.core.queues.push(job);
    }

    pub fn kick_batch(&self, jobs: &[JobDescriptor]) {
        for job in jobs {
            self.kick(*job);
        }
    }

    /// Kicks and blocks until the job's counter reaches zero. The descriptor
    /// must carry a counter: the scheduler never allocates one silently.
    pub fn kick_and_wait(&self, job: JobDescriptor) {
        let counter = job
            .counter
            .expect("kick_and_wait requires a descriptor with a counter");
        self.kick(job);
        self.wait(counter);
    }

    /// Kicks all descriptors, then waits for every counter they carry. Each
    /// descriptor must carry one.
    pub fn kick_and_wait_batch(&self, jobs: &[JobDescriptor]) {
        for job in jobs {
            assert!(
                job.counter.is_some(),
                "kick_and_wait_batch requires counters on every descriptor"
            );
        }
        self.kick_batch(jobs);
        for job in jobs {
            self.wait(job.counter.unwrap());
        }
    }

    /// Enqueues one blocking job for the I/O workers.
    pub fn kick_io(&self, job: IoJobDescriptor) {
        if let Some(handle) = job.counter {
            self.core.counters.get(handle).increment();
        }
        push_with_backoff(&self.core.io_queue, job);
    }

    pub fn kick_io_and_wait(&self, job: IoJobDescriptor) {
        let counter = job
            .counter
            .expect("kick_io_and_wait requires a descriptor with a counter");
        self.kick_io(job);
        self.wait(counter);
    }

    /// Queues a job that must execute on the designated main thread (e.g.
    /// windowing calls), even when multithreaded execution is enabled.
    pub fn kick_on_main(&self, job: IoJobDescriptor) {
        self.core.kick_on_main(job);
    }

    /// Drains the main-thread queue. Must be called from the thread that
    /// called [`run`](Scheduler::run); the participating main-thread worker
    /// does this automatically each loop iteration. Returns the number of
    /// jobs executed.
    pub fn run_main_thread_jobs(&self) -> usize {
        if let Some(recorded) = self.core.main_thread.get() {
            assert_eq!(
                *recorded,
                std::thread::current().id(),
                "main-thread jobs drained off the designated thread"
            );
        }
        self.core.drain_main_thread_jobs(0)
    }

    // -- counters -----------------------------------------------------------

    /// Acquires a counter from the pool. Must be released exactly once via
    /// [`destroy_counter`](Scheduler::destroy_counter).
    pub fn generate_counter(&self) -> CounterHandle {
        #[cfg(feature = "metrics")]
        self.core
            .metrics
            .counters_acquired
            .fetch_add(1, Ordering::Relaxed);
        self.core.counters.acquire()
    }

    /// Returns a counter to the pool. The counter must be at zero.
    pub fn destroy_counter(&self, handle: CounterHandle) {
        self.core.counters.release(handle);
    }

    /// RAII wrapper around generate/destroy.
    pub fn counter_guard(&self) -> CounterGuard<'_> {
        CounterGuard::new(self)
    }

    /// Blocks the calling fiber (cooperatively) or thread (busy-spin) until
    /// the counter reaches zero.
    pub fn wait(&self, handle: CounterHandle) {
        wait_on(self.core.counters.get(handle));
    }

    pub fn counter_value(&self, handle: CounterHandle) -> usize {
        self.core.counters.get(handle).value()
    }

    pub fn counter_is_zero(&self, handle: CounterHandle) -> bool {
        self.core.counters.get(handle).is_zero()
    }

    // -- introspection ------------------------------------------------------

    /// Fibers currently available per stack class.
    pub fn available_fibers(&self, class: StackSizeClass) -> usize {
        self.core.pool_for(class).available()
    }

    pub fn queues_are_empty(&self) -> bool {
        self.core.queues.is_empty()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot {
        self.core.metrics.snapshot()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.request_shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_counts_respect_forced_values() {
        let config = SchedulerConfig {
            fiber_workers: Some(3),
            io_workers: Some(2),
            ..Default::default()
        };
        assert_eq!(resolve_worker_counts(&config), (3, 2));
    }

    #[test]
    fn worker_counts_derive_from_hardware() {
        let config = SchedulerConfig {
            io_workers: Some(1),
            ..Default::default()
        };
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let (fiber, io) = resolve_worker_counts(&config);
        assert_eq!(io, 1);
        assert_eq!(fiber, hardware.saturating_sub(1).max(1));
    }

    #[test]
    fn io_worker_count_never_zero() {
        let config = SchedulerConfig {
            io_workers: Some(0),
            ..Default::default()
        };
        let (_, io) = resolve_worker_counts(&config);
        assert_eq!(io, 1);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = SchedulerConfig {
            fiber_workers: Some(4),
            promotion_interval_ms: 250,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.fiber_workers, Some(4));
        assert_eq!(parsed.promotion_interval_ms, 250);
        assert_eq!(parsed.fiber_counts.normal, config.fiber_counts.normal);
    }

    #[test]
    fn fiber_counts_total() {
        let counts = FiberCounts::default();
        assert_eq!(
            counts.total(),
            StackSizeClass::ALL
                .iter()
                .map(|c| counts.for_class(*c))
                .sum::<usize>()
        );
    }
}
