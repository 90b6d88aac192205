//! # fiberkick — fiber-based job scheduler
//!
//! Multiplexes a large number of short-lived, cooperatively-scheduled jobs
//! onto a fixed pool of OS worker threads using stackful fibers, lock-free
//! priority queues and counter-based completion signaling.
//!
//! ## Architecture
//!
//! - **Fibers**: suspendable execution contexts with independently allocated
//!   stacks, drawn from fixed size classes and switched via a hand-written
//!   register-context swap
//! - **Job queues**: three global lock-free priority tiers with periodic
//!   promotion (aging), plus a separate queue for blocking I/O jobs
//! - **Counters**: pooled atomic completion counts used to wait for one or
//!   many jobs
//! - **Workers**: OS threads running either the fiber-scheduling loop or the
//!   I/O-execution loop
//!
//! Jobs yield only cooperatively — at [`yield_now`], on a fiber primitive
//! ([`sync`]), or by finishing. There is no preemption and no work-stealing;
//! every worker pops from the same global queues.
//!
//! ## Example
//!
//! ```no_run
//! use fiberkick::{JobDescriptor, JobParam, Priority, Scheduler, SchedulerConfig, StackSizeClass};
//!
//! fn hello(_: JobParam) {
//!     println!("hello from a fiber job");
//! }
//!
//! let mut scheduler = Scheduler::initialize(SchedulerConfig {
//!     main_thread_is_worker: false,
//!     ..Default::default()
//! });
//! scheduler.run();
//!
//! let counter = scheduler.generate_counter();
//! scheduler.kick_and_wait(
//!     JobDescriptor::new(Priority::Normal, hello, JobParam::null(), StackSizeClass::Normal)
//!         .with_counter(counter),
//! );
//! scheduler.destroy_counter(counter);
//!
//! scheduler.request_shutdown();
//! scheduler.shutdown().unwrap();
//! ```

pub mod allocator;
mod context;
pub mod counter;
pub mod fiber;
mod fiber_pool;
pub mod job;
mod life_cycle;
pub mod metrics;
mod queue;
pub mod scheduler;
pub mod sync;
pub mod trace;
pub mod worker;
mod worker_context;

pub use allocator::FrameAllocator;
pub use counter::{CounterGuard, CounterHandle};
pub use fiber::{FiberId, StackSizeClass, current_fiber_id, is_fiber, sleep, yield_now};
pub use job::{IoJobDescriptor, JobDescriptor, JobEntry, JobParam, Priority};
pub use scheduler::{FiberCounts, Scheduler, SchedulerConfig, ShutdownError};
pub use sync::{
    FiberCondvar, FiberMutex, FiberSharedMutex, FiberSpinLock, FiberUniqueLock, SimpleLock,
};
pub use worker::{WorkerId, WorkerKind, is_fiber_worker, is_io_worker};
pub use worker_context::with_frame_allocator;
