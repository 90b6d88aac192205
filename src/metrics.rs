#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Optional scheduler counters, compiled in with the `metrics` feature.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Fiber jobs run to completion.
    pub jobs_executed: AtomicU64,
    /// Blocking jobs executed on I/O workers.
    pub io_jobs_executed: AtomicU64,
    /// Jobs executed on the designated main thread.
    pub main_thread_jobs_executed: AtomicU64,
    /// Priority-promotion sweeps.
    pub promotions: AtomicU64,
    /// Fibers taken from a pool.
    pub fibers_acquired: AtomicU64,
    /// Spin iterations spent waiting for a fiber of the right class.
    pub fiber_exhaustion_spins: AtomicU64,
    /// Suspended fibers resumed from the local sleep queue.
    pub resumes_local: AtomicU64,
    /// Suspended fibers resumed via the global resume queue.
    pub resumes_global: AtomicU64,
    /// Counters taken from the pool.
    pub counters_acquired: AtomicU64,
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_executed: AtomicU64::new(0),
            io_jobs_executed: AtomicU64::new(0),
            main_thread_jobs_executed: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            fibers_acquired: AtomicU64::new(0),
            fiber_exhaustion_spins: AtomicU64::new(0),
            resumes_local: AtomicU64::new(0),
            resumes_global: AtomicU64::new(0),
            counters_acquired: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            io_jobs_executed: self.io_jobs_executed.load(Ordering::Relaxed),
            main_thread_jobs_executed: self.main_thread_jobs_executed.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            fibers_acquired: self.fibers_acquired.load(Ordering::Relaxed),
            fiber_exhaustion_spins: self.fiber_exhaustion_spins.load(Ordering::Relaxed),
            resumes_local: self.resumes_local.load(Ordering::Relaxed),
            resumes_global: self.resumes_global.load(Ordering::Relaxed),
            counters_acquired: self.counters_acquired.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`Metrics`].
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_executed: u64,
    pub io_jobs_executed: u64,
    pub main_thread_jobs_executed: u64,
    pub promotions: u64,
    pub fibers_acquired: u64,
    pub fiber_exhaustion_spins: u64,
    pub resumes_local: u64,
    pub resumes_global: u64,
    pub counters_acquired: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    pub fn jobs_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            (self.jobs_executed + self.io_jobs_executed) as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Share of fiber acquisitions that had to spin on an empty pool.
    pub fn exhaustion_ratio(&self) -> f64 {
        if self.fibers_acquired > 0 {
            self.fiber_exhaustion_spins as f64 / self.fibers_acquired as f64
        } else {
            0.0
        }
    }
}
