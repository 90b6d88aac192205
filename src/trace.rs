//! Chrome-tracing collector for job visualization.
//!
//! Zero-contention tracer: each worker records spans into a thread-local
//! buffer, flushed into a global list at worker detach. The export is a JSON
//! file loadable in chrome://tracing or ui.perfetto.dev.

use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
struct TraceSpan {
    name: &'static str,
    worker: u64,
    start_us: u64,
    duration_us: u64,
}

thread_local! {
    static SPAN_BUFFER: RefCell<Vec<TraceSpan>> = RefCell::new(Vec::with_capacity(4096));
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref EPOCH_START_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceSpan>>> = Mutex::new(Vec::new());
}

fn record_span(name: &'static str, worker: u64, start: Instant, duration: std::time::Duration) {
    let start_us = (start.duration_since(*GLOBAL_START).as_micros() as u64) + *EPOCH_START_US;
    SPAN_BUFFER.with(|buffer| {
        buffer.borrow_mut().push(TraceSpan {
            name,
            worker,
            start_us,
            duration_us: duration.as_micros() as u64,
        });
    });
}

/// Flushes the calling thread's buffer into the global list. Each worker
/// calls this once at detach.
pub fn collect_local_spans() {
    SPAN_BUFFER.with(|buffer| {
        let mut local = buffer.borrow_mut();
        if !local.is_empty() {
            ALL_BUFFERS.lock().unwrap().push(std::mem::take(&mut *local));
        }
    });
}

/// Writes every collected span as Chrome "Complete" events.
pub fn export_to_file(path: &str) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let buffers = ALL_BUFFERS.lock().unwrap();
    writeln!(writer, "[")?;
    let mut first = true;
    for buffer in buffers.iter() {
        for span in buffer {
            if !first {
                writeln!(writer, ",")?;
            }
            first = false;
            write!(
                writer,
                "{{\"name\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}}}",
                span.name, span.start_us, span.duration_us, span.worker
            )?;
        }
    }
    writeln!(writer, "\n]")?;
    writer.flush()
}

/// RAII span: records from construction to drop.
pub struct TraceGuard {
    name: &'static str,
    worker: u64,
    start: Instant,
}

impl TraceGuard {
    pub fn new(name: &'static str, worker: u64) -> TraceGuard {
        TraceGuard {
            name,
            worker,
            start: Instant::now(),
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        record_span(self.name, self.worker, self.start, self.start.elapsed());
    }
}

/// Flushes the local buffer on drop; workers hold one for their lifetime so
/// spans survive early exits.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        collect_local_spans();
    }
}
