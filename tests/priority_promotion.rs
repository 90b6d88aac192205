use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fiberkick::{
    JobDescriptor, JobParam, Priority, Scheduler, SchedulerConfig, StackSizeClass,
};

struct PromoState {
    low_ran: AtomicBool,
    high_in_flight: AtomicUsize,
}

fn low_marker(param: JobParam) {
    let state = unsafe { &*param.as_ptr::<PromoState>() };
    state.low_ran.store(true, Ordering::SeqCst);
}

fn busy_high(param: JobParam) {
    let state = unsafe { &*param.as_ptr::<PromoState>() };
    let end = Instant::now() + Duration::from_millis(1);
    while Instant::now() < end {
        std::hint::spin_loop();
    }
    state.high_in_flight.fetch_sub(1, Ordering::SeqCst);
}

/// A low-priority job must run within a bounded number of promotion
/// intervals even under sustained high-priority load: after two sweeps it
/// sits in the High tier itself.
#[test]
fn low_priority_job_is_not_starved() {
    let mut scheduler = Scheduler::initialize(SchedulerConfig {
        fiber_workers: Some(1),
        io_workers: Some(1),
        main_thread_is_worker: false,
        promotion_interval_ms: 5,
        ..Default::default()
    });
    scheduler.run();

    let state = PromoState {
        low_ran: AtomicBool::new(false),
        high_in_flight: AtomicUsize::new(0),
    };
    let param = JobParam::from_ptr(&state as *const PromoState as *mut PromoState);

    let low_counter = scheduler.generate_counter();
    scheduler.kick(
        JobDescriptor::new(Priority::Low, low_marker, param, StackSizeClass::Normal)
            .with_counter(low_counter),
    );

    // Keep the high tier saturated while the low job waits for promotion.
    let high_counter = scheduler.generate_counter();
    let feed_deadline = Instant::now() + Duration::from_secs(10);
    while !state.low_ran.load(Ordering::SeqCst) {
        assert!(
            Instant::now() < feed_deadline,
            "low-priority job starved past the deadline"
        );
        if state.high_in_flight.load(Ordering::SeqCst) < 4 {
            state.high_in_flight.fetch_add(1, Ordering::SeqCst);
            scheduler.kick(
                JobDescriptor::new(Priority::High, busy_high, param, StackSizeClass::Normal)
                    .with_counter(high_counter),
            );
        } else {
            std::thread::yield_now();
        }
    }

    scheduler.wait(high_counter);
    scheduler.wait(low_counter);
    assert!(state.low_ran.load(Ordering::SeqCst));

    scheduler.destroy_counter(low_counter);
    scheduler.destroy_counter(high_counter);
    scheduler.request_shutdown();
    scheduler.shutdown().expect("shutdown failed");
}
