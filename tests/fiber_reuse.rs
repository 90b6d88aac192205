use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fiberkick::{
    FiberCounts, JobDescriptor, JobParam, Priority, Scheduler, SchedulerConfig, StackSizeClass,
};

fn single_fiber_scheduler() -> Scheduler {
    let mut scheduler = Scheduler::initialize(SchedulerConfig {
        fiber_workers: Some(1),
        io_workers: Some(1),
        main_thread_is_worker: false,
        fiber_counts: FiberCounts {
            micro: 1,
            tiny: 1,
            small: 1,
            normal: 1,
            elevated: 1,
            large: 1,
            huge: 1,
            gigantic: 1,
            external: 1,
            external_huge: 1,
        },
        ..Default::default()
    });
    scheduler.run();
    scheduler
}

fn write_value(param: JobParam) {
    let slot = unsafe { &*param.as_ptr::<(AtomicUsize, usize)>() };
    slot.0.store(slot.1, Ordering::SeqCst);
}

/// With a single Normal fiber in the pool, consecutive jobs must reuse it
/// without state bleeding between jobs: each run sees only its own parameter.
#[test]
fn one_fiber_services_many_jobs_cleanly() {
    let scheduler = single_fiber_scheduler();

    for round in 1..=10 {
        let slot = (AtomicUsize::new(0), round);
        let counter = scheduler.generate_counter();
        scheduler.kick_and_wait(
            JobDescriptor::new(
                Priority::Normal,
                write_value,
                JobParam::from_ptr(&slot as *const (AtomicUsize, usize) as *mut (AtomicUsize, usize)),
                StackSizeClass::Normal,
            )
            .with_counter(counter),
        );
        assert_eq!(slot.0.load(Ordering::SeqCst), round);
        scheduler.destroy_counter(counter);
    }

    // The fiber drains back into the pool once the worker recycles it.
    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.available_fibers(StackSizeClass::Normal) != 1 {
        assert!(Instant::now() < deadline, "fiber never returned to its pool");
        std::thread::yield_now();
    }

    scheduler.request_shutdown();
    scheduler.shutdown().expect("shutdown failed");
}

fn bump(param: JobParam) {
    let counter = unsafe { &*param.as_ptr::<AtomicUsize>() };
    counter.fetch_add(1, Ordering::SeqCst);
}

/// More queued jobs than pooled fibers: exhaustion is transient back-pressure
/// and every job still runs.
#[test]
fn pool_exhaustion_backpressures_instead_of_failing() {
    let scheduler = single_fiber_scheduler();
    let executed = AtomicUsize::new(0);
    let param = JobParam::from_ptr(&executed as *const AtomicUsize as *mut AtomicUsize);

    let counter = scheduler.generate_counter();
    for _ in 0..50 {
        scheduler.kick(
            JobDescriptor::new(Priority::Normal, bump, param, StackSizeClass::Normal)
                .with_counter(counter),
        );
    }
    scheduler.wait(counter);
    assert_eq!(executed.load(Ordering::SeqCst), 50);

    scheduler.destroy_counter(counter);
    scheduler.request_shutdown();
    scheduler.shutdown().expect("shutdown failed");
}

/// One job per stack-size class, all sharing a counter.
#[test]
fn every_stack_class_executes() {
    let mut scheduler = Scheduler::initialize(SchedulerConfig {
        fiber_workers: Some(2),
        io_workers: Some(1),
        main_thread_is_worker: false,
        ..Default::default()
    });
    scheduler.run();

    let slots: Vec<AtomicUsize> = (0..StackSizeClass::COUNT).map(|_| AtomicUsize::new(0)).collect();
    let counter = scheduler.generate_counter();
    for class in StackSizeClass::ALL {
        scheduler.kick(
            JobDescriptor::new(
                Priority::Normal,
                bump,
                JobParam::from_ptr(&slots[class.index()] as *const AtomicUsize as *mut AtomicUsize),
                class,
            )
            .with_counter(counter),
        );
    }
    scheduler.wait(counter);

    for slot in &slots {
        assert_eq!(slot.load(Ordering::SeqCst), 1);
    }
    scheduler.destroy_counter(counter);
    scheduler.request_shutdown();
    scheduler.shutdown().expect("shutdown failed");
}
