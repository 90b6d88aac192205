use std::sync::atomic::{AtomicUsize, Ordering};

use fiberkick::{
    IoJobDescriptor, JobDescriptor, JobParam, Priority, Scheduler, SchedulerConfig, StackSizeClass,
};

fn test_scheduler() -> Scheduler {
    let mut scheduler = Scheduler::initialize(SchedulerConfig {
        fiber_workers: Some(2),
        io_workers: Some(2),
        main_thread_is_worker: false,
        ..Default::default()
    });
    scheduler.run();
    scheduler
}

fn io_probe(param: JobParam) {
    let counter = unsafe { &*param.as_ptr::<AtomicUsize>() };
    assert!(fiberkick::is_io_worker(), "I/O job ran off the I/O workers");
    assert!(!fiberkick::is_fiber(), "I/O job must not run on a fiber");
    // Blocking here is legal: this thread carries no fibers.
    std::thread::sleep(std::time::Duration::from_millis(1));
    counter.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn io_jobs_run_directly_on_io_threads() {
    let scheduler = test_scheduler();
    let executed = AtomicUsize::new(0);
    let param = JobParam::from_ptr(&executed as *const AtomicUsize as *mut AtomicUsize);

    let counter = scheduler.generate_counter();
    scheduler.kick_io_and_wait(IoJobDescriptor::new(io_probe, param).with_counter(counter));
    assert_eq!(executed.load(Ordering::SeqCst), 1);

    for _ in 0..3 {
        scheduler.kick_io(IoJobDescriptor::new(io_probe, param).with_counter(counter));
    }
    scheduler.wait(counter);
    assert_eq!(executed.load(Ordering::SeqCst), 4);

    scheduler.destroy_counter(counter);
    scheduler.request_shutdown();
    scheduler.shutdown().expect("shutdown failed");
}

fn main_probe(param: JobParam) {
    let counter = unsafe { &*param.as_ptr::<AtomicUsize>() };
    assert!(!fiberkick::is_fiber());
    counter.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn main_thread_jobs_drain_on_the_calling_thread() {
    let scheduler = test_scheduler();
    let executed = AtomicUsize::new(0);
    let param = JobParam::from_ptr(&executed as *const AtomicUsize as *mut AtomicUsize);

    let counter = scheduler.generate_counter();
    for _ in 0..3 {
        scheduler.kick_on_main(IoJobDescriptor::new(main_probe, param).with_counter(counter));
    }
    // Nothing ran yet: the queue waits for the designated thread.
    assert_eq!(executed.load(Ordering::SeqCst), 0);

    let drained = scheduler.run_main_thread_jobs();
    assert_eq!(drained, 3);
    assert_eq!(executed.load(Ordering::SeqCst), 3);
    assert!(scheduler.counter_is_zero(counter));

    scheduler.destroy_counter(counter);
    scheduler.request_shutdown();
    scheduler.shutdown().expect("shutdown failed");
}

fn fiber_probe(param: JobParam) {
    let counter = unsafe { &*param.as_ptr::<AtomicUsize>() };
    assert!(fiberkick::is_fiber_worker());
    assert!(fiberkick::is_fiber());
    counter.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn fiber_and_io_jobs_mix() {
    let scheduler = test_scheduler();
    let executed = AtomicUsize::new(0);
    let param = JobParam::from_ptr(&executed as *const AtomicUsize as *mut AtomicUsize);

    let counter = scheduler.generate_counter();
    for _ in 0..8 {
        scheduler.kick(
            JobDescriptor::new(Priority::Normal, fiber_probe, param, StackSizeClass::Normal)
                .with_counter(counter),
        );
        scheduler.kick_io(IoJobDescriptor::new(io_probe, param).with_counter(counter));
    }
    scheduler.wait(counter);
    assert_eq!(executed.load(Ordering::SeqCst), 16);

    scheduler.destroy_counter(counter);
    scheduler.request_shutdown();
    scheduler.shutdown().expect("shutdown failed");
}
