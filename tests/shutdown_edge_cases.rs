use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fiberkick::{
    JobDescriptor, JobParam, Priority, Scheduler, SchedulerConfig, StackSizeClass,
};

fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        fiber_workers: Some(2),
        io_workers: Some(1),
        main_thread_is_worker: false,
        ..Default::default()
    }
}

#[test]
fn shutdown_with_no_jobs() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut scheduler = Scheduler::initialize(test_config());
    scheduler.run();
    scheduler.request_shutdown();
    scheduler.shutdown().expect("idle shutdown failed");
}

fn napping_job(param: JobParam) {
    let completed = unsafe { &*param.as_ptr::<AtomicUsize>() };
    fiberkick::sleep(Duration::from_millis(10));
    completed.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn shutdown_after_awaited_jobs() {
    let mut scheduler = Scheduler::initialize(test_config());
    scheduler.run();

    let completed = AtomicUsize::new(0);
    let param = JobParam::from_ptr(&completed as *const AtomicUsize as *mut AtomicUsize);
    let counter = scheduler.generate_counter();
    for _ in 0..10 {
        scheduler.kick(
            JobDescriptor::new(Priority::Normal, napping_job, param, StackSizeClass::Normal)
                .with_counter(counter),
        );
    }
    scheduler.wait(counter);
    assert_eq!(completed.load(Ordering::SeqCst), 10);

    scheduler.destroy_counter(counter);
    scheduler.request_shutdown();
    scheduler.shutdown().expect("shutdown failed after jobs completed");
}

#[test]
fn drop_without_explicit_shutdown_joins_workers() {
    let mut scheduler = Scheduler::initialize(test_config());
    scheduler.run();
    // Dropping must request shutdown and join; the test passes by not
    // hanging and not leaking running threads into later tests.
    drop(scheduler);
}

#[test]
#[should_panic(expected = "run called twice")]
fn double_run_asserts() {
    let mut scheduler = Scheduler::initialize(test_config());
    scheduler.run();
    scheduler.run();
}

fn panicking_job(_: JobParam) {
    panic!("job panic must stay inside the fiber");
}

#[test]
fn job_panic_does_not_kill_the_worker() {
    let mut scheduler = Scheduler::initialize(test_config());
    scheduler.run();

    let counter = scheduler.generate_counter();
    scheduler.kick_and_wait(
        JobDescriptor::new(
            Priority::Normal,
            panicking_job,
            JobParam::null(),
            StackSizeClass::Normal,
        )
        .with_counter(counter),
    );
    // The counter still decremented and the worker survived to run more work.
    assert!(scheduler.counter_is_zero(counter));

    let executed = AtomicUsize::new(0);
    fn bump(param: JobParam) {
        unsafe { &*param.as_ptr::<AtomicUsize>() }.fetch_add(1, Ordering::SeqCst);
    }
    scheduler.kick_and_wait(
        JobDescriptor::new(
            Priority::Normal,
            bump,
            JobParam::from_ptr(&executed as *const AtomicUsize as *mut AtomicUsize),
            StackSizeClass::Normal,
        )
        .with_counter(counter),
    );
    assert_eq!(executed.load(Ordering::SeqCst), 1);

    scheduler.destroy_counter(counter);
    scheduler.request_shutdown();
    scheduler.shutdown().expect("shutdown failed");
}
