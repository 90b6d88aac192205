use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::Rng;

use fiberkick::{
    JobDescriptor, JobParam, Priority, Scheduler, SchedulerConfig, StackSizeClass,
};

fn bump(param: JobParam) {
    unsafe { &*param.as_ptr::<AtomicUsize>() }.fetch_add(1, Ordering::Relaxed);
}

/// Batches of trivial jobs across all priority tiers, sized against the
/// machine's core count.
fn batch_throughput(c: &mut Criterion) {
    let workers = (num_cpus::get() - 1).max(1);
    let mut scheduler = Scheduler::initialize(SchedulerConfig {
        fiber_workers: Some(workers),
        io_workers: Some(1),
        main_thread_is_worker: false,
        queue_capacity: 8192,
        ..Default::default()
    });
    scheduler.run();

    let executed = AtomicUsize::new(0);
    let param = JobParam::from_ptr(&executed as *const AtomicUsize as *mut AtomicUsize);
    let mut rng = rand::rng();

    let mut group = c.benchmark_group("throughput");
    for batch in [100usize, 1000, 4000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let counter = scheduler.generate_counter();
                for _ in 0..batch {
                    let priority = match rng.random_range(0..3) {
                        0 => Priority::Low,
                        1 => Priority::Normal,
                        _ => Priority::High,
                    };
                    scheduler.kick(
                        JobDescriptor::new(priority, bump, param, StackSizeClass::Micro)
                            .with_counter(counter),
                    );
                }
                scheduler.wait(counter);
                scheduler.destroy_counter(counter);
            });
        });
    }
    group.finish();

    scheduler.request_shutdown();
    scheduler.shutdown().unwrap();
}

criterion_group!(benches, batch_throughput);
criterion_main!(benches);
