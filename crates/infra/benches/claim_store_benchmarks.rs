use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use reckon_core::AccountId;
use reckon_infra::tasks::{
    ClaimStore, InMemoryClaimStore, JobRunnerConfig, ParallelJobRunner, TaskHandlerRegistry,
    TaskOutcome, TaskRecord, TaskType,
};

fn seeded_store(tasks: usize) -> InMemoryClaimStore {
    let store = InMemoryClaimStore::new();
    let account = AccountId::new();
    for _ in 0..tasks {
        store
            .save(TaskRecord::new(account, TaskType::GenerateInvoice).with_data("period", "2020-01-01"))
            .unwrap();
    }
    store
}

fn bench_claim_complete_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_complete_latency");

    group.bench_function("save_claim_complete", |b| {
        let store = InMemoryClaimStore::new();
        let account = AccountId::new();
        b.iter(|| {
            store
                .save(TaskRecord::new(account, TaskType::DeliverInvoice))
                .unwrap();
            let claimed = store.claim().unwrap().unwrap();
            black_box(claimed.id());
            claimed.complete().unwrap();
        });
    });

    group.bench_function("claim_release_with_backlog", |b| {
        let store = seeded_store(1000);
        b.iter(|| {
            let claimed = store.claim().unwrap().unwrap();
            black_box(claimed.id());
            claimed.release().unwrap();
        });
    });

    group.finish();
}

fn bench_runner_drain_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("runner_drain_throughput");
    group.sample_size(20);

    for parallelism in [1usize, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(
            BenchmarkId::from_parameter(parallelism),
            parallelism,
            |b, &parallelism| {
                b.iter(|| {
                    let store = seeded_store(1000);
                    let mut registry = TaskHandlerRegistry::new();
                    registry.register(TaskType::GenerateInvoice, |_| TaskOutcome::Success);
                    let runner = ParallelJobRunner::new(
                        store,
                        registry,
                        JobRunnerConfig::default()
                            .with_parallelism(parallelism)
                            .with_max_iterations(None)
                            .with_max_duration(None),
                    );
                    black_box(runner.execute());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_complete_latency,
    bench_runner_drain_throughput
);
criterion_main!(benches);
