use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mind_local::{
    Computation, ExecutableBuildOptions, Literal, LocalClient, PrimitiveType, RuntimeConfig, Shape,
};

fn vector(n: usize) -> Shape {
    Shape::array(PrimitiveType::F32, vec![n])
}

/// `cross_replica_sum(x * x)`
fn allreduce_squares(n: usize) -> Computation {
    let mut c = Computation::new("allreduce_squares");
    let x = c.parameter(0, vector(n));
    let sq = c.mul(x, x);
    let s = c.cross_replica_sum(sq);
    c.output(s);
    c
}

fn bench_execute_replicated(c: &mut Criterion) {
    let mut group = c.benchmark_group("execute_replicated");
    for replicas in [1usize, 2, 4] {
        let config = RuntimeConfig::default().with_platform("cpu", replicas);
        let client = LocalClient::open_with_config("cpu", config).expect("open cpu");
        let n = 4096;
        let exe = client
            .compile(
                &allreduce_squares(n),
                &[vector(n)],
                &ExecutableBuildOptions::default().with_num_replicas(replicas),
            )
            .expect("compile");
        let items: Vec<(Literal, usize)> = (0..replicas)
            .map(|r| (Literal::vector(&vec![r as f32; n]), r))
            .collect();
        let args = client.transfer_to_device_batch(&items).expect("transfer");
        let lists: Vec<Vec<_>> = args.iter().map(|a| vec![a]).collect();

        group.bench_with_input(BenchmarkId::new("allreduce_4096", replicas), &lists, |b, lists| {
            b.iter(|| black_box(exe.execute_replicated(lists).expect("execute")))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_execute_replicated);
criterion_main!(benches);
