//! Host-side cost of graph construction and of every execution strategy on
//! the native runtime.
//!
//! Run with:
//! ```bash
//! cargo bench --bench strategies
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::time::Duration;

use graphbench::prelude::*;

const SHAPES: [(usize, usize); 3] = [(1, 4), (4, 4), (8, 16)];

fn graph_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_build");
    let kernel = Kernel::newton(BufferId(0), 2 << 16);
    for (slots, per_slot) in SHAPES {
        let params = Params::new(10, slots, per_slot, 1, 2 << 16, 128).unwrap();
        group.throughput(Throughput::Elements(
            (params.epochs() * params.tasks_per_epoch()) as u64,
        ));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{slots}x{per_slot}")),
            &params,
            |b, params| b.iter(|| TaskGraph::build(params, &kernel)),
        );
    }
    group.finish();
}

fn strategies(c: &mut Criterion) {
    let rt = NativeRuntime::new();
    let len = 2 << 14;
    let buf = rt.alloc(len).unwrap();
    rt.write(buf, &vec![2.0; len]).unwrap();
    let kernel = Kernel::update(buf, len, 0.999, 0.001);

    for strategy in Strategy::all() {
        let mut group = c.benchmark_group(format!("native/{strategy:?}"));
        for (slots, per_slot) in SHAPES {
            let params = Params::new(10, slots, per_slot, 1, len, 128).unwrap();
            let bench = Benchmark::new(&rt, params, kernel.clone());
            group.bench_function(format!("{slots}x{per_slot}"), |b| {
                // Each run records its own window, which excludes plan setup.
                b.iter_custom(|iters| {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        total += bench.run(strategy).unwrap().total();
                    }
                    total
                })
            });
        }
        group.finish();
    }
    rt.free(buf).unwrap();
}

criterion_group!(benches, graph_build, strategies);
criterion_main!(benches);
