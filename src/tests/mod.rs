use crate::prelude::*;
use proptest::prelude::*;
use rand::{Rng, SeedableRng, rngs::StdRng};
use crate::prelude::Strategy;

/// Run `strategy` over `input` on a fresh native runtime and return the
/// buffer contents afterwards.
fn run_native(
    params: Params,
    op: KernelOp,
    strategy: Strategy,
    mode: UpdateMode,
    multithreaded: bool,
    input: &[f64],
) -> Vec<f64> {
    let rt = NativeRuntime::new();
    let buf = rt.alloc(input.len()).unwrap();
    rt.write(buf, input).unwrap();
    let kernel = match op {
        KernelOp::Newton => Kernel::newton(buf, input.len()),
        KernelOp::Update => Kernel::update(buf, input.len(), 0.75, 0.125),
    };
    let timings = Benchmark::new(&rt, params, kernel)
        .update_mode(mode)
        .multithreaded(multithreaded)
        .run(strategy)
        .unwrap();
    assert_eq!(timings.len(), params.repetitions());
    rt.synchronize().unwrap();
    rt.read(buf).unwrap()
}

fn random_input(seed: u64, len: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-3.0..3.0)).collect()
}

#[test]
fn strategies_agree_bit_for_bit() {
    let params = Params::new(3, 4, 3, 2, 1000, 64).unwrap();
    let input = random_input(7, params.total_elements());
    for op in KernelOp::all() {
        let baseline = run_native(params, op, Strategy::Streams, UpdateMode::Diff, false, &input);
        for strategy in Strategy::all() {
            for mode in [UpdateMode::Diff, UpdateMode::Replace] {
                for threaded in [false, true] {
                    let out = run_native(params, op, strategy, mode, threaded, &input);
                    assert_eq!(out, baseline, "{op:?} {strategy:?} {mode:?} threaded={threaded}");
                }
            }
        }
    }
}

#[test]
fn newton_end_to_end_validates() {
    let rt = NativeRuntime::new();
    let params = Params::new(10, 2, 4, 1, 2 << 10, 128).unwrap();
    for strategy in Strategy::all() {
        let outcome = execute(&rt, &RunConfig::new(params, strategy)).unwrap();
        assert_eq!(
            validate(
                &outcome.kernel,
                &outcome.input,
                outcome.applications,
                &outcome.output
            ),
            Ok(()),
            "{strategy:?}"
        );
        assert!((outcome.output[0] - -0.8049501319758164).abs() < 1e-12);
    }
}

#[test]
fn update_kernel_end_to_end_validates() {
    let rt = NativeRuntime::new();
    let params = Params::new(5, 3, 2, 3, 500, 32).unwrap();
    for strategy in Strategy::all() {
        let mut config = RunConfig::new(params, strategy);
        config.op = KernelOp::Update;
        config.multithreaded = true;
        let outcome = execute(&rt, &config).unwrap();
        assert_eq!(outcome.applications, 15);
        assert_eq!(
            validate(
                &outcome.kernel,
                &outcome.input,
                outcome.applications,
                &outcome.output
            ),
            Ok(()),
            "{strategy:?}"
        );
    }
}

#[test]
fn zero_epochs_leave_buffer_untouched() {
    let params = Params::new(0, 2, 2, 1, 64, 16).unwrap();
    let input = random_input(1, 64);
    for strategy in Strategy::all() {
        let out = run_native(params, KernelOp::Update, strategy, UpdateMode::Diff, false, &input);
        assert_eq!(out, input, "{strategy:?}");
    }
}

#[test]
fn more_tasks_than_elements() {
    // Most tasks get an empty window, the last one covers everything.
    let params = Params::new(2, 4, 4, 1, 5, 32).unwrap();
    let input = random_input(3, 5);
    let expected = Kernel::update(BufferId(0), 5, 0.75, 0.125).reference(&input, 2);
    for strategy in Strategy::all() {
        let out = run_native(params, KernelOp::Update, strategy, UpdateMode::Diff, true, &input);
        assert_eq!(out, expected, "{strategy:?}");
    }
}

#[test]
fn rebuild_preserves_shape() {
    let params = Params::new(4, 3, 2, 1, 600, 64).unwrap();
    let kernel = Kernel::newton(BufferId(0), 600);
    let a = TaskGraph::build(&params, &kernel);
    let b = TaskGraph::build(&params, &kernel);
    assert_eq!(a.node_count(), b.node_count());
    assert_eq!(a.edge_count(), TaskGraph::expected_edge_count(&params));
    assert_eq!(a.topology(), b.topology());
    assert_eq!(a.topology().fingerprint(), b.topology().fingerprint());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]
    #[test]
    fn graph_matches_reference(
        epochs in 0usize..4,
        slots in 1usize..5,
        per_slot in 1usize..4,
        len in 1usize..300,
        seed in any::<u64>(),
    ) {
        let params = Params::new(epochs, slots, per_slot, 1, len, 32).unwrap();
        let input = random_input(seed, len);
        let kernel = Kernel::update(BufferId(0), len, 0.75, 0.125);
        let expected = kernel.reference(&input, epochs);
        for strategy in [Strategy::Graph, Strategy::SplitUpdate] {
            let out = run_native(params, KernelOp::Update, strategy, UpdateMode::Diff, false, &input);
            prop_assert_eq!(&out, &expected);
        }
    }
}
