//! Benchmark runner: execution strategies over a built task graph.

use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    dispatch::StreamDispatcher,
    graph::TaskGraph,
    kernel::{Kernel, KernelOp},
    metrics::Timings,
    params::{Params, ParamsError},
    runtime::{Runtime, RuntimeError, UpdateMode, UpdateOutcome},
};

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error("rebuilt graph {got:#018x} no longer matches live plan {expected:#018x}")]
    TopologyChanged { expected: u64, got: u64 },
    #[error("failed to start dispatch workers: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// How a run issues its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Strategy {
    /// Direct per-call launches into one queue per stream, no graph.
    Streams,
    /// Instantiate the full graph once and replay it.
    Graph,
    /// Replay, rebuilding and re-applying the graph before every launch.
    GraphUpdate,
    /// Replay a single-epoch graph `epochs` times back to back.
    Split,
    /// Split replay with a rebuild and update before every launch.
    SplitUpdate,
}

impl Strategy {
    pub fn all() -> [Strategy; 5] {
        [
            Self::Streams,
            Self::Graph,
            Self::GraphUpdate,
            Self::Split,
            Self::SplitUpdate,
        ]
    }

    pub fn uses_graph(&self) -> bool {
        !matches!(self, Self::Streams)
    }
}

/// An instantiated graph bound to the queue it is launched on.
///
/// Dropping it destroys the plan and then the queue.
pub struct ExecutionPlan<'rt, R: Runtime> {
    runtime: &'rt R,
    plan: R::Plan,
    queue: R::Queue,
    fingerprint: u64,
    mode: UpdateMode,
}

impl<'rt, R: Runtime> ExecutionPlan<'rt, R> {
    pub fn new(runtime: &'rt R, graph: &TaskGraph, mode: UpdateMode) -> Result<Self, BenchError> {
        let queue = runtime.create_queue()?;
        let plan = runtime.instantiate(graph)?;
        Ok(Self {
            runtime,
            plan,
            queue,
            fingerprint: graph.topology().fingerprint(),
            mode,
        })
    }

    pub fn launch(&self) -> Result<(), BenchError> {
        Ok(self.runtime.launch_plan(&self.plan, &self.queue)?)
    }

    pub fn synchronize(&self) -> Result<(), BenchError> {
        Ok(self.runtime.synchronize_queue(&self.queue)?)
    }

    /// Apply a rebuilt graph. A diff update against a different topology is
    /// an error and leaves the plan as it was.
    pub fn update(&mut self, graph: &TaskGraph) -> Result<UpdateOutcome, BenchError> {
        match self.runtime.update(&mut self.plan, graph, self.mode)? {
            UpdateOutcome::TopologyChanged => Err(BenchError::TopologyChanged {
                expected: self.fingerprint,
                got: graph.topology().fingerprint(),
            }),
            outcome => {
                self.fingerprint = graph.topology().fingerprint();
                Ok(outcome)
            }
        }
    }

    pub fn plan(&self) -> &R::Plan {
        &self.plan
    }
}

/// One benchmark configuration against one runtime.
pub struct Benchmark<'rt, R: Runtime> {
    runtime: &'rt R,
    params: Params,
    kernel: Kernel,
    mode: UpdateMode,
    multithreaded: bool,
}

impl<'rt, R: Runtime> Benchmark<'rt, R> {
    pub fn new(runtime: &'rt R, params: Params, kernel: Kernel) -> Self {
        Self {
            runtime,
            params,
            kernel,
            mode: UpdateMode::default(),
            multithreaded: false,
        }
    }

    pub fn update_mode(mut self, mode: UpdateMode) -> Self {
        self.mode = mode;
        self
    }

    /// Fan stream submissions out over a worker pool instead of issuing
    /// them from the calling thread. Only affects [`Strategy::Streams`].
    pub fn multithreaded(mut self, multithreaded: bool) -> Self {
        self.multithreaded = multithreaded;
        self
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Number of times each buffer element is processed by one `run`.
    pub fn applications(&self) -> usize {
        self.params.epochs() * self.params.repetitions()
    }

    #[tracing::instrument(skip(self), fields(backend = self.runtime.name()))]
    pub fn run(&self, strategy: Strategy) -> Result<Timings, BenchError> {
        let timings = match strategy {
            Strategy::Streams => {
                StreamDispatcher::new(self.runtime, &self.params, &self.kernel, self.multithreaded)?
                    .run()?
            }
            Strategy::Graph => self.replay(false)?,
            Strategy::GraphUpdate => self.replay(true)?,
            Strategy::Split => self.split(false)?,
            Strategy::SplitUpdate => self.split(true)?,
        };
        info!(
            ?strategy,
            repetitions = timings.len(),
            mean_us = timings.mean_us(),
            "benchmark finished"
        );
        Ok(timings)
    }

    fn replay(&self, rebuild: bool) -> Result<Timings, BenchError> {
        let graph = TaskGraph::build(&self.params, &self.kernel);
        let mut plan = ExecutionPlan::new(self.runtime, &graph, self.mode)?;
        let mut timings = Timings::with_capacity(self.params.repetitions());
        for rep in 0..self.params.repetitions() {
            plan.synchronize()?;
            let start = Instant::now();
            if rebuild {
                let fresh = TaskGraph::build(&self.params, &self.kernel);
                plan.update(&fresh)?;
            }
            plan.launch()?;
            plan.synchronize()?;
            record(&mut timings, rep, start);
        }
        Ok(timings)
    }

    fn split(&self, rebuild: bool) -> Result<Timings, BenchError> {
        let single = self.params.single_epoch();
        let graph = TaskGraph::build(&single, &self.kernel);
        let mut plan = ExecutionPlan::new(self.runtime, &graph, self.mode)?;
        let mut timings = Timings::with_capacity(self.params.repetitions());
        for rep in 0..self.params.repetitions() {
            plan.synchronize()?;
            let start = Instant::now();
            for _ in 0..self.params.epochs() {
                if rebuild {
                    let fresh = TaskGraph::build(&single, &self.kernel);
                    plan.update(&fresh)?;
                }
                plan.launch()?;
            }
            plan.synchronize()?;
            record(&mut timings, rep, start);
        }
        Ok(timings)
    }
}

fn record(timings: &mut Timings, rep: usize, start: Instant) {
    let elapsed: Duration = start.elapsed();
    debug!(rep, elapsed_us = elapsed.as_secs_f64() * 1e6, "repetition");
    timings.record(elapsed);
}

/// Everything needed to run and check one benchmark from scratch.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub params: Params,
    pub strategy: Strategy,
    pub op: KernelOp,
    pub update_mode: UpdateMode,
    pub multithreaded: bool,
    /// Value every buffer element starts at.
    pub initial: f64,
}

impl RunConfig {
    pub fn new(params: Params, strategy: Strategy) -> Self {
        Self {
            params,
            strategy,
            op: KernelOp::Newton,
            update_mode: UpdateMode::Diff,
            multithreaded: false,
            initial: 2.0,
        }
    }
}

/// Coefficients of the update kernel used by [`execute`].
pub const UPDATE_ALPHA: f64 = 0.999;
pub const UPDATE_BETA: f64 = 0.001;

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub timings: Timings,
    pub kernel: Kernel,
    pub applications: usize,
    pub input: Vec<f64>,
    pub output: Vec<f64>,
}

/// Allocate and fill the buffer, run the configured strategy and read the
/// result back.
pub fn execute<R: Runtime>(runtime: &R, config: &RunConfig) -> Result<RunOutcome, BenchError> {
    let len = config.params.total_elements();
    let buffer = runtime.alloc(len)?;
    let input = vec![config.initial; len];
    runtime.write(buffer, &input)?;
    runtime.synchronize()?;

    let kernel = match config.op {
        KernelOp::Newton => Kernel::newton(buffer, len),
        KernelOp::Update => Kernel::update(buffer, len, UPDATE_ALPHA, UPDATE_BETA),
    };
    let bench = Benchmark::new(runtime, config.params, kernel)
        .update_mode(config.update_mode)
        .multithreaded(config.multithreaded);
    let timings = bench.run(config.strategy)?;

    runtime.synchronize()?;
    let output = runtime.read(buffer)?;
    runtime.free(buffer)?;
    Ok(RunOutcome {
        timings,
        applications: bench.applications(),
        kernel: bench.kernel().clone(),
        input,
        output,
    })
}
