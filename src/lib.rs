//! Launch-overhead benchmarks for layered task graphs.
//!
//! A [`TaskGraph`](graph::TaskGraph) of `epochs` fan-out/fan-in stages is
//! built host-side from a [`Params`](params::Params) descriptor, compiled
//! into a plan by a [`Runtime`](runtime::Runtime) and replayed under one of
//! several [`Strategy`](bench::Strategy) variants, or bypassed entirely by
//! direct per-stream dispatch.

pub mod args;
pub mod bench;
pub mod chunk;
pub mod dispatch;
pub mod graph;
pub mod kernel;
pub mod metrics;
pub mod native;
pub mod params;
pub mod runtime;
pub mod validate;

#[cfg(test)]
mod tests;

pub mod prelude {
    pub use crate::args::{ArgKind, KernelArg};
    pub use crate::bench::{
        BenchError, Benchmark, ExecutionPlan, RunConfig, RunOutcome, Strategy, execute,
    };
    pub use crate::chunk::{Chunk, chunk};
    pub use crate::dispatch::StreamDispatcher;
    pub use crate::graph::{Node, NodeIndex, TaskGraph, TaskNode, Topology};
    pub use crate::kernel::{Kernel, KernelOp, LaunchDims, Task};
    pub use crate::metrics::{BenchReport, Timings};
    pub use crate::native::NativeRuntime;
    pub use crate::params::{Params, ParamsError};
    pub use crate::runtime::{BufferId, Runtime, RuntimeError, UpdateMode, UpdateOutcome};
    pub use crate::validate::{ValidationError, validate};
    pub use petgraph;
    pub use tracing;
}
