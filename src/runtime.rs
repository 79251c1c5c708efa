//! Accelerator contract consumed by the benchmarks.
//!
//! Every device operation returns a `Result`; backends translate their own
//! status codes into [`RuntimeError`] so nothing above this layer inspects
//! raw driver codes.

use serde::Serialize;
use thiserror::Error;

use crate::{
    graph::TaskGraph,
    kernel::{KernelOp, Task},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId(pub u64);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to allocate {len} elements: {reason}")]
    Alloc { len: usize, reason: String },
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
    #[error("copy of {got} elements into {buffer:?} which holds {len}")]
    SizeMismatch {
        buffer: BufferId,
        len: usize,
        got: usize,
    },
    #[error("window [{offset}, {end}) lies outside {buffer:?} of {len} elements")]
    OutOfRange {
        buffer: BufferId,
        offset: usize,
        end: usize,
        len: usize,
    },
    #[error("{0:?} launched with a malformed argument list")]
    MalformedArgs(KernelOp),
    #[error("failed to compile device kernels: {0}")]
    Compile(String),
    #[error("{op} failed: {message}")]
    Driver { op: &'static str, message: String },
    #[error("device worker for queue {0} is gone")]
    QueueLost(usize),
}

impl RuntimeError {
    pub fn driver(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Driver {
            op,
            message: err.to_string(),
        }
    }
}

/// How a rebuilt graph is applied to a live plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum UpdateMode {
    /// Patch the instantiated plan in place. Only legal when the rebuilt
    /// graph has the same topology as the one the plan was built from.
    #[default]
    Diff,
    /// Instantiate the rebuilt graph and swap it in for the old plan.
    Replace,
}

/// Result of applying a rebuilt graph to a live plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateOutcome {
    /// The plan was patched in place.
    Applied,
    /// The plan was re-instantiated from the rebuilt graph.
    Replaced,
    /// A diff update was refused because the topology differs. The live plan
    /// is unchanged.
    TopologyChanged,
}

/// A data-parallel accelerator with FIFO queues and launchable task graphs.
///
/// Launches are asynchronous: they return once the work is enqueued.
/// `synchronize_queue` and `synchronize` block until previously enqueued
/// work has completed, and are where asynchronous failures surface.
pub trait Runtime: Sync {
    type Queue: Send + Sync;
    type Plan: Send;

    fn name(&self) -> &'static str;

    fn alloc(&self, len: usize) -> Result<BufferId, RuntimeError>;
    fn free(&self, buffer: BufferId) -> Result<(), RuntimeError>;
    /// Host to device copy of the whole buffer.
    fn write(&self, buffer: BufferId, data: &[f64]) -> Result<(), RuntimeError>;
    /// Device to host copy of the whole buffer.
    fn read(&self, buffer: BufferId) -> Result<Vec<f64>, RuntimeError>;
    /// Block until all work on every queue has completed.
    fn synchronize(&self) -> Result<(), RuntimeError>;

    fn create_queue(&self) -> Result<Self::Queue, RuntimeError>;
    fn synchronize_queue(&self, queue: &Self::Queue) -> Result<(), RuntimeError>;
    /// Enqueue a single task.
    fn launch(&self, queue: &Self::Queue, task: &Task) -> Result<(), RuntimeError>;

    /// Compile a host-side graph into a launchable plan.
    fn instantiate(&self, graph: &TaskGraph) -> Result<Self::Plan, RuntimeError>;
    fn update(
        &self,
        plan: &mut Self::Plan,
        graph: &TaskGraph,
        mode: UpdateMode,
    ) -> Result<UpdateOutcome, RuntimeError>;
    /// Enqueue one full execution of `plan`.
    fn launch_plan(&self, plan: &Self::Plan, queue: &Self::Queue) -> Result<(), RuntimeError>;
}
