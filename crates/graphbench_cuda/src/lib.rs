//! CUDA backend: driver streams as queues and instantiated CUDA graphs as
//! plans.

pub mod graph;
pub mod kernels;
pub mod runtime;
pub use cudarc;
pub use runtime::{CudaPlan, CudaRuntime};
