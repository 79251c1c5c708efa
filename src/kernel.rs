//! The two task kernels and their launch geometry.
//!
//! Both kernels take the data buffer as their first argument and its element
//! count as their second; any further arguments are scalars. The host
//! implementations here are the reference the device versions are validated
//! against, so they perform the arithmetic in the same order.

use serde::Serialize;

use crate::{
    args::{ArgError, ArgKind, KernelArg, check_signature, forward},
    chunk::Chunk,
    params::grid_for,
    runtime::BufferId,
};

/// Newton iterations performed by every root-finding task.
pub const NEWTON_ITERATIONS: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KernelOp {
    /// Fixed-iteration Newton solve of `exp(cos(x)) - 2 = 0`, in place.
    Newton,
    /// `x = alpha * x + beta`, in place.
    Update,
}

impl KernelOp {
    /// Device entry point name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Newton => "newton_kernel",
            Self::Update => "update_kernel",
        }
    }

    pub fn signature(&self) -> &'static [ArgKind] {
        match self {
            Self::Newton => &[ArgKind::Buffer, ArgKind::Count, ArgKind::U64],
            Self::Update => &[ArgKind::Buffer, ArgKind::Count, ArgKind::F64, ArgKind::F64],
        }
    }

    /// Run the kernel on the host over `data`, which must already be the
    /// window selected by the buffer and count arguments.
    pub fn apply(&self, args: &[KernelArg], data: &mut [f64]) {
        match (self, args) {
            (Self::Newton, [_, _, KernelArg::U64(iterations)]) => {
                for x in data {
                    *x = newton(*x, *iterations);
                }
            }
            (Self::Update, [_, _, KernelArg::F64(alpha), KernelArg::F64(beta)]) => {
                for x in data {
                    *x = *x * alpha + beta;
                }
            }
            _ => panic!("{self:?} invoked with mismatched arguments {args:?}"),
        }
    }

    pub fn all() -> [KernelOp; 2] {
        [Self::Newton, Self::Update]
    }
}

pub fn newton(mut x: f64, iterations: u64) -> f64 {
    for _ in 0..iterations {
        let e = x.cos().exp();
        let f = e - 2.0;
        let df = -x.sin() * e;
        x -= f / df;
    }
    x
}

/// Buffer window addressed by an argument list: buffer, element offset and
/// element count.
pub fn window(args: &[KernelArg]) -> Option<(BufferId, usize, usize)> {
    match args {
        [KernelArg::Buffer { buffer, offset }, KernelArg::Count(n), ..] => {
            Some((*buffer, *offset, *n))
        }
        _ => None,
    }
}

/// A kernel bound to its whole-buffer argument template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Kernel {
    op: KernelOp,
    args: Vec<KernelArg>,
}

impl Kernel {
    pub fn new(op: KernelOp, args: Vec<KernelArg>) -> Result<Self, ArgError> {
        check_signature(&args, op.signature())?;
        Ok(Self { op, args })
    }

    pub fn newton(buffer: BufferId, len: usize) -> Self {
        Self {
            op: KernelOp::Newton,
            args: vec![
                KernelArg::buffer(buffer),
                KernelArg::Count(len),
                KernelArg::U64(NEWTON_ITERATIONS),
            ],
        }
    }

    pub fn update(buffer: BufferId, len: usize, alpha: f64, beta: f64) -> Self {
        Self {
            op: KernelOp::Update,
            args: vec![
                KernelArg::buffer(buffer),
                KernelArg::Count(len),
                KernelArg::F64(alpha),
                KernelArg::F64(beta),
            ],
        }
    }

    pub fn op(&self) -> KernelOp {
        self.op
    }

    pub fn args(&self) -> &[KernelArg] {
        &self.args
    }

    /// Argument list for the task owning `chunk`.
    pub fn bind(&self, chunk: Chunk) -> Vec<KernelArg> {
        forward(&self.args, chunk)
    }

    /// Task for the owner of `chunk`, launched `block` threads wide.
    pub fn task(&self, chunk: Chunk, block: u32) -> Task {
        Task {
            op: self.op,
            args: self.bind(chunk),
            launch: LaunchDims::for_width(chunk.width, block),
        }
    }

    /// Host reference: apply the kernel `applications` times to `input`.
    pub fn reference(&self, input: &[f64], applications: usize) -> Vec<f64> {
        let mut out = input.to_vec();
        let whole = Chunk {
            offset: 0,
            width: out.len(),
        };
        let args = self.bind(whole);
        for _ in 0..applications {
            self.op.apply(&args, &mut out);
        }
        out
    }
}

/// One launchable unit: a kernel, its forwarded arguments and geometry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub op: KernelOp,
    pub args: Vec<KernelArg>,
    pub launch: LaunchDims,
}

impl Task {
    /// Number of elements this task touches.
    pub fn width(&self) -> usize {
        window(&self.args).map_or(0, |(_, _, n)| n)
    }
}

/// Blocks and threads per block of one task launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LaunchDims {
    pub grid: u32,
    pub block: u32,
}

impl LaunchDims {
    pub fn for_width(width: usize, block: u32) -> Self {
        Self {
            grid: grid_for(width, block),
            block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newton_converges_from_two() {
        let root = newton(2.0, NEWTON_ITERATIONS);
        assert!(((root.cos()).exp() - 2.0).abs() < 1e-12, "root {root}");
        // Further iterations stay put
        assert!((newton(root, NEWTON_ITERATIONS) - root).abs() < 1e-12);
    }

    #[test]
    fn update_applies_affine_map() {
        let k = Kernel::update(BufferId(0), 3, 0.5, 1.0);
        assert_eq!(k.reference(&[0.0, 2.0, 4.0], 1), vec![1.0, 2.0, 3.0]);
        assert_eq!(k.reference(&[4.0], 2), vec![2.5]);
    }

    #[test]
    fn constructors_match_signatures() {
        for k in [
            Kernel::newton(BufferId(0), 4),
            Kernel::update(BufferId(0), 4, 1.0, 0.0),
        ] {
            assert!(Kernel::new(k.op(), k.args().to_vec()).is_ok());
        }
        assert!(Kernel::new(KernelOp::Update, Kernel::newton(BufferId(0), 4).args().to_vec()).is_err());
    }

    #[test]
    fn window_of_bound_args() {
        let k = Kernel::newton(BufferId(2), 100);
        let args = k.bind(Chunk {
            offset: 40,
            width: 20,
        });
        assert_eq!(window(&args), Some((BufferId(2), 40, 20)));
    }

    #[test]
    fn task_geometry_follows_chunk() {
        let k = Kernel::newton(BufferId(0), 1000);
        let t = k.task(Chunk { offset: 900, width: 300 }, 128);
        assert_eq!(t.launch, LaunchDims { grid: 3, block: 128 });
        assert_eq!(t.width(), 300);
    }

    #[test]
    fn launch_dims_round_up() {
        assert_eq!(LaunchDims::for_width(129, 128), LaunchDims { grid: 2, block: 128 });
        assert_eq!(LaunchDims::for_width(0, 128), LaunchDims { grid: 1, block: 128 });
    }
}
