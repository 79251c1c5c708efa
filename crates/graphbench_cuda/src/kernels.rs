//! Device source of the benchmark kernels.
//!
//! Every parameter is passed as one 8-byte slot: buffers as device pointers,
//! counts and iteration numbers as `unsigned long long`, scalars as `double`.

use graphbench::kernel::KernelOp;

pub const KERNELS: &str = r#"
extern "C" __global__ void newton_kernel(double* x, unsigned long long n, unsigned long long iterations) {
    unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    double v = x[i];
    for (unsigned long long k = 0; k < iterations; ++k) {
        double e = exp(cos(v));
        double f = e - 2.0;
        double df = -sin(v) * e;
        v -= f / df;
    }
    x[i] = v;
}

extern "C" __global__ void update_kernel(double* x, unsigned long long n, double alpha, double beta) {
    unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    x[i] = x[i] * alpha + beta;
}
"#;

/// Entry points that must be present in [`KERNELS`].
pub fn entry_points() -> impl Iterator<Item = (KernelOp, &'static str)> {
    KernelOp::all().into_iter().map(|op| (op, op.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_op_has_source() {
        for (_, name) in entry_points() {
            assert!(KERNELS.contains(&format!("void {name}(")), "{name}");
        }
    }
}
