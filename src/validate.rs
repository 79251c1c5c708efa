//! Host-side check of device results.

use thiserror::Error;

use crate::kernel::Kernel;

/// Largest absolute difference accepted between device and host values.
pub const TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ValidationError {
    #[error("mismatch at index {index}: expected {expected}, got {actual}")]
    Mismatch {
        index: usize,
        expected: f64,
        actual: f64,
    },
    #[error("device returned {device} elements, reference has {reference}")]
    Length { device: usize, reference: usize },
}

/// Compare element-wise, stopping at the first element further than
/// [`TOLERANCE`] from the reference.
pub fn compare(device: &[f64], reference: &[f64]) -> Result<(), ValidationError> {
    if device.len() != reference.len() {
        return Err(ValidationError::Length {
            device: device.len(),
            reference: reference.len(),
        });
    }
    match device
        .iter()
        .zip(reference)
        .position(|(a, b)| !((a - b).abs() <= TOLERANCE))
    {
        Some(index) => Err(ValidationError::Mismatch {
            index,
            expected: reference[index],
            actual: device[index],
        }),
        None => Ok(()),
    }
}

/// Recompute `applications` passes of `kernel` over `input` on the host and
/// compare against `device`.
pub fn validate(
    kernel: &Kernel,
    input: &[f64],
    applications: usize,
    device: &[f64],
) -> Result<(), ValidationError> {
    compare(device, &kernel.reference(input, applications))
}
