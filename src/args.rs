//! Typed kernel argument lists and their per-task forwarding.
//!
//! A kernel is bound to a template argument list describing the whole
//! buffer. Each task node receives a copy of that list rewritten for its
//! chunk: buffer arguments move forward by the chunk offset, element counts
//! shrink to the chunk width, every other scalar passes through untouched.

use serde::Serialize;
use thiserror::Error;

use crate::{chunk::Chunk, runtime::BufferId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArgKind {
    Buffer,
    Count,
    F64,
    U64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum KernelArg {
    /// Device buffer addressed `offset` elements past its base.
    Buffer { buffer: BufferId, offset: usize },
    /// Number of elements the kernel touches.
    Count(usize),
    F64(f64),
    U64(u64),
}

impl KernelArg {
    pub fn buffer(buffer: BufferId) -> Self {
        Self::Buffer { buffer, offset: 0 }
    }

    pub fn kind(&self) -> ArgKind {
        match self {
            Self::Buffer { .. } => ArgKind::Buffer,
            Self::Count(_) => ArgKind::Count,
            Self::F64(_) => ArgKind::F64,
            Self::U64(_) => ArgKind::U64,
        }
    }

    /// Rewrite this argument for the task owning `chunk`.
    pub fn forward(&self, chunk: Chunk) -> Self {
        match *self {
            Self::Buffer { buffer, offset } => Self::Buffer {
                buffer,
                offset: offset + chunk.offset,
            },
            Self::Count(_) => Self::Count(chunk.width),
            scalar => scalar,
        }
    }

    /// Raw 8-byte representation handed to a device launch.
    ///
    /// Buffers are resolved by the caller, so only scalars are encoded here.
    pub fn scalar_bits(&self) -> Option<u64> {
        match *self {
            Self::Buffer { .. } => None,
            Self::Count(n) => Some(n as u64),
            Self::F64(v) => Some(v.to_bits()),
            Self::U64(v) => Some(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgError {
    #[error("expected {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("argument {index} should be {expected:?}, got {got:?}")]
    Kind {
        index: usize,
        expected: ArgKind,
        got: ArgKind,
    },
}

/// Check an argument list against a kernel signature.
pub fn check_signature(args: &[KernelArg], signature: &[ArgKind]) -> Result<(), ArgError> {
    if args.len() != signature.len() {
        return Err(ArgError::Arity {
            expected: signature.len(),
            got: args.len(),
        });
    }
    for (index, (arg, &expected)) in args.iter().zip(signature).enumerate() {
        if arg.kind() != expected {
            return Err(ArgError::Kind {
                index,
                expected,
                got: arg.kind(),
            });
        }
    }
    Ok(())
}

/// Forward a whole template argument list to one task.
pub fn forward(args: &[KernelArg], chunk: Chunk) -> Vec<KernelArg> {
    args.iter().map(|a| a.forward(chunk)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_by_kind() {
        let template = [
            KernelArg::buffer(BufferId(3)),
            KernelArg::Count(1024),
            KernelArg::F64(0.5),
            KernelArg::U64(7),
        ];
        let chunk = Chunk {
            offset: 256,
            width: 128,
        };
        assert_eq!(
            forward(&template, chunk),
            vec![
                KernelArg::Buffer {
                    buffer: BufferId(3),
                    offset: 256
                },
                KernelArg::Count(128),
                KernelArg::F64(0.5),
                KernelArg::U64(7),
            ]
        );
    }

    #[test]
    fn forwarding_composes_offsets() {
        let arg = KernelArg::Buffer {
            buffer: BufferId(0),
            offset: 10,
        };
        let fwd = arg.forward(Chunk {
            offset: 5,
            width: 1,
        });
        assert_eq!(
            fwd,
            KernelArg::Buffer {
                buffer: BufferId(0),
                offset: 15
            }
        );
    }

    #[test]
    fn signature_mismatch() {
        let sig = [ArgKind::Buffer, ArgKind::Count];
        assert_eq!(
            check_signature(&[KernelArg::Count(1)], &sig),
            Err(ArgError::Arity {
                expected: 2,
                got: 1
            })
        );
        assert_eq!(
            check_signature(&[KernelArg::Count(1), KernelArg::Count(1)], &sig),
            Err(ArgError::Kind {
                index: 0,
                expected: ArgKind::Buffer,
                got: ArgKind::Count
            })
        );
        assert!(
            check_signature(&[KernelArg::buffer(BufferId(0)), KernelArg::Count(1)], &sig).is_ok()
        );
    }

    #[test]
    fn scalar_encoding() {
        assert_eq!(KernelArg::Count(9).scalar_bits(), Some(9));
        assert_eq!(KernelArg::F64(2.0).scalar_bits(), Some(2.0f64.to_bits()));
        assert_eq!(KernelArg::buffer(BufferId(1)).scalar_bits(), None);
    }
}
