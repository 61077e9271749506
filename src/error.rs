//! Error types shared by the physical and partition layers.

use std::collections::TryReserveError;
use std::fmt;

use thiserror::Error;

use crate::nand::PhysicalNand;
use crate::partition::PhysicalPartition;

/// Failure reported by a physical NAND primitive.
///
/// The partition layer never interprets these; they are relayed to the caller unmodified.
#[derive(Debug, Error)]
pub enum PhysicalError {
    #[error("address {chip}:{block} (page {page}) out of range")]
    OutOfRange { chip: u32, block: u32, page: u32 },

    #[error("buffer is {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("block {chip}:{block} page {page} is already programmed")]
    AlreadyProgrammed { chip: u32, block: u32, page: u32 },

    #[error("erase of block {chip}:{block} failed")]
    EraseFailed { chip: u32, block: u32 },

    #[error("program of block {chip}:{block} page {page} failed")]
    ProgramFailed { chip: u32, block: u32, page: u32 },

    #[error("marking block {chip}:{block} bad failed")]
    MarkFailed { chip: u32, block: u32 },

    #[error("uncorrectable ECC error in block {chip}:{block} page {page}")]
    Uncorrectable { chip: u32, block: u32, page: u32 },

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for PhysicalError {
    fn from(value: nix::errno::Errno) -> Self {
        Self::Io(value.into())
    }
}

/// Why a logical partition could not be created
#[derive(Debug, Error)]
pub enum CreateErrorKind {
    #[error("allocation failed")]
    Allocation(#[from] TryReserveError),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(&'static str),
}

/// Returned when a logical partition can't be created.
///
/// Ownership of the physical partition goes back to the caller, untouched.
pub struct CreateError<N: PhysicalNand> {
    pub kind: CreateErrorKind,
    geometry: PhysicalPartition<N>,
}

impl<N: PhysicalNand> CreateError<N> {
    pub(crate) fn new(kind: CreateErrorKind, geometry: PhysicalPartition<N>) -> Self {
        Self { kind, geometry }
    }

    /// Take the physical partition back
    pub fn into_geometry(self) -> PhysicalPartition<N> {
        self.geometry
    }
}

impl<N: PhysicalNand> fmt::Debug for CreateError<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateError")
            .field("kind", &self.kind)
            .field("geometry", &self.geometry)
            .finish()
    }
}

impl<N: PhysicalNand> fmt::Display for CreateError<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot create logical partition {}: {}",
            self.geometry.index, self.kind
        )
    }
}

impl<N: PhysicalNand> std::error::Error for CreateError<N> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}
