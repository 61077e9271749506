//! Logical partitions: contiguous spans of blocks on a shared NAND device, addressed by logical
//! block number.
//!
//! ```text
//!  chip 0                                   chip 1
//! +-----------------------------------+    +-----------------------------------+
//! | ... | part 0 ...           | part 1 | -> | part 1 ...       | part 2 ...     |
//! +-----------------------------------+    +-----------------------------------+
//!         ^ start (0, n)          ^ start (0, m), rolls over into chip 1
//! ```
//!
//! A [PhysicalPartition] describes where a partition lives and how the device is shaped. A
//! [LogicalPartition] takes ownership of one, derives its sizing once, and exposes the
//! [FlashPartition] operations that an FTL builds on. Every operation translates the logical
//! block to a physical (chip, block) before delegating to the device; nothing here remaps or
//! avoids bad blocks on its own.

mod logical;
mod physical;
mod scan;

use std::fmt;

use crate::error::PhysicalError;
use crate::nand::SectorBitmap;

pub use logical::LogicalPartition;
pub use physical::{build_physical_partitions, PhysicalPartition};
pub use scan::scan_bad_blocks;

/// An absolute block coordinate on a device
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BlockAddress {
    pub chip: u32,
    pub block: u32,
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chip, self.block)
    }
}

/// The operations a flash translation layer uses on a partition.
///
/// Blocks are logical block numbers, zero-based from the start of the partition. Buffers follow
/// the conventions of [crate::nand::PhysicalNand].
pub trait FlashPartition {
    fn name(&self) -> &str;

    /// Blocks usable by the FTL (the free block reserve already subtracted)
    fn total_blocks(&self) -> u32;

    fn pages_per_block(&self) -> u32;
    fn bytes_per_page(&self) -> usize;
    fn spare_bytes(&self) -> usize;

    /// The mask selecting every sector of a page
    fn full_bitmap(&self) -> SectorBitmap;

    /// Erase a block
    fn erase(&self, block: u32) -> Result<(), PhysicalError>;

    /// Read the selected sectors of a page, plus spare bytes
    fn read(
        &self,
        block: u32,
        page: u32,
        sectors: SectorBitmap,
        user: &mut [u8],
        spare: &mut [u8],
    ) -> Result<(), PhysicalError>;

    /// Program the selected sectors of a page, plus spare bytes
    fn write(
        &self,
        block: u32,
        page: u32,
        sectors: SectorBitmap,
        user: &[u8],
        spare: &[u8],
    ) -> Result<(), PhysicalError>;

    /// Is the block free of both factory and runtime-acquired defects?
    ///
    /// This is a snapshot: a concurrent [FlashPartition::mark_block_bad] may not be seen yet.
    fn is_block_good(&self, block: u32) -> bool;

    /// Mark a block bad. The block is recorded as bad even if marking fails.
    fn mark_block_bad(&self, block: u32) -> Result<(), PhysicalError>;
}
