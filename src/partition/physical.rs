//! Physical partition descriptors, and laying a partition table out on a device.

use std::fmt;
use std::sync::Arc;

use anyhow::ensure;
use log::debug;

use super::BlockAddress;
use crate::config::PartitionTable;
use crate::nand::{NandDevice, PhysicalNand, SectorBitmap};

/// Where a partition lives on its device, and the device's shape.
///
/// The fields are public so that odd layouts can be described, but [PhysicalPartition::new]
/// fills them in consistently from the device.
pub struct PhysicalPartition<N> {
    device: Arc<NandDevice<N>>,

    /// Position among the partitions sharing the device
    pub index: u32,

    /// First block of the partition
    pub start: BlockAddress,

    pub blocks_per_chip: u32,
    pub pages_per_block: u32,
    pub sectors_per_page: u32,
    pub spare_bytes: u32,

    /// Physical blocks assigned to the partition
    pub total_blocks: u32,

    /// Of those, how many are held back as a spare pool
    pub free_blocks: u32,

    /// Capacity exposed upwards, in sectors
    pub total_sectors: u64,

    pub full_bitmap: SectorBitmap,

    /// Must writes wait for the whole device to go idle first?
    pub cross_talk: bool,
}

impl<N: PhysicalNand> PhysicalPartition<N> {
    pub fn new(
        device: Arc<NandDevice<N>>,
        index: u32,
        start: BlockAddress,
        total_blocks: u32,
        free_blocks: u32,
    ) -> Self {
        let layout = device.layout();
        let usable = u64::from(total_blocks.saturating_sub(free_blocks));

        Self {
            index,
            start,
            blocks_per_chip: layout.blocks_per_chip,
            pages_per_block: layout.pages_per_block,
            sectors_per_page: layout.sectors_per_page,
            spare_bytes: layout.spare_bytes,
            total_blocks,
            free_blocks,
            total_sectors: usable
                * u64::from(layout.pages_per_block)
                * u64::from(layout.sectors_per_page),
            full_bitmap: SectorBitmap::full(layout.sectors_per_page),
            cross_talk: false,
            device,
        }
    }

    /// Expose a capacity other than every sector of every usable block
    pub fn with_capacity_sectors(mut self, sectors: u64) -> Self {
        self.total_sectors = sectors;
        self
    }

    pub fn with_cross_talk(mut self, cross_talk: bool) -> Self {
        self.cross_talk = cross_talk;
        self
    }

    pub fn device(&self) -> &NandDevice<N> {
        &self.device
    }

    /// Release the descriptor (and its share of the device)
    pub fn destroy(self) {
        debug!("freeing physical partition {}", self.index);
    }
}

impl<N> fmt::Debug for PhysicalPartition<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPartition")
            .field("index", &self.index)
            .field("start", &self.start)
            .field("blocks_per_chip", &self.blocks_per_chip)
            .field("pages_per_block", &self.pages_per_block)
            .field("sectors_per_page", &self.sectors_per_page)
            .field("spare_bytes", &self.spare_bytes)
            .field("total_blocks", &self.total_blocks)
            .field("free_blocks", &self.free_blocks)
            .field("total_sectors", &self.total_sectors)
            .field("full_bitmap", &self.full_bitmap)
            .field("cross_talk", &self.cross_talk)
            .finish_non_exhaustive()
    }
}

/// Lay the partitions of `table` out back-to-back, beginning at device block `first_block`
/// (counted across chips), and describe each one.
pub fn build_physical_partitions<N: PhysicalNand>(
    device: &Arc<NandDevice<N>>,
    table: &PartitionTable,
    first_block: u64,
) -> anyhow::Result<Vec<PhysicalPartition<N>>> {
    let layout = device.layout();
    let blocks_per_chip = u64::from(layout.blocks_per_chip);

    ensure!(blocks_per_chip > 0, "device has no blocks");
    ensure!(
        first_block
            .checked_add(table.total_blocks())
            .is_some_and(|end| end <= layout.total_blocks()),
        "partition table needs {} blocks starting at block {first_block}, device only has {}",
        table.total_blocks(),
        layout.total_blocks()
    );

    let mut next = first_block;
    let mut partitions = Vec::with_capacity(table.entries.len());
    for (index, entry) in table.entries.iter().enumerate() {
        ensure!(
            entry.free_blocks <= entry.blocks,
            "partition {index} reserves more free blocks than it has"
        );

        let start = BlockAddress {
            chip: (next / blocks_per_chip) as u32,
            block: (next % blocks_per_chip) as u32,
        };
        debug!(
            "physical partition {index}: {} blocks ({} free) from {start}",
            entry.blocks, entry.free_blocks
        );

        partitions.push(PhysicalPartition::new(
            device.clone(),
            index as u32,
            start,
            entry.blocks,
            entry.free_blocks,
        ));
        next += u64::from(entry.blocks);
    }

    Ok(partitions)
}

#[cfg(test)]
fn test_device() -> Arc<NandDevice<crate::nand::SimNand>> {
    use crate::nand::{NandLayout, SimNand};

    Arc::new(NandDevice::new(SimNand::new(NandLayout {
        chips: 2,
        blocks_per_chip: 64,
        pages_per_block: 8,
        sectors_per_page: 4,
        spare_bytes: 16,
    })))
}

#[test]
fn test_new_from_layout() {
    let device = test_device();
    let part = PhysicalPartition::new(device, 2, BlockAddress { chip: 0, block: 10 }, 40, 4);

    assert_eq!(part.blocks_per_chip, 64);
    assert_eq!(part.pages_per_block, 8);
    assert_eq!(part.sectors_per_page, 4);
    assert_eq!(part.spare_bytes, 16);
    assert_eq!(part.total_sectors, 36 * 8 * 4);
    assert_eq!(part.full_bitmap, SectorBitmap(0b1111));
    assert!(!part.cross_talk);

    let part = part.with_capacity_sectors(1000).with_cross_talk(true);
    assert_eq!(part.total_sectors, 1000);
    assert!(part.cross_talk);
}

#[test]
fn test_build_partitions() -> anyhow::Result<()> {
    let device = test_device();
    let table: PartitionTable = "50:2,30:3,20".parse()?;
    let parts = build_physical_partitions(&device, &table, 4)?;

    let summary = parts
        .iter()
        .map(|p| (p.index, p.start, p.total_blocks, p.free_blocks))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        [
            (0, BlockAddress { chip: 0, block: 4 }, 50, 2),
            (1, BlockAddress { chip: 0, block: 54 }, 30, 3),
            (2, BlockAddress { chip: 1, block: 20 }, 20, 0),
        ]
    );

    // Every descriptor holds a share of the device
    assert_eq!(Arc::strong_count(&device), 4);
    parts.into_iter().for_each(PhysicalPartition::destroy);
    assert_eq!(Arc::strong_count(&device), 1);
    Ok(())
}

#[test]
fn test_build_partitions_too_big() -> anyhow::Result<()> {
    let device = test_device();
    let table: PartitionTable = "100,28".parse()?;
    assert!(build_physical_partitions(&device, &table, 0).is_ok());
    assert!(build_physical_partitions(&device, &table, 1).is_err());

    // A start so far out that the end overflows
    assert!(build_physical_partitions(&device, &table, u64::MAX).is_err());
    assert!(build_physical_partitions(&device, &table, u64::MAX - 50).is_err());
    Ok(())
}
