//! This module contains code to find the bad blocks of a partition, as an FTL does when it
//! starts up.

use log::debug;

use super::FlashPartition;

/// Query every logical block of the partition, returning the ones that are bad
pub fn scan_bad_blocks<P: FlashPartition + ?Sized>(partition: &P) -> Vec<u32> {
    let total_blocks = partition.total_blocks();
    let rpt = howudoin::new()
        .label(format!("Scanning {}", partition.name()))
        .set_len(u64::from(total_blocks));

    let mut bad = Vec::new();
    for block in 0..total_blocks {
        if !partition.is_block_good(block) {
            bad.push(block);
        }
        rpt.inc();
    }

    rpt.close();
    debug!(
        "{}: {} of {total_blocks} blocks bad",
        partition.name(),
        bad.len()
    );

    bad
}

#[test]
fn test_scan() -> anyhow::Result<()> {
    use std::sync::Arc;

    use crate::nand::{NandDevice, NandLayout, PhysicalNand, SimNand};
    use crate::partition::{BlockAddress, LogicalPartition, PhysicalPartition};

    const TEST_LAYOUT: NandLayout = NandLayout {
        chips: 2,
        blocks_per_chip: 32,
        pages_per_block: 4,
        sectors_per_page: 2,
        spare_bytes: 8,
    };

    // Partition covers 0:28..1:12, with four of those blocks held in reserve
    let nand = SimNand::new(TEST_LAYOUT)
        .with_factory_bad(0, 29)
        .with_factory_bad(1, 20);
    let device = Arc::new(NandDevice::new(nand));
    let start = BlockAddress {
        chip: 0,
        block: 28,
    };
    let geometry = PhysicalPartition::new(device.clone(), 1, start, 20, 4);
    let partition = LogicalPartition::create(geometry).map_err(|e| anyhow::anyhow!("{e}"))?;

    assert_eq!(scan_bad_blocks(&partition), [1]);

    device.nand().record_runtime_bad(1, 3);
    partition.mark_block_bad(10)?;
    assert_eq!(scan_bad_blocks(&partition), [1, 7, 10]);

    // Also works through a trait object
    let dyn_partition: &dyn FlashPartition = &partition;
    assert_eq!(scan_bad_blocks(dyn_partition).len(), 3);
    Ok(())
}
