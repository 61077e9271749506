//! Fixed constants of the partition layer, and the partition table configuration format.

use std::str::FromStr;

use anyhow::ensure;

/// Bytes in one sector; pages are built from a whole number of these
pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_SHIFT: u32 = 9;

/// Spare bytes per page assumed when a layout string doesn't give one
pub const DEFAULT_SPARE_BYTES: u32 = 16;

/// Logical partitions are named this, followed by their index
pub const PARTITION_NAME_PREFIX: &str = "nand_partition";

/// Fill pattern used in saved images for blocks that can't be read back
pub const BAD_BLOCK_FILL: u8 = 0xBD;

/// One entry of a [PartitionTable]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PartitionEntry {
    /// Physical blocks assigned to the partition
    pub blocks: u32,

    /// How many of those blocks are withheld as a spare pool
    pub free_blocks: u32,
}

/// An ordered list of partitions to be laid out back-to-back on one device
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PartitionTable {
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Total physical blocks the table needs
    pub fn total_blocks(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.blocks)).sum()
    }
}

/// Parse strings like "BLOCKS:FREE"; a missing ":FREE" reserves nothing
impl FromStr for PartitionEntry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (blocks, free_blocks): (u32, u32) = match s.split_once(':') {
            Some((blocks, free)) => (blocks.trim().parse()?, free.trim().parse()?),
            None => (s.trim().parse()?, 0),
        };

        ensure!(blocks > 0, "partition must have at least one block");
        ensure!(
            free_blocks <= blocks,
            "partition reserves {free_blocks} free blocks but only has {blocks}"
        );

        Ok(PartitionEntry {
            blocks,
            free_blocks,
        })
    }
}

/// Parse strings like "BLOCKS:FREE,BLOCKS:FREE,..."
impl FromStr for PartitionTable {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let entries = s
            .split(',')
            .map(str::parse)
            .collect::<anyhow::Result<Vec<PartitionEntry>>>()?;

        ensure!(!entries.is_empty(), "partition table is empty");

        Ok(PartitionTable { entries })
    }
}

#[test]
fn test_parse_table() -> anyhow::Result<()> {
    let table: PartitionTable = "1024:32, 64,2048:0".parse()?;
    assert_eq!(
        table.entries,
        [
            PartitionEntry {
                blocks: 1024,
                free_blocks: 32
            },
            PartitionEntry {
                blocks: 64,
                free_blocks: 0
            },
            PartitionEntry {
                blocks: 2048,
                free_blocks: 0
            },
        ]
    );
    assert_eq!(table.total_blocks(), 1024 + 64 + 2048);
    Ok(())
}

#[test]
fn test_parse_table_rejects() {
    assert!("".parse::<PartitionTable>().is_err());
    assert!("16:17".parse::<PartitionTable>().is_err());
    assert!("0".parse::<PartitionTable>().is_err());
    assert!("12:x".parse::<PartitionTable>().is_err());
}
