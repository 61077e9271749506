//! A simulated in-memory NAND flash, for testing purposes

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::{Mutex, PoisonError, RwLock};

use super::{NandLayout, PageUtil, PhysicalNand, SectorBitmap};
use crate::config::{BAD_BLOCK_FILL, SECTOR_SIZE};
use crate::error::PhysicalError;
use crate::util::{LockExt, ReadExt, RwLockExt};

/// A persistent failure injected into a [SimNand] block
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SimFault {
    Erase { chip: u32, block: u32 },
    Program { chip: u32, block: u32 },
    Mark { chip: u32, block: u32 },
}

/// An entry in the [SimNand] operation journal
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimOp {
    WaitReady,
    Erase { chip: u32, block: u32 },
    Read { chip: u32, block: u32, page: u32 },
    Write { chip: u32, block: u32, page: u32 },
    MarkBad { chip: u32, block: u32 },
}

/// A simulated NAND flash device with any number of chips
#[derive(Debug)]
pub struct SimNand {
    layout: NandLayout,
    blocks: Mutex<Box<[SimBlock]>>,

    factory_bad: HashSet<(u32, u32)>,
    runtime_bad: RwLock<HashSet<(u32, u32)>>,

    /// Blocks the partition layer asked to have marked
    marked_bad: Mutex<HashSet<(u32, u32)>>,

    faults: Mutex<HashSet<SimFault>>,
    journal: Mutex<Vec<SimOp>>,
}

/// A block of SimNand; no pages means fully erased
#[derive(Debug, Clone, Default)]
struct SimBlock {
    pages: Vec<SimPage>,
}

#[derive(Debug, Clone)]
struct SimPage {
    data: Box<[u8]>,
    spare: Box<[u8]>,

    /// Sectors that have been programmed since the last erase
    programmed: SectorBitmap,
    spare_programmed: bool,
}

impl SimPage {
    fn erased(layout: &NandLayout) -> Self {
        Self {
            data: vec![0xFF; layout.bytes_per_page()].into(),
            spare: vec![0xFF; layout.spare_bytes as usize].into(),
            programmed: SectorBitmap::default(),
            spare_programmed: false,
        }
    }
}

impl SimNand {
    /// Create a fully-erased SimNand with the specified layout and no bad blocks
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::default(); layout.total_blocks() as usize];

        Self {
            layout,
            blocks: Mutex::new(blocks.into_boxed_slice()),
            factory_bad: Default::default(),
            runtime_bad: Default::default(),
            marked_bad: Default::default(),
            faults: Default::default(),
            journal: Default::default(),
        }
    }

    /// Declare a block as bad from the factory
    pub fn with_factory_bad(mut self, chip: u32, block: u32) -> Self {
        self.factory_bad.insert((chip, block));
        self
    }

    /// Make every future erase/program/mark of a block fail
    pub fn inject(&self, fault: SimFault) {
        self.faults.locked().insert(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.locked().clear();
    }

    /// Every primitive invoked so far, in order
    pub fn journal(&self) -> Vec<SimOp> {
        self.journal.locked().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.locked().clear();
    }

    /// How many times the ready/busy barrier has been waited on
    pub fn ready_waits(&self) -> usize {
        self.journal
            .locked()
            .iter()
            .filter(|op| **op == SimOp::WaitReady)
            .count()
    }

    /// Did anyone ask to have this block marked bad?
    pub fn is_marked(&self, chip: u32, block: u32) -> bool {
        self.marked_bad.locked().contains(&(chip, block))
    }

    /// Initialize the main data of every block from a raw image, such as a File.
    ///
    /// An image shorter than the device leaves the remaining blocks erased.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let layout = self.layout;
        let page_size = layout.bytes_per_page();
        let blocks = self
            .blocks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        let mut buf = Vec::with_capacity(layout.bytes_per_block());
        for block in blocks.iter_mut() {
            buf.clear();
            read.read_to_vec(&mut buf, layout.bytes_per_block())?;

            block.pages.clear();
            if buf.is_erased() {
                continue;
            }

            buf.resize(layout.bytes_per_block(), 0xFF);
            block.pages = buf
                .chunks_exact(page_size)
                .map(|content| {
                    let mut page = SimPage::erased(&layout);
                    page.data.copy_from_slice(content);
                    page.programmed = SectorBitmap(
                        content
                            .chunks_exact(SECTOR_SIZE)
                            .enumerate()
                            .filter(|(_, sector)| !sector.is_erased())
                            .fold(0, |bits, (i, _)| bits | 1u64 << i),
                    );
                    page
                })
                .collect();
        }

        Ok(())
    }

    /// Write the main data of every block out to a writable stream (such as a File).
    ///
    /// Blocks that are bad for any reason are written as a fill pattern.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.bytes_per_block()];
        let blocks = self.blocks.locked();

        for chip in 0..self.layout.chips {
            for block in 0..self.layout.blocks_per_chip {
                let content = &blocks[self.block_index(chip, block, 0)?];

                if self.is_factory_bad(chip, block)
                    || self.is_runtime_bad(chip, block)
                    || self.is_marked(chip, block)
                {
                    buf.fill(BAD_BLOCK_FILL);
                } else if content.pages.is_empty() {
                    buf.fill(0xFF);
                } else {
                    for (page, out) in content
                        .pages
                        .iter()
                        .zip(buf.chunks_exact_mut(self.layout.bytes_per_page()))
                    {
                        out.copy_from_slice(&page.data);
                    }
                }

                write.write_all(&buf)?;
            }
        }

        Ok(())
    }

    fn log(&self, op: SimOp) {
        self.journal.locked().push(op);
    }

    fn has_fault(&self, fault: SimFault) -> bool {
        self.faults.locked().contains(&fault)
    }

    /// Convert (chip, block) to an index into `blocks`, checking the page number too
    fn block_index(&self, chip: u32, block: u32, page: u32) -> Result<usize, PhysicalError> {
        if chip >= self.layout.chips
            || block >= self.layout.blocks_per_chip
            || page >= self.layout.pages_per_block
        {
            return Err(PhysicalError::OutOfRange { chip, block, page });
        }

        Ok(chip as usize * self.layout.blocks_per_chip as usize + block as usize)
    }

    fn check_buffers(&self, user: usize, spare: usize) -> Result<(), PhysicalError> {
        if user != self.layout.bytes_per_page() {
            return Err(PhysicalError::BufferSize {
                expected: self.layout.bytes_per_page(),
                actual: user,
            });
        }

        if spare > self.layout.spare_bytes as usize {
            return Err(PhysicalError::BufferSize {
                expected: self.layout.spare_bytes as usize,
                actual: spare,
            });
        }

        Ok(())
    }
}

impl PhysicalNand for SimNand {
    fn layout(&self) -> NandLayout {
        self.layout
    }

    fn erase_block(&self, chip: u32, block: u32) -> Result<(), PhysicalError> {
        self.log(SimOp::Erase { chip, block });
        let index = self.block_index(chip, block, 0)?;

        if self.has_fault(SimFault::Erase { chip, block }) {
            return Err(PhysicalError::EraseFailed { chip, block });
        }

        self.blocks.locked()[index].pages.clear();
        Ok(())
    }

    fn read_page(
        &self,
        chip: u32,
        block: u32,
        page: u32,
        sectors: SectorBitmap,
        user: &mut [u8],
        spare: &mut [u8],
    ) -> Result<(), PhysicalError> {
        self.log(SimOp::Read { chip, block, page });
        let index = self.block_index(chip, block, page)?;
        self.check_buffers(user.len(), spare.len())?;

        let blocks = self.blocks.locked();
        let content = blocks[index].pages.get(page as usize);

        for sector in sectors.within(self.layout.sectors_per_page).sectors() {
            let range = sector as usize * SECTOR_SIZE..(sector as usize + 1) * SECTOR_SIZE;
            match content {
                Some(content) => user[range.clone()].copy_from_slice(&content.data[range]),
                None => user[range].fill(0xFF),
            }
        }

        match content {
            Some(content) => spare.copy_from_slice(&content.spare[..spare.len()]),
            None => spare.fill(0xFF),
        }

        Ok(())
    }

    fn write_page(
        &self,
        chip: u32,
        block: u32,
        page: u32,
        sectors: SectorBitmap,
        user: &[u8],
        spare: &[u8],
    ) -> Result<(), PhysicalError> {
        self.log(SimOp::Write { chip, block, page });
        let index = self.block_index(chip, block, page)?;
        self.check_buffers(user.len(), spare.len())?;

        if self.has_fault(SimFault::Program { chip, block }) {
            return Err(PhysicalError::ProgramFailed { chip, block, page });
        }

        let mut blocks = self.blocks.locked();
        let content = &mut blocks[index];
        if content.pages.is_empty() {
            let pages = self.layout.pages_per_block as usize;
            content.pages = vec![SimPage::erased(&self.layout); pages];
        }
        let content = &mut content.pages[page as usize];

        // Writing fully-erased content is a no-op, so only non-erased sectors count as programs.
        let sectors = SectorBitmap(
            sectors
                .within(self.layout.sectors_per_page)
                .sectors()
                .filter(|&s| !user[s as usize * SECTOR_SIZE..][..SECTOR_SIZE].is_erased())
                .fold(0, |bits, s| bits | 1u64 << s),
        );
        let program_spare = !spare.is_erased();

        if sectors.0 & content.programmed.0 != 0 || (program_spare && content.spare_programmed) {
            return Err(PhysicalError::AlreadyProgrammed { chip, block, page });
        }

        for sector in sectors.sectors() {
            let range = sector as usize * SECTOR_SIZE..(sector as usize + 1) * SECTOR_SIZE;
            content.data[range.clone()].copy_from_slice(&user[range]);
        }
        content.programmed.0 |= sectors.0;

        if program_spare {
            content.spare[..spare.len()].copy_from_slice(spare);
            content.spare_programmed = true;
        }

        Ok(())
    }

    fn is_factory_bad(&self, chip: u32, block: u32) -> bool {
        self.factory_bad.contains(&(chip, block))
    }

    fn is_runtime_bad(&self, chip: u32, block: u32) -> bool {
        self.runtime_bad.read_locked().contains(&(chip, block))
    }

    fn record_runtime_bad(&self, chip: u32, block: u32) {
        self.runtime_bad.write_locked().insert((chip, block));
    }

    fn mark_bad_virtual(&self, chip: u32, block: u32) -> Result<(), PhysicalError> {
        self.log(SimOp::MarkBad { chip, block });
        self.block_index(chip, block, 0)?;

        if self.has_fault(SimFault::Mark { chip, block }) {
            return Err(PhysicalError::MarkFailed { chip, block });
        }

        self.marked_bad.locked().insert((chip, block));
        Ok(())
    }

    fn wait_all_ready(&self) {
        self.log(SimOp::WaitReady);
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    chips: 2,
    blocks_per_chip: 8,
    pages_per_block: 16,
    sectors_per_page: 4,
    spare_bytes: 16,
};

#[test]
fn test_sim_out_of_range() {
    let nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.erase_block(0, 0).is_ok());
    assert!(nand.erase_block(1, 7).is_ok());
    assert!(matches!(
        nand.erase_block(2, 0),
        Err(PhysicalError::OutOfRange { chip: 2, .. })
    ));
    assert!(nand.erase_block(0, 8).is_err());

    let mut page = vec![0; TEST_LAYOUT.bytes_per_page()];
    let full = SectorBitmap::full(4);
    assert!(nand.read_page(0, 0, 16, full, &mut page, &mut []).is_err());
    assert!(matches!(
        nand.read_page(0, 0, 0, full, &mut page[..512], &mut []),
        Err(PhysicalError::BufferSize { .. })
    ));
}

#[test]
fn test_sim_read_write() -> anyhow::Result<()> {
    let nand = SimNand::new(TEST_LAYOUT);
    let full = SectorBitmap::full(4);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page()];
    let spare_in = [0x11u8; 4];
    nand.write_page(1, 3, 2, full, &data_in, &spare_in)?;

    // Pages are program-once until erased
    assert!(matches!(
        nand.write_page(1, 3, 2, full, &data_in, &[]),
        Err(PhysicalError::AlreadyProgrammed { .. })
    ));

    let mut data_out = vec![0; TEST_LAYOUT.bytes_per_page()];
    let mut spare_out = [0u8; 8];
    nand.read_page(1, 3, 2, full, &mut data_out, &mut spare_out)?;
    assert_eq!(data_out, data_in);
    assert_eq!(spare_out[..4], spare_in);
    assert!(spare_out[4..].is_erased());

    nand.read_page(1, 3, 1, full, &mut data_out, &mut spare_out)?;
    assert!(data_out.is_erased());

    // Same coordinates on the other chip are a different block
    nand.read_page(0, 3, 2, full, &mut data_out, &mut [])?;
    assert!(data_out.is_erased());

    nand.erase_block(1, 3)?;
    nand.read_page(1, 3, 2, full, &mut data_out, &mut [])?;
    assert!(data_out.is_erased());
    nand.write_page(1, 3, 2, full, &data_in, &[])?;

    Ok(())
}

#[test]
fn test_sim_partial_page() -> anyhow::Result<()> {
    let nand = SimNand::new(TEST_LAYOUT);

    let mut data_in = vec![0xFFu8; TEST_LAYOUT.bytes_per_page()];
    data_in[..SECTOR_SIZE].fill(0x01);
    data_in[2 * SECTOR_SIZE..3 * SECTOR_SIZE].fill(0x03);
    nand.write_page(0, 0, 0, SectorBitmap(0b0001), &data_in, &[])?;

    // Sector 2 wasn't selected, so it's still programmable
    nand.write_page(0, 0, 0, SectorBitmap(0b0100), &data_in, &[])?;
    assert!(nand
        .write_page(0, 0, 0, SectorBitmap(0b0001), &data_in, &[])
        .is_err());

    let mut data_out = vec![0u8; TEST_LAYOUT.bytes_per_page()];
    nand.read_page(0, 0, 0, SectorBitmap(0b0100), &mut data_out, &mut [])?;
    assert!(data_out[..2 * SECTOR_SIZE].iter().all(|&x| x == 0));
    assert!(data_out[2 * SECTOR_SIZE..3 * SECTOR_SIZE]
        .iter()
        .all(|&x| x == 0x03));
    assert!(data_out[3 * SECTOR_SIZE..].iter().all(|&x| x == 0));

    Ok(())
}

#[test]
fn test_sim_bad_tables() {
    let nand = SimNand::new(TEST_LAYOUT).with_factory_bad(0, 5);
    assert!(nand.is_factory_bad(0, 5));
    assert!(!nand.is_factory_bad(1, 5));
    assert!(!nand.is_runtime_bad(0, 5));

    nand.record_runtime_bad(1, 1);
    assert!(nand.is_runtime_bad(1, 1));
    assert!(!nand.is_factory_bad(1, 1));

    nand.mark_bad_virtual(1, 2).unwrap();
    assert!(nand.is_marked(1, 2));
    // Marking alone doesn't touch the runtime table
    assert!(!nand.is_runtime_bad(1, 2));
}

#[test]
fn test_sim_faults_and_journal() {
    let nand = SimNand::new(TEST_LAYOUT);
    nand.inject(SimFault::Erase { chip: 0, block: 1 });
    nand.inject(SimFault::Mark { chip: 0, block: 1 });

    assert!(matches!(
        nand.erase_block(0, 1),
        Err(PhysicalError::EraseFailed { chip: 0, block: 1 })
    ));
    assert!(nand.erase_block(0, 2).is_ok());
    assert!(nand.mark_bad_virtual(0, 1).is_err());
    assert!(!nand.is_marked(0, 1));
    nand.wait_all_ready();

    assert_eq!(
        nand.journal(),
        [
            SimOp::Erase { chip: 0, block: 1 },
            SimOp::Erase { chip: 0, block: 2 },
            SimOp::MarkBad { chip: 0, block: 1 },
            SimOp::WaitReady,
        ]
    );
    assert_eq!(nand.ready_waits(), 1);

    nand.clear_faults();
    assert!(nand.erase_block(0, 1).is_ok());
}

#[test]
fn test_sim_load_save() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT).with_factory_bad(0, 1);

    // Half an image: the first four blocks get content, the rest stays erased
    let mut image = std::io::repeat(0x55u8).take(4 * TEST_LAYOUT.bytes_per_block() as u64);
    nand.load(&mut image)?;

    let mut page = vec![0u8; TEST_LAYOUT.bytes_per_page()];
    let full = SectorBitmap::full(4);
    nand.read_page(0, 3, 15, full, &mut page, &mut [])?;
    assert!(page.iter().all(|&x| x == 0x55));
    nand.read_page(0, 4, 0, full, &mut page, &mut [])?;
    assert!(page.is_erased());

    // Loaded pages count as programmed
    page.fill(0xAA);
    assert!(nand.write_page(0, 3, 0, full, &page, &[]).is_err());
    assert!(nand.write_page(0, 4, 0, full, &page, &[]).is_ok());

    let mut saved = Vec::new();
    nand.save(&mut saved)?;
    let block_size = TEST_LAYOUT.bytes_per_block();
    assert_eq!(saved.len(), block_size * 16);
    assert!(saved[..block_size].iter().all(|&x| x == 0x55));
    assert!(saved[block_size..][..block_size]
        .iter()
        .all(|&x| x == BAD_BLOCK_FILL));
    assert!(saved[4 * block_size..][..TEST_LAYOUT.bytes_per_page()]
        .iter()
        .all(|&x| x == 0xAA));
    assert!(saved[4 * block_size + TEST_LAYOUT.bytes_per_page()..].is_erased());

    Ok(())
}
