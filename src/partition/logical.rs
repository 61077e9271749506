//! The logical partition manager.

use std::fmt::{self, Write};
use std::sync::Arc;

use log::{debug, error, warn};

use super::{BlockAddress, FlashPartition, PhysicalPartition};
use crate::config::{PARTITION_NAME_PREFIX, SECTOR_SHIFT};
use crate::diag::{self, DiagEvent, Diagnostics};
use crate::error::{CreateError, CreateErrorKind, PhysicalError};
use crate::nand::{PhysicalNand, SectorBitmap};

/// A partition addressed by logical block number.
///
/// All sizing is derived once, at creation, and never changes afterwards.
pub struct LogicalPartition<N: PhysicalNand> {
    geometry: PhysicalPartition<N>,
    name: String,

    sectors_per_page: u32,
    spare_bytes: u32,
    pages_per_block: u32,
    bytes_per_page: u32,
    bytes_per_block: u32,
    full_bitmap: SectorBitmap,

    capacity_sectors: u64,
    capacity_bytes: u64,

    /// Blocks the FTL may use, i.e. without the free block reserve
    total_blocks: u32,
    usable_bytes: u64,

    diag: Arc<dyn Diagnostics>,
}

impl<N: PhysicalNand> LogicalPartition<N> {
    /// Take ownership of a physical partition and build a logical partition on it, reporting
    /// to the process-wide diagnostics sink.
    pub fn create(geometry: PhysicalPartition<N>) -> Result<Self, CreateError<N>> {
        Self::create_with_diagnostics(geometry, diag::process_wide())
    }

    /// Like [LogicalPartition::create], reporting to `diag` instead.
    ///
    /// On failure, no partition exists and the physical partition is handed back in the error.
    pub fn create_with_diagnostics(
        geometry: PhysicalPartition<N>,
        diag: Arc<dyn Diagnostics>,
    ) -> Result<Self, CreateError<N>> {
        let bytes_per_block = match check_geometry(&geometry) {
            Ok(bytes_per_block) => bytes_per_block,
            Err(reason) => {
                error!("partition {}: {reason}", geometry.index);
                return Err(CreateError::new(
                    CreateErrorKind::InvalidGeometry(reason),
                    geometry,
                ));
            }
        };

        let name = match partition_name(geometry.index) {
            Ok(name) => name,
            Err(e) => {
                error!("partition {}: allocation failed", geometry.index);
                return Err(CreateError::new(e.into(), geometry));
            }
        };

        let total_blocks = geometry.total_blocks - geometry.free_blocks;
        let partition = Self {
            name,
            sectors_per_page: geometry.sectors_per_page,
            spare_bytes: geometry.spare_bytes,
            pages_per_block: geometry.pages_per_block,
            bytes_per_page: geometry.sectors_per_page << SECTOR_SHIFT,
            bytes_per_block,
            full_bitmap: geometry.full_bitmap,
            capacity_sectors: geometry.total_sectors,
            capacity_bytes: geometry.total_sectors << SECTOR_SHIFT,
            total_blocks,
            usable_bytes: u64::from(total_blocks) * u64::from(bytes_per_block),
            geometry,
            diag,
        };
        debug!("{}", partition.name);

        Ok(partition)
    }

    /// Release the partition, and the physical partition it owns
    pub fn destroy(self) {
        debug!("destroying {}", self.name);
        self.geometry.destroy();
    }

    /// Convert a logical block number to a physical block, rolling over into following chips
    pub fn translate(&self, block: u32) -> BlockAddress {
        let blocks_per_chip = u64::from(self.geometry.blocks_per_chip);
        let linear = u64::from(self.geometry.start.block) + u64::from(block);

        BlockAddress {
            chip: self
                .geometry
                .start
                .chip
                .saturating_add((linear / blocks_per_chip) as u32),
            block: (linear % blocks_per_chip) as u32,
        }
    }

    pub fn geometry(&self) -> &PhysicalPartition<N> {
        &self.geometry
    }

    pub fn sectors_per_page(&self) -> u32 {
        self.sectors_per_page
    }

    pub fn bytes_per_block(&self) -> u32 {
        self.bytes_per_block
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Bytes in all blocks available to the FTL
    pub fn usable_bytes(&self) -> u64 {
        self.usable_bytes
    }

    fn nand(&self) -> &N {
        self.geometry.device().nand()
    }
}

/// Check the invariants a partition relies on, returning the block size in bytes
fn check_geometry<N>(geometry: &PhysicalPartition<N>) -> Result<u32, &'static str> {
    if geometry.blocks_per_chip == 0 {
        return Err("zero blocks per chip");
    }
    if geometry.start.block >= geometry.blocks_per_chip {
        return Err("start block beyond the end of its chip");
    }
    if geometry.free_blocks > geometry.total_blocks {
        return Err("free block reserve larger than the partition");
    }
    if !(1..=SectorBitmap::MAX_SECTORS).contains(&geometry.sectors_per_page) {
        return Err("unsupported number of sectors per page");
    }

    (geometry.sectors_per_page << SECTOR_SHIFT)
        .checked_mul(geometry.pages_per_block)
        .ok_or("block size overflows")
}

/// "nand_partitionN", allocated without aborting on failure
fn partition_name(index: u32) -> Result<String, std::collections::TryReserveError> {
    let digits = index.checked_ilog10().unwrap_or(0) as usize + 1;

    let mut name = String::new();
    name.try_reserve_exact(PARTITION_NAME_PREFIX.len() + digits)?;
    name.push_str(PARTITION_NAME_PREFIX);
    // Can't fail: the String already has room
    let _ = write!(name, "{index}");

    Ok(name)
}

impl<N: PhysicalNand> FlashPartition for LogicalPartition<N> {
    fn name(&self) -> &str {
        &self.name
    }

    fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    fn pages_per_block(&self) -> u32 {
        self.pages_per_block
    }

    fn bytes_per_page(&self) -> usize {
        self.bytes_per_page as usize
    }

    fn spare_bytes(&self) -> usize {
        self.spare_bytes as usize
    }

    fn full_bitmap(&self) -> SectorBitmap {
        self.full_bitmap
    }

    fn erase(&self, block: u32) -> Result<(), PhysicalError> {
        let addr = self.translate(block);
        self.diag.record(DiagEvent::Erase {
            logical_block: block,
        });

        self.nand().erase_block(addr.chip, addr.block)
    }

    fn read(
        &self,
        block: u32,
        page: u32,
        sectors: SectorBitmap,
        user: &mut [u8],
        spare: &mut [u8],
    ) -> Result<(), PhysicalError> {
        let addr = self.translate(block);

        self.nand()
            .read_page(addr.chip, addr.block, page, sectors, user, spare)
    }

    fn write(
        &self,
        block: u32,
        page: u32,
        sectors: SectorBitmap,
        user: &[u8],
        spare: &[u8],
    ) -> Result<(), PhysicalError> {
        // Programming pages next to one that is still being programmed corrupts both on parts
        // with cross-talk, so everything in flight has to finish first.
        if self.geometry.cross_talk {
            self.nand().wait_all_ready();
        }

        let addr = self.translate(block);
        self.diag.record(DiagEvent::Write {
            logical_block: block,
            physical_block: addr.block,
            page,
        });

        self.nand()
            .write_page(addr.chip, addr.block, page, sectors, user, spare)
    }

    fn is_block_good(&self, block: u32) -> bool {
        let addr = self.translate(block);

        if self.nand().is_factory_bad(addr.chip, addr.block) {
            return false;
        }
        if self.nand().is_runtime_bad(addr.chip, addr.block) {
            return false;
        }

        true
    }

    fn mark_block_bad(&self, block: u32) -> Result<(), PhysicalError> {
        let addr = self.translate(block);

        let ret = self
            .geometry
            .device()
            .mark_bad_serialized(addr.chip, addr.block);
        if let Err(e) = &ret {
            warn!("{}: marking block {block} ({addr}) bad failed: {e}", self.name);
        }

        // Whether or not the mark stuck, the block is never trusted again
        self.nand().record_runtime_bad(addr.chip, addr.block);

        ret
    }
}

impl<N: PhysicalNand> fmt::Debug for LogicalPartition<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalPartition")
            .field("name", &self.name)
            .field("geometry", &self.geometry)
            .field("bytes_per_page", &self.bytes_per_page)
            .field("bytes_per_block", &self.bytes_per_block)
            .field("capacity_sectors", &self.capacity_sectors)
            .field("total_blocks", &self.total_blocks)
            .field("usable_bytes", &self.usable_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test_support {
    use std::sync::Arc;

    use crate::diag::CaptureSink;
    use crate::nand::{NandDevice, NandLayout, SimNand};
    use crate::partition::{BlockAddress, LogicalPartition, PhysicalPartition};

    pub const TEST_LAYOUT: NandLayout = NandLayout {
        chips: 3,
        blocks_per_chip: 1024,
        pages_per_block: 16,
        sectors_per_page: 4,
        spare_bytes: 16,
    };

    pub fn device(nand: SimNand) -> Arc<NandDevice<SimNand>> {
        Arc::new(NandDevice::new(nand))
    }

    /// A partition of 100 blocks starting two blocks before the end of chip 0
    pub fn partition(
        device: &Arc<NandDevice<SimNand>>,
        cross_talk: bool,
    ) -> (LogicalPartition<SimNand>, Arc<CaptureSink>) {
        let sink = Arc::new(CaptureSink::default());
        let geometry =
            PhysicalPartition::new(device.clone(), 0, BlockAddress { chip: 0, block: 1022 }, 100, 0)
                .with_cross_talk(cross_talk);
        let partition = LogicalPartition::create_with_diagnostics(geometry, sink.clone()).unwrap();
        (partition, sink)
    }
}

#[cfg(test)]
use test_support::*;

#[test]
fn test_derived_fields() {
    use crate::nand::{NandDevice, NandLayout, SimNand};

    let device = Arc::new(NandDevice::new(SimNand::new(NandLayout {
        chips: 1,
        blocks_per_chip: 4096,
        pages_per_block: 256,
        sectors_per_page: 32,
        spare_bytes: 64,
    })));
    let geometry = PhysicalPartition::new(device, 3, BlockAddress { chip: 0, block: 8 }, 2000, 48);
    let partition = LogicalPartition::create(geometry).unwrap();

    assert_eq!(partition.name(), "nand_partition3");
    assert_eq!(partition.sectors_per_page(), 32);
    assert_eq!(partition.bytes_per_page(), 512 * 32);
    assert_eq!(partition.bytes_per_block(), 512 * 32 * 256);
    assert_eq!(partition.total_blocks(), 1952);
    assert_eq!(partition.usable_bytes(), 1952 * 512 * 32 * 256);
    assert_eq!(partition.capacity_sectors(), 1952 * 256 * 32);
    assert_eq!(partition.capacity_bytes(), 1952 * 256 * 32 * 512);
    assert_eq!(partition.spare_bytes(), 64);
    assert_eq!(partition.pages_per_block(), 256);
    assert_eq!(partition.full_bitmap(), SectorBitmap(0xFFFF_FFFF));
}

#[test]
fn test_names() {
    assert_eq!(partition_name(0).unwrap(), "nand_partition0");
    assert_eq!(partition_name(3).unwrap(), "nand_partition3");
    assert_eq!(partition_name(9).unwrap(), "nand_partition9");
    assert_eq!(partition_name(10).unwrap(), "nand_partition10");
    assert_eq!(partition_name(123).unwrap(), "nand_partition123");
}

#[test]
fn test_create_failure_returns_geometry() {
    let device = device(crate::nand::SimNand::new(TEST_LAYOUT));

    let origin = BlockAddress { chip: 0, block: 0 };

    let geometry = PhysicalPartition::new(device.clone(), 4, origin, 10, 11);
    let err = LogicalPartition::create(geometry).unwrap_err();
    assert!(matches!(err.kind, CreateErrorKind::InvalidGeometry(_)));

    // The caller still owns the geometry, and with it a share of the device
    assert_eq!(Arc::strong_count(&device), 2);
    let geometry = err.into_geometry();
    assert_eq!(geometry.index, 4);
    assert_eq!(geometry.free_blocks, 11);
    geometry.destroy();
    assert_eq!(Arc::strong_count(&device), 1);

    let mut geometry = PhysicalPartition::new(device.clone(), 0, origin, 10, 0);
    geometry.blocks_per_chip = 0;
    assert!(LogicalPartition::create(geometry).is_err());

    let past_end = BlockAddress {
        chip: 0,
        block: 1024,
    };
    let geometry = PhysicalPartition::new(device.clone(), 0, past_end, 10, 0);
    assert!(LogicalPartition::create(geometry).is_err());
}

#[test]
fn test_destroy_releases_geometry() {
    let device = device(crate::nand::SimNand::new(TEST_LAYOUT));
    let (partition, _) = partition(&device, false);
    assert_eq!(Arc::strong_count(&device), 2);
    partition.destroy();
    assert_eq!(Arc::strong_count(&device), 1);
}

#[test]
fn test_translate() {
    let device = device(crate::nand::SimNand::new(TEST_LAYOUT));
    let (partition, _) = partition(&device, false);

    assert_eq!(partition.translate(0), BlockAddress { chip: 0, block: 1022 });
    assert_eq!(partition.translate(1), BlockAddress { chip: 0, block: 1023 });
    assert_eq!(partition.translate(2), BlockAddress { chip: 1, block: 0 });
    assert_eq!(partition.translate(5), BlockAddress { chip: 1, block: 3 });
    assert_eq!(partition.translate(1026), BlockAddress { chip: 2, block: 0 });
}

#[test]
fn test_translate_matches_rollover() {
    let device = device(crate::nand::SimNand::new(TEST_LAYOUT));
    let geometry = PhysicalPartition::new(device, 0, BlockAddress { chip: 1, block: 700 }, 1000, 0);
    let partition = LogicalPartition::create(geometry).unwrap();

    for block in (0..5000).chain([1 << 20, u32::MAX]) {
        let linear = u64::from(block) + 700;
        let addr = partition.translate(block);

        assert!(addr.block < 1024);
        assert_eq!(u64::from(addr.chip - 1), linear / 1024);
        assert_eq!(u64::from(addr.block), linear % 1024);
    }

    // And the literal loop, for small offsets
    for block in 0..3000u32 {
        let mut chip = 1;
        let mut physical = 700 + block;
        while physical >= 1024 {
            chip += 1;
            physical -= 1024;
        }
        assert_eq!(
            partition.translate(block),
            BlockAddress {
                chip,
                block: physical
            }
        );
    }
}

#[test]
fn test_erase() {
    use crate::nand::{SimFault, SimNand, SimOp};

    let device = device(SimNand::new(TEST_LAYOUT));
    let (partition, sink) = partition(&device, false);

    partition.erase(5).unwrap();
    assert_eq!(device.nand().journal(), [SimOp::Erase { chip: 1, block: 3 }]);
    assert_eq!(sink.events(), [DiagEvent::Erase { logical_block: 5 }]);

    // Failures come back unmodified, and aren't retried
    device.nand().clear_journal();
    device.nand().inject(SimFault::Erase { chip: 1, block: 3 });
    assert!(matches!(
        partition.erase(5),
        Err(PhysicalError::EraseFailed { chip: 1, block: 3 })
    ));
    assert_eq!(device.nand().journal(), [SimOp::Erase { chip: 1, block: 3 }]);
}

#[test]
fn test_read_write() -> anyhow::Result<()> {
    use crate::nand::{PageUtil, SimNand, SimOp};

    let device = device(SimNand::new(TEST_LAYOUT));
    let (partition, sink) = partition(&device, false);

    let data_in = (0..partition.bytes_per_page())
        .map(|x| x as u8)
        .collect::<Vec<_>>();
    let spare_in = [0x42u8; 8];
    partition.write(5, 7, partition.full_bitmap(), &data_in, &spare_in)?;

    let mut data_out = vec![0; partition.bytes_per_page()];
    let mut spare_out = [0u8; 8];
    partition.read(5, 7, partition.full_bitmap(), &mut data_out, &mut spare_out)?;
    assert_eq!(data_out, data_in);
    assert_eq!(spare_out, spare_in);

    // The data really went to the translated block
    device
        .nand()
        .read_page(1, 3, 7, partition.full_bitmap(), &mut data_out, &mut [])?;
    assert_eq!(data_out, data_in);
    partition.read(4, 7, partition.full_bitmap(), &mut data_out, &mut [])?;
    assert!(data_out.is_erased());

    assert_eq!(
        device.nand().journal()[..2],
        [
            SimOp::Write {
                chip: 1,
                block: 3,
                page: 7
            },
            SimOp::Read {
                chip: 1,
                block: 3,
                page: 7
            },
        ]
    );
    assert_eq!(
        sink.events(),
        [DiagEvent::Write {
            logical_block: 5,
            physical_block: 3,
            page: 7
        }]
    );

    // Rewriting a programmed page is the physical layer's error to report
    assert!(matches!(
        partition.write(5, 7, partition.full_bitmap(), &data_in, &[]),
        Err(PhysicalError::AlreadyProgrammed { .. })
    ));
    Ok(())
}

#[test]
fn test_partial_read() -> anyhow::Result<()> {
    use crate::nand::SimNand;

    let device = device(SimNand::new(TEST_LAYOUT));
    let (partition, _) = partition(&device, false);

    let data_in = vec![0x5Au8; partition.bytes_per_page()];
    partition.write(0, 0, partition.full_bitmap(), &data_in, &[])?;

    let mut data_out = vec![0u8; partition.bytes_per_page()];
    partition.read(0, 0, SectorBitmap(0b0010), &mut data_out, &mut [])?;
    assert!(data_out[..512].iter().all(|&x| x == 0));
    assert!(data_out[512..1024].iter().all(|&x| x == 0x5A));
    assert!(data_out[1024..].iter().all(|&x| x == 0));
    Ok(())
}

#[test]
fn test_write_cross_talk_barrier() -> anyhow::Result<()> {
    use crate::nand::{SimNand, SimOp};

    let device = device(SimNand::new(TEST_LAYOUT));
    let (partition, _) = partition(&device, true);
    let data = vec![0u8; partition.bytes_per_page()];

    for block in [0, 1, 2, 5, 99] {
        device.nand().clear_journal();
        partition.write(block, 3, partition.full_bitmap(), &data, &[])?;

        let addr = partition.translate(block);
        assert_eq!(
            device.nand().journal(),
            [
                SimOp::WaitReady,
                SimOp::Write {
                    chip: addr.chip,
                    block: addr.block,
                    page: 3
                },
            ]
        );
    }

    // Other operations never wait
    device.nand().clear_journal();
    partition.erase(0)?;
    let mut page = vec![0; partition.bytes_per_page()];
    partition.read(0, 3, partition.full_bitmap(), &mut page, &mut [])?;
    partition.mark_block_bad(1)?;
    assert_eq!(device.nand().ready_waits(), 0);
    Ok(())
}

#[test]
fn test_write_without_cross_talk() -> anyhow::Result<()> {
    use crate::nand::SimNand;

    let device = device(SimNand::new(TEST_LAYOUT));
    let (partition, _) = partition(&device, false);
    let data = vec![0u8; partition.bytes_per_page()];

    partition.write(0, 0, partition.full_bitmap(), &data, &[])?;
    partition.write(0, 1, partition.full_bitmap(), &data, &[])?;
    assert_eq!(device.nand().ready_waits(), 0);
    Ok(())
}

#[test]
fn test_is_block_good() {
    use crate::nand::SimNand;

    // Logical blocks 0..4 live at 0:1022, 0:1023, 1:0, 1:1
    let nand = SimNand::new(TEST_LAYOUT)
        .with_factory_bad(0, 1022)
        .with_factory_bad(1, 0);
    let device = device(nand);
    let (partition, _) = partition(&device, false);
    device.nand().record_runtime_bad(0, 1023);
    device.nand().record_runtime_bad(1, 0);

    // factory only, runtime only, both, neither
    assert!(!partition.is_block_good(0));
    assert!(!partition.is_block_good(1));
    assert!(!partition.is_block_good(2));
    assert!(partition.is_block_good(3));

    // Querying never marks anything
    assert!(device.nand().journal().is_empty());
}

#[test]
fn test_mark_block_bad() {
    use crate::nand::{SimFault, SimNand};

    let device = device(SimNand::new(TEST_LAYOUT));
    let (partition, _) = partition(&device, false);

    assert!(partition.is_block_good(4));
    partition.mark_block_bad(4).unwrap();
    assert!(!partition.is_block_good(4));
    assert!(device.nand().is_marked(1, 2));
    assert!(device.nand().is_runtime_bad(1, 2));

    // A failed mark still poisons the block
    device.nand().inject(SimFault::Mark { chip: 1, block: 4 });
    assert!(partition.is_block_good(6));
    assert!(matches!(
        partition.mark_block_bad(6),
        Err(PhysicalError::MarkFailed { chip: 1, block: 4 })
    ));
    assert!(!device.nand().is_marked(1, 4));
    assert!(!partition.is_block_good(6));

    assert!(partition.is_block_good(5));
}

#[test]
fn test_mark_from_many_partitions() -> anyhow::Result<()> {
    use crate::config::PartitionTable;
    use crate::nand::SimNand;
    use crate::partition::build_physical_partitions;

    let device = device(SimNand::new(TEST_LAYOUT));
    let table: PartitionTable = "1000:10,1000:10,1000:10".parse()?;
    let partitions = build_physical_partitions(&device, &table, 0)?
        .into_iter()
        .map(|geometry| LogicalPartition::create(geometry).map_err(|e| anyhow::anyhow!("{e}")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    std::thread::scope(|scope| {
        for partition in &partitions {
            for first in 0..4 {
                scope.spawn(move || {
                    for block in (first..partition.total_blocks()).step_by(4 * 7) {
                        partition.mark_block_bad(block).unwrap();
                    }
                });
            }
        }
    });

    for partition in &partitions {
        for block in 0..partition.total_blocks() {
            let marked = block % (4 * 7) < 4;
            assert_eq!(partition.is_block_good(block), !marked);
        }
    }

    partitions.into_iter().for_each(LogicalPartition::destroy);
    assert_eq!(Arc::strong_count(&device), 1);
    Ok(())
}

#[test]
fn test_marks_never_overlap() -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Weak;
    use std::time::Duration;

    use crate::config::PartitionTable;
    use crate::nand::{NandDevice, NandLayout, SimNand};
    use crate::partition::build_physical_partitions;

    /// Wraps a SimNand, watching how marks and runtime records line up with the marking lock
    #[derive(Debug)]
    struct MarkWatch {
        inner: SimNand,
        device: Weak<NandDevice<MarkWatch>>,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
        check_release: AtomicBool,
        recorded_while_locked: AtomicBool,
    }

    impl PhysicalNand for MarkWatch {
        fn layout(&self) -> NandLayout {
            self.inner.layout()
        }

        fn erase_block(&self, chip: u32, block: u32) -> Result<(), PhysicalError> {
            self.inner.erase_block(chip, block)
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
            self.inner.read_page(chip, block, page, sectors, user, spare)
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
            self.inner.write_page(chip, block, page, sectors, user, spare)
        }

        fn is_factory_bad(&self, chip: u32, block: u32) -> bool {
            self.inner.is_factory_bad(chip, block)
        }

        fn is_runtime_bad(&self, chip: u32, block: u32) -> bool {
            self.inner.is_runtime_bad(chip, block)
        }

        fn record_runtime_bad(&self, chip: u32, block: u32) {
            if self.check_release.load(Ordering::SeqCst) {
                let locked = self.device.upgrade().is_some_and(|d| d.is_marking());
                self.recorded_while_locked.fetch_or(locked, Ordering::SeqCst);
            }
            self.inner.record_runtime_bad(chip, block);
        }

        fn mark_bad_virtual(&self, chip: u32, block: u32) -> Result<(), PhysicalError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            let result = self.inner.mark_bad_virtual(chip, block);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn wait_all_ready(&self) {
            self.inner.wait_all_ready();
        }
    }

    let device = Arc::new_cyclic(|device| {
        NandDevice::new(MarkWatch {
            inner: SimNand::new(TEST_LAYOUT),
            device: device.clone(),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            check_release: AtomicBool::new(false),
            recorded_while_locked: AtomicBool::new(false),
        })
    });
    let table: PartitionTable = "1000:10,1000:10,1000:10".parse()?;
    let partitions = build_physical_partitions(&device, &table, 0)?
        .into_iter()
        .map(|geometry| LogicalPartition::create(geometry).map_err(|e| anyhow::anyhow!("{e}")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    std::thread::scope(|scope| {
        for partition in &partitions {
            for first in 0..4 {
                scope.spawn(move || {
                    for block in (first..64).step_by(4) {
                        partition.mark_block_bad(block).unwrap();
                    }
                });
            }
        }
    });
    assert_eq!(device.nand().max_in_flight.load(Ordering::SeqCst), 1);

    // With no other marker running, the lock must be free by the time the block is recorded
    device.nand().check_release.store(true, Ordering::SeqCst);
    partitions[1].mark_block_bad(100)?;
    assert!(!partitions[1].is_block_good(100));
    assert!(!device.nand().recorded_while_locked.load(Ordering::SeqCst));

    partitions.into_iter().for_each(LogicalPartition::destroy);
    Ok(())
}
