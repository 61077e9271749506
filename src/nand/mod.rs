//! Abstractions for the physical NAND layer that partitions are built on

use std::str::FromStr;
use std::sync::Mutex;

use anyhow::ensure;

use crate::config::{DEFAULT_SPARE_BYTES, SECTOR_SIZE};
use crate::error::PhysicalError;
use crate::util::LockExt;

#[cfg(target_os = "linux")]
pub mod mtd;
mod sim;

pub use sim::{SimFault, SimNand, SimOp};

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the geometry of a whole NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub chips: u32,
    pub blocks_per_chip: u32,
    pub pages_per_block: u32,
    pub sectors_per_page: u32,
    pub spare_bytes: u32,
}

impl NandLayout {
    pub fn bytes_per_page(&self) -> usize {
        self.sectors_per_page as usize * SECTOR_SIZE
    }

    pub fn bytes_per_block(&self) -> usize {
        self.bytes_per_page() * self.pages_per_block as usize
    }

    /// Blocks across all chips
    pub fn total_blocks(&self) -> u64 {
        u64::from(self.chips) * u64::from(self.blocks_per_chip)
    }
}

/// Parse strings like "CHIPSxBLOCKSxPAGESxSECTORS", optionally followed by "xSPARE"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let fields = s.split('x').collect::<Vec<_>>();
        let (chips, blocks_per_chip, pages_per_block, sectors_per_page, spare) = match fields[..] {
            [c, b, p, s] => (c, b, p, s, None),
            [c, b, p, s, o] => (c, b, p, s, Some(o)),
            _ => anyhow::bail!("expected #x#x#x#[x#]"),
        };

        let layout = NandLayout {
            chips: chips.parse()?,
            blocks_per_chip: blocks_per_chip.parse()?,
            pages_per_block: pages_per_block.parse()?,
            sectors_per_page: sectors_per_page.parse()?,
            spare_bytes: spare.map_or(Ok(DEFAULT_SPARE_BYTES), str::parse)?,
        };

        ensure!(layout.chips > 0, "need at least one chip");
        ensure!(layout.blocks_per_chip > 0, "need at least one block per chip");
        ensure!(layout.pages_per_block > 0, "need at least one page per block");
        ensure!(
            (1..=SectorBitmap::MAX_SECTORS).contains(&layout.sectors_per_page),
            "sectors per page must be between 1 and {}",
            SectorBitmap::MAX_SECTORS
        );

        Ok(layout)
    }
}

/// Selects which 512-byte sectors of a page take part in a transfer; bit `i` is sector `i`
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SectorBitmap(pub u64);

impl SectorBitmap {
    pub const MAX_SECTORS: u32 = u64::BITS;

    /// The mask meaning "every sector in the page"
    pub const fn full(sectors_per_page: u32) -> Self {
        if sectors_per_page >= Self::MAX_SECTORS {
            Self(u64::MAX)
        } else {
            Self((1u64 << sectors_per_page) - 1)
        }
    }

    pub fn contains(self, sector: u32) -> bool {
        sector < Self::MAX_SECTORS && self.0 & (1u64 << sector) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Clip to the sectors that exist in a page
    pub fn within(self, sectors_per_page: u32) -> Self {
        Self(self.0 & Self::full(sectors_per_page).0)
    }

    /// Iterate over the selected sector indices, in ascending order
    pub fn sectors(self) -> impl Iterator<Item = u32> {
        (0..Self::MAX_SECTORS).filter(move |&s| self.contains(s))
    }
}

/// The primitives a physical NAND device provides, addressed by absolute (chip, block).
///
/// Every method takes `&self`: one device is shared by all partitions laid out on it.
///
/// Page buffers are always a full page (`sectors_per_page * 512` bytes), sector `i` living at
/// byte `i * 512`; only sectors selected by the bitmap are transferred. Spare buffers may be
/// shorter than the spare area, and an empty spare buffer transfers nothing.
pub trait PhysicalNand {
    /// Get the geometry of the device
    fn layout(&self) -> NandLayout;

    /// Erase a block, making all of its pages writable again
    fn erase_block(&self, chip: u32, block: u32) -> Result<(), PhysicalError>;

    /// Read the selected sectors of one page, plus its spare bytes
    fn read_page(
        &self,
        chip: u32,
        block: u32,
        page: u32,
        sectors: SectorBitmap,
        user: &mut [u8],
        spare: &mut [u8],
    ) -> Result<(), PhysicalError>;

    /// Program the selected sectors of one page, plus its spare bytes
    fn write_page(
        &self,
        chip: u32,
        block: u32,
        page: u32,
        sectors: SectorBitmap,
        user: &[u8],
        spare: &[u8],
    ) -> Result<(), PhysicalError>;

    /// Was this block marked unusable at manufacture time?
    fn is_factory_bad(&self, chip: u32, block: u32) -> bool;

    /// Has this block failed during the life of the device?
    fn is_runtime_bad(&self, chip: u32, block: u32) -> bool;

    /// Add a block to the runtime-acquired bad block table
    fn record_runtime_bad(&self, chip: u32, block: u32);

    /// Mark a block bad in the device's bad block table (not an in-band marker page)
    fn mark_bad_virtual(&self, chip: u32, block: u32) -> Result<(), PhysicalError>;

    /// Block until every in-flight operation on every chip has completed
    fn wait_all_ready(&self);
}

/// One physical NAND device, shared by every partition laid out on it.
///
/// Owns the device-wide lock that serializes bad block marking across partitions.
#[derive(Debug)]
pub struct NandDevice<N> {
    nand: N,
    mark_lock: Mutex<()>,
}

impl<N: PhysicalNand> NandDevice<N> {
    pub fn new(nand: N) -> Self {
        Self {
            nand,
            mark_lock: Mutex::new(()),
        }
    }

    /// The underlying physical primitives
    pub fn nand(&self) -> &N {
        &self.nand
    }

    pub fn layout(&self) -> NandLayout {
        self.nand.layout()
    }

    /// Invoke the bad block marking primitive while holding the device-wide marking lock
    pub fn mark_bad_serialized(&self, chip: u32, block: u32) -> Result<(), PhysicalError> {
        let _guard = self.mark_lock.locked();
        self.nand.mark_bad_virtual(chip, block)
    }

    /// Is some thread inside [Self::mark_bad_serialized] right now?
    #[cfg(test)]
    pub(crate) fn is_marking(&self) -> bool {
        self.mark_lock.try_lock().is_err()
    }

    pub fn into_inner(self) -> N {
        self.nand
    }
}

#[test]
fn test_parse_layout() -> anyhow::Result<()> {
    let layout: NandLayout = "2x1024x64x4".parse()?;
    assert_eq!(
        layout,
        NandLayout {
            chips: 2,
            blocks_per_chip: 1024,
            pages_per_block: 64,
            sectors_per_page: 4,
            spare_bytes: DEFAULT_SPARE_BYTES,
        }
    );
    assert_eq!(layout.bytes_per_page(), 2048);
    assert_eq!(layout.bytes_per_block(), 2048 * 64);
    assert_eq!(layout.total_blocks(), 2048);

    let layout: NandLayout = "1x8x16x8x64".parse()?;
    assert_eq!(layout.spare_bytes, 64);

    assert!("1x8x16".parse::<NandLayout>().is_err());
    assert!("1x0x16x4".parse::<NandLayout>().is_err());
    assert!("1x8x16x65".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_sector_bitmap() {
    assert_eq!(SectorBitmap::full(4), SectorBitmap(0b1111));
    assert_eq!(SectorBitmap::full(64), SectorBitmap(u64::MAX));

    let bitmap = SectorBitmap(0b1010_0101);
    assert!(bitmap.contains(0));
    assert!(!bitmap.contains(1));
    assert!(!bitmap.contains(64));
    assert_eq!(bitmap.sectors().collect::<Vec<_>>(), [0, 2, 5, 7]);
    assert_eq!(bitmap.within(4), SectorBitmap(0b0101));
    assert!(SectorBitmap::default().is_empty());
}
