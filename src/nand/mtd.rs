//! Physical NAND implementation over the Linux MTD subsystem

use super::{NandLayout, PageUtil, PhysicalNand, SectorBitmap};
use crate::config::SECTOR_SIZE;
use crate::error::PhysicalError;
use crate::util::RwLockExt;

use anyhow::bail;
use log::{debug, warn};

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;
use std::sync::RwLock;

/// NAND flash that wraps an open /dev/mtdX file.
///
/// MTD presents one flat device, so this always reports a single chip.
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
    runtime_bad: RwLock<HashSet<u32>>,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;
        debug!("opened MTD device: {layout:?}");

        Ok(Self {
            file,
            layout,
            runtime_bad: Default::default(),
        })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if !line.contains(&name) {
                continue;
            }
            if let Some((mtd_dev, _)) = line.split_once(':') {
                return Self::open(Path::new("/dev").join(mtd_dev));
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Compute the /dev/mtdX offset of the first byte of a block
    fn block_base(&self, chip: u32, block: u32) -> Result<u64, PhysicalError> {
        if chip != 0 || block >= self.layout.blocks_per_chip {
            return Err(PhysicalError::OutOfRange {
                chip,
                block,
                page: 0,
            });
        }

        Ok(u64::from(block) * self.layout.bytes_per_block() as u64)
    }

    /// Compute the /dev/mtdX offset of a page, checking the buffers that go with it
    fn page_offset(
        &self,
        chip: u32,
        block: u32,
        page: u32,
        user: usize,
        spare: usize,
    ) -> Result<u64, PhysicalError> {
        if page >= self.layout.pages_per_block {
            return Err(PhysicalError::OutOfRange { chip, block, page });
        }
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

        Ok(self.block_base(chip, block)? + u64::from(page) * self.layout.bytes_per_page() as u64)
    }

    /// Running count of reads that ECC failed to correct on this MTD device
    fn ecc_failures(&self) -> Result<u32, PhysicalError> {
        let stats = unsafe {
            let mut stats = MaybeUninit::<ioctl::mtd_ecc_stats>::uninit();
            ioctl::eccgetstats(self.file.as_raw_fd(), stats.as_mut_ptr())?;
            stats.assume_init()
        };
        Ok(stats.failed)
    }

    /// Read a whole page of user data.
    ///
    /// mtdchar reports uncorrectable ECC errors as a successful read, so they're detected by the
    /// device's failure counter moving. The counter is device-wide: a failed read elsewhere
    /// during this one is reported here too.
    fn read_user(
        &self,
        buf: &mut [u8],
        offset: u64,
        chip: u32,
        block: u32,
        page: u32,
    ) -> Result<(), PhysicalError> {
        let before = self.ecc_failures()?;
        self.file.read_exact_at(buf, offset)?;
        check_ecc(before, self.ecc_failures()?, chip, block, page)
    }
}

/// Compare ECC failure counts taken around a read
fn check_ecc(
    before: u32,
    after: u32,
    chip: u32,
    block: u32,
    page: u32,
) -> Result<(), PhysicalError> {
    if after != before {
        return Err(PhysicalError::Uncorrectable { chip, block, page });
    }
    Ok(())
}

impl PhysicalNand for MtdNand {
    fn layout(&self) -> NandLayout {
        self.layout
    }

    fn erase_block(&self, chip: u32, block: u32) -> Result<(), PhysicalError> {
        let erase_info = ioctl::erase_info_user64 {
            start: self.block_base(chip, block)?,
            length: self.layout.bytes_per_block() as u64,
        };
        unsafe {
            ioctl::memerase64(self.file.as_raw_fd(), &erase_info)?;
        }
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
        let offset = self.page_offset(chip, block, page, user.len(), spare.len())?;
        let sectors = sectors.within(self.layout.sectors_per_page);

        if sectors == SectorBitmap::full(self.layout.sectors_per_page) {
            self.read_user(user, offset, chip, block, page)?;
        } else if !sectors.is_empty() {
            // ECC covers the whole page anyway, so read all of it and keep what was asked for
            let mut buf = vec![0; user.len()];
            self.read_user(&mut buf, offset, chip, block, page)?;
            for sector in sectors.sectors() {
                let range = sector as usize * SECTOR_SIZE..(sector as usize + 1) * SECTOR_SIZE;
                user[range.clone()].copy_from_slice(&buf[range]);
            }
        }

        if !spare.is_empty() {
            let mut oob = ioctl::mtd_oob_buf64 {
                start: offset,
                pad: 0,
                length: spare.len() as u32,
                usr_ptr: spare.as_mut_ptr() as u64,
            };
            unsafe {
                ioctl::memreadoob64(self.file.as_raw_fd(), &mut oob)?;
            }
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
        let offset = self.page_offset(chip, block, page, user.len(), spare.len())?;
        let sectors = sectors.within(self.layout.sectors_per_page);

        if sectors == SectorBitmap::full(self.layout.sectors_per_page) {
            self.file.write_all_at(user, offset)?;
        } else if !sectors.is_empty() {
            // Programming 0xFF leaves cells untouched, so unselected sectors are padded with it
            let mut buf = vec![0xFF; user.len()];
            for sector in sectors.sectors() {
                let range = sector as usize * SECTOR_SIZE..(sector as usize + 1) * SECTOR_SIZE;
                buf[range.clone()].copy_from_slice(&user[range]);
            }
            self.file.write_all_at(&buf, offset)?;
        }

        if !spare.is_erased() {
            let mut oob = ioctl::mtd_oob_buf64 {
                start: offset,
                pad: 0,
                length: spare.len() as u32,
                usr_ptr: spare.as_ptr() as u64,
            };
            unsafe {
                ioctl::memwriteoob64(self.file.as_raw_fd(), &mut oob)?;
            }
        }

        Ok(())
    }

    fn is_factory_bad(&self, chip: u32, block: u32) -> bool {
        let Ok(block_base) = self.block_base(chip, block) else {
            return true;
        };

        match unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base) } {
            Ok(bad) => bad != 0,
            Err(e) => {
                // Can't tell, so don't trust it
                warn!("MEMGETBADBLOCK failed for block {block}: {e}");
                true
            }
        }
    }

    fn is_runtime_bad(&self, _chip: u32, block: u32) -> bool {
        self.runtime_bad.read_locked().contains(&block)
    }

    fn record_runtime_bad(&self, _chip: u32, block: u32) {
        self.runtime_bad.write_locked().insert(block);
    }

    fn mark_bad_virtual(&self, chip: u32, block: u32) -> Result<(), PhysicalError> {
        let block_base = self.block_base(chip, block)?;
        unsafe {
            ioctl::memsetbadblock(self.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }

    fn wait_all_ready(&self) {
        // MTD syscalls only return once the chip is ready again
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::{NandLayout, SectorBitmap, SECTOR_SIZE};

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryFrom<mtd_info_user> for NandLayout {
        type Error = anyhow::Error;

        fn try_from(mut info: mtd_info_user) -> anyhow::Result<NandLayout> {
            if info.writesize == 1 {
                // Hack for debugging on mtdram devices
                info.writesize = SECTOR_SIZE as u32;
            }

            ensure!(info.erasesize > 0, "MTD erasesize is zero");
            ensure!(
                info.size % info.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                info.erasesize % info.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );
            ensure!(
                info.writesize % SECTOR_SIZE as u32 == 0,
                "MTD writesize not multiple of the sector size"
            );

            let sectors_per_page = info.writesize / SECTOR_SIZE as u32;
            ensure!(
                sectors_per_page <= SectorBitmap::MAX_SECTORS,
                "MTD writesize too large"
            );

            Ok(NandLayout {
                chips: 1,
                blocks_per_chip: info.size / info.erasesize,
                pages_per_block: info.erasesize / info.writesize,
                sectors_per_page,
                spare_bytes: info.oobsize,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user64 {
        pub start: u64,
        pub length: u64,
    }
    ioctl_write_ptr!(memerase64, MTD_IOC_MAGIC, 20, erase_info_user64);

    #[repr(C)]
    pub struct mtd_oob_buf64 {
        pub start: u64,
        pub pad: u32,
        pub length: u32,
        pub usr_ptr: u64,
    }
    ioctl_readwrite!(memwriteoob64, MTD_IOC_MAGIC, 21, mtd_oob_buf64);
    ioctl_readwrite!(memreadoob64, MTD_IOC_MAGIC, 22, mtd_oob_buf64);

    #[repr(C)]
    pub struct mtd_ecc_stats {
        pub corrected: u32,
        pub failed: u32,
        pub badblocks: u32,
        pub bbtblocks: u32,
    }
    ioctl_read!(eccgetstats, MTD_IOC_MAGIC, 18, mtd_ecc_stats);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[test]
    fn test_layout_from_info() -> anyhow::Result<()> {
        let info = mtd_info_user {
            r#type: 4,
            flags: 0,
            size: 128 << 20,
            erasesize: 128 << 10,
            writesize: 2048,
            oobsize: 64,
            padding: 0,
        };

        assert_eq!(
            NandLayout::try_from(info)?,
            NandLayout {
                chips: 1,
                blocks_per_chip: 1024,
                pages_per_block: 64,
                sectors_per_page: 4,
                spare_bytes: 64,
            }
        );
        Ok(())
    }

    #[test]
    fn test_layout_from_bad_info() {
        let info = mtd_info_user {
            r#type: 4,
            flags: 0,
            size: 128 << 20,
            erasesize: 3000,
            writesize: 2048,
            oobsize: 64,
            padding: 0,
        };
        assert!(NandLayout::try_from(info).is_err());
    }
}

#[test]
fn test_check_ecc() {
    assert!(check_ecc(3, 3, 0, 7, 2).is_ok());
    assert!(matches!(
        check_ecc(3, 4, 0, 7, 2),
        Err(PhysicalError::Uncorrectable {
            chip: 0,
            block: 7,
            page: 2
        })
    ));

    // The kernel's counter is free to wrap
    assert!(check_ecc(u32::MAX, 0, 0, 7, 2).is_err());
}
