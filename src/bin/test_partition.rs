//! A test program for the partition layer.
//!
//! This is not a unit test because it's meant to be pointed at a real MTD device, or at a saved
//! simulated NAND image, and driven interactively.

use anyhow::{anyhow, bail, ensure, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{info, warn};

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(target_os = "linux")]
use nand_partition::nand::mtd::MtdNand;
use nand_partition::{
    config::PartitionTable,
    diag, logging,
    nand::{NandDevice, NandLayout, PhysicalNand, SimNand},
    partition::{build_physical_partitions, scan_bad_blocks, FlashPartition, LogicalPartition},
};

#[derive(Args, Debug)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long)]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long)]
    mtd_dev: Option<PathBuf>,

    /// Path to the NAND image to use
    #[clap(long, requires = "sim_layout")]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, as CHIPSxBLOCKSxPAGESxSECTORS[xSPARE]
    #[clap(long)]
    sim_layout: Option<NandLayout>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        if let Some(layout) = self.sim_layout {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            return Ok(NandImpl::Sim(sim));
        }

        #[cfg(target_os = "linux")]
        {
            if let Some(name) = &self.mtd_name {
                return Ok(NandImpl::Mtd(MtdNand::open_named(name)?));
            } else if let Some(dev) = &self.mtd_dev {
                return Ok(NandImpl::Mtd(MtdNand::open(dev)?));
            }
        }

        bail!("no NAND given");
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let (Some(path), NandImpl::Sim(sim)) = (&self.sim_path, nand) {
                sim.save(&mut File::create(path)?)?;
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

#[derive(Args, Debug)]
struct PartitionOptions {
    /// Partition table, as BLOCKS:FREE,BLOCKS:FREE,...
    #[clap(long)]
    partitions: PartitionTable,

    /// Device block (counted across chips) where the first partition begins
    #[clap(long, default_value_t = 0)]
    first_block: u64,

    /// Wait for the whole device to go idle before every write
    #[clap(long)]
    cross_talk: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the geometry of every partition
    Info,

    /// List the bad blocks of a partition; this is a read-only operation
    Scan { partition: usize },

    /// Show which physical block a logical block maps to
    Translate { partition: usize, block: u32 },

    /// Erase one logical block
    Erase { partition: usize, block: u32 },

    /// Mark one logical block bad
    MarkBad { partition: usize, block: u32 },

    /// Erase, program, and read back every page of the first few good blocks of a partition
    Exercise {
        partition: usize,

        /// How many good blocks to exercise
        #[clap(long, default_value_t = 4)]
        blocks: u32,
    },
}

impl Command {
    fn execute<N: PhysicalNand>(self, partitions: &[LogicalPartition<N>]) -> Result<()> {
        let get = |index: usize| {
            partitions
                .get(index)
                .ok_or_else(|| anyhow!("there is no partition {index}"))
        };

        match self {
            Command::Info => {
                for partition in partitions {
                    let geometry = partition.geometry();
                    println!(
                        "{}: start {}, {} blocks ({} reserved), {} B/page, {} pages/block, \
                         {} B spare, capacity {} sectors, usable {} bytes",
                        partition.name(),
                        geometry.start,
                        partition.total_blocks(),
                        geometry.free_blocks,
                        partition.bytes_per_page(),
                        partition.pages_per_block(),
                        partition.spare_bytes(),
                        partition.capacity_sectors(),
                        partition.usable_bytes(),
                    );
                }
            }

            Command::Scan { partition } => {
                let bad = scan_bad_blocks(get(partition)?);
                println!("Bad: {bad:?}");
            }

            Command::Translate { partition, block } => {
                println!("{block} => {}", get(partition)?.translate(block));
            }

            Command::Erase { partition, block } => {
                get(partition)?.erase(block)?;
            }

            Command::MarkBad { partition, block } => {
                get(partition)?.mark_block_bad(block)?;
            }

            Command::Exercise { partition, blocks } => {
                exercise(get(partition)?, blocks)?;
            }
        };

        Ok(())
    }
}

/// Cycle `blocks` good blocks through erase/program/verify, marking any that fail to erase
fn exercise<P: FlashPartition>(partition: &P, blocks: u32) -> Result<()> {
    let rpt = howudoin::new()
        .label(format!("Exercising {}", partition.name()))
        .set_len(u64::from(blocks));

    let full = partition.full_bitmap();
    let mut page_buf = vec![0; partition.bytes_per_page()];
    let mut read_buf = vec![0; partition.bytes_per_page()];

    let mut done = 0;
    for block in 0..partition.total_blocks() {
        if done == blocks {
            break;
        }
        if !partition.is_block_good(block) {
            continue;
        }

        if let Err(e) = partition.erase(block) {
            warn!("erasing block {block} failed ({e}), marking it bad");
            if let Err(e) = partition.mark_block_bad(block) {
                warn!("marking block {block} bad failed: {e}");
            }
            continue;
        }

        for page in 0..partition.pages_per_block() {
            // Never all-0xFF, so every page really gets programmed
            page_buf.fill((block.wrapping_mul(31).wrapping_add(page) & 0x7F) as u8);
            partition.write(block, page, full, &page_buf, &[])?;
            partition.read(block, page, full, &mut read_buf, &mut [])?;
            ensure!(read_buf == page_buf, "block {block} page {page} read back wrong");
        }

        partition.erase(block)?;
        done += 1;
        rpt.inc();
    }

    rpt.close();
    ensure!(done == blocks, "only found {done} usable blocks");
    info!("{}: exercised {done} blocks", partition.name());

    Ok(())
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// How to partition it
    #[clap(flatten)]
    parts: PartitionOptions,

    /// Log more (repeatable)
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// The command to run against the partitions
    #[clap(subcommand)]
    cmd: Command,
}

/// Partition the NAND, run the command, and tear everything down again
fn run<N: PhysicalNand>(nand: N, parts: &PartitionOptions, cmd: Command) -> Result<N> {
    let device = Arc::new(NandDevice::new(nand));

    let partitions = build_physical_partitions(&device, &parts.partitions, parts.first_block)?
        .into_iter()
        .map(|geometry| {
            LogicalPartition::create(geometry.with_cross_talk(parts.cross_talk))
                .map_err(|e| anyhow!("{e}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let result = cmd.execute(&partitions);
    info!("last operations: {:?}", diag::process_wide().snapshot());
    partitions.into_iter().for_each(LogicalPartition::destroy);
    result?;

    let device = Arc::try_unwrap(device).map_err(|_| anyhow!("NAND device still in use"))?;
    Ok(device.into_inner())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    logging::init(logging::level_for(args.verbose))?;
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = match args.nand.open()? {
        NandImpl::Sim(nand) => NandImpl::Sim(run(nand, &args.parts, args.cmd)?),

        #[cfg(target_os = "linux")]
        NandImpl::Mtd(nand) => NandImpl::Mtd(run(nand, &args.parts, args.cmd)?),
    };
    args.nand.cleanup(nand)?;

    Ok(())
}
