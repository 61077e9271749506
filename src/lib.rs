//! Logical partitions over physical NAND flash.
//!
//! A flash translation layer sees a partition as a run of logical blocks. This crate maps those
//! onto (chip, block) coordinates of a [nand::PhysicalNand] device and passes erase, read, write,
//! and bad block operations through to it.

pub mod config;
pub mod diag;
pub mod error;
pub mod logging;
pub mod nand;
pub mod partition;
pub mod util;
