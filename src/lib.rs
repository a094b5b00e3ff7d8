//! Device side of a serial flashing protocol for TI DaVinci/OMAP-L1x class parts, and the
//! boot-time loader that reads back what it wrote.
//!
//! A host pushes images over a serial line; [`protocol::session`] validates them and hands them
//! to a [`target::FlashTarget`] (NAND, NOR, SPI or SD/MMC), which lays them out the way the boot
//! ROM and [`boot`] expect to find them.

pub mod arena;
pub mod boot;
pub mod cli;
pub mod config;
pub mod error;
pub mod magic;
pub mod nand;
pub mod nor;
pub mod protocol;
pub mod sdmmc;
pub mod serial;
pub mod target;
pub mod util;
pub mod validate;

#[cfg(test)]
mod testing;
