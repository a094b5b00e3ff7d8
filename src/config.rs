//! Compile-time platform constants, turned into a runtime value so the binaries (and tests) can
//! pick them.

use std::ops::RangeInclusive;
use std::str::FromStr;

/// How the ROM boot loader expects to find the secondary loader
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum BootConvention {
    /// Loader and application images carry per-backend headers, and image bounds are checked
    #[default]
    Davinci,

    /// The ROM consumes a self-describing boot script; no headers, no bounds checks
    Ais,
}

impl FromStr for BootConvention {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "davinci" => Ok(BootConvention::Davinci),
            "ais" => Ok(BootConvention::Ais),
            _ => anyhow::bail!("unknown boot convention `{s}` (expected davinci or ais)"),
        }
    }
}

/// The RAM layout that bounds what may be received
#[derive(Debug, Copy, Clone)]
pub struct MemoryMap {
    pub internal_ram_size: u32,
    pub stack_size: u32,
    pub external_ram_start: u32,
    pub external_ram_size: u32,
}

impl MemoryMap {
    /// Largest loader image that fits the internal RAM
    pub fn loader_image_size(&self) -> u32 {
        self.internal_ram_size.saturating_sub(self.stack_size)
    }

    /// Largest application image accepted
    pub fn app_image_size(&self) -> u32 {
        self.external_ram_size >> 3
    }
}

/// Block ranges searched (and written) on NAND, inclusive on both ends
#[derive(Debug, Clone)]
pub struct NandRanges {
    /// Where the ROM looks for the loader
    pub loader: RangeInclusive<u32>,

    /// Where the loader looks for the application
    pub application: RangeInclusive<u32>,

    /// Secondary-core variant: the ARM loader
    pub arm_loader: RangeInclusive<u32>,

    /// Secondary-core variant: the application (U-Boot)
    pub uboot: RangeInclusive<u32>,

    /// First block of header-less images
    pub raw_start: u32,

    /// How many redundant copies of each headed image to place
    pub copies: u32,
}

/// Byte offsets used by the secondary-core variant on SPI memory
#[derive(Debug, Copy, Clone)]
pub struct SpiOffsets {
    pub arm_loader: u32,
    pub application: u32,
}

/// Placement of boot headers on SD/MMC cards
#[derive(Debug, Clone)]
pub struct SdmmcConfig {
    /// Block holding the loader header (written by the flasher)
    pub loader_block: u32,

    /// Block holding the application header (written by the flasher)
    pub application_block: u32,

    /// Blocks scanned by the boot loader
    pub search: RangeInclusive<u32>,

    /// Whole-sequence scan attempts before giving up
    pub max_attempts: usize,
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub convention: BootConvention,
    pub memory: MemoryMap,
    pub nand: NandRanges,
    pub spi: SpiOffsets,
    pub sdmmc: SdmmcConfig,

    /// Write chunk size for NOR/SPI, one progress token per chunk
    pub write_chunk: usize,

    /// Erase chunk size for the erase command
    pub erase_chunk: usize,

    /// Size of the receive arena
    pub arena_size: usize,

    /// Whether the session waits for the host's start token before announcing itself
    pub wait_for_start: bool,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            convention: BootConvention::Davinci,
            memory: MemoryMap {
                internal_ram_size: 0x8000,
                stack_size: 0x800,
                external_ram_start: 0x8000_0000,
                external_ram_size: 0x0800_0000,
            },
            nand: NandRanges {
                loader: 1..=24,
                application: 25..=50,
                arm_loader: 6..=24,
                uboot: 25..=50,
                raw_start: 1,
                copies: 1,
            },
            spi: SpiOffsets {
                arm_loader: 0x2000,
                application: 0x8000,
            },
            sdmmc: SdmmcConfig {
                loader_block: 1,
                application_block: 0x100,
                search: 1..=0x200,
                max_attempts: 2,
            },
            write_chunk: 4096,
            erase_chunk: 0x20000,
            arena_size: 64 << 20,
            wait_for_start: true,
        }
    }
}

#[test]
fn test_memory_bounds() {
    let config = PlatformConfig::default();
    assert_eq!(config.memory.loader_image_size(), 0x7800);
    assert_eq!(config.memory.app_image_size(), 0x0100_0000);
}

#[test]
fn test_convention_parse() {
    assert_eq!("AIS".parse::<BootConvention>().unwrap(), BootConvention::Ais);
    assert_eq!(
        "davinci".parse::<BootConvention>().unwrap(),
        BootConvention::Davinci
    );
    assert!("omap".parse::<BootConvention>().is_err());
}
