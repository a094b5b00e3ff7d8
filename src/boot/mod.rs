//! The read path: find a previously flashed image, copy it into RAM, and report where to jump.
//!
//! Control transfer itself is left to the caller; everything here ends with a [`BootImage`].

use std::ops::RangeInclusive;

use log::{debug, info, warn};
use retry::{delay::NoDelay, retry};

use crate::config::{MemoryMap, SdmmcConfig};
use crate::error::{Error, Result};
use crate::magic::{is_loader_family, BINARY_BOOT};
use crate::nand::{header::NandBootHeader, read_chain, Nand, NandBlock};
use crate::nor::{header::NorBootHeader, NorFlash};
use crate::sdmmc::{BlockDevice, SdBootHeader, BLOCK_SIZE};

/// Memory that images can be loaded into
pub trait Ram {
    /// Borrow `len` bytes starting at bus address `address`
    fn region(&mut self, address: u32, len: usize) -> anyhow::Result<&mut [u8]>;
}

/// A window of RAM starting at a fixed bus address
#[derive(Debug, Clone)]
pub struct RamWindow {
    base: u32,
    mem: Vec<u8>,
}

impl RamWindow {
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            mem: vec![0; size],
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mem
    }
}

impl Ram for RamWindow {
    fn region(&mut self, address: u32, len: usize) -> anyhow::Result<&mut [u8]> {
        let offset = address
            .checked_sub(self.base)
            .ok_or(anyhow::anyhow!("address {address:#010x} below RAM window"))?
            as usize;
        self.mem
            .get_mut(offset..offset.saturating_add(len))
            .ok_or(anyhow::anyhow!(
                "{len:#x} bytes at {address:#010x} exceed RAM window"
            ))
    }
}

/// What was loaded, and where to go next
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootImage {
    pub magic: u32,
    pub entry_point: u32,
    pub load_address: u32,
    pub size: usize,
}

/// Load the application that follows the loader on NOR.
///
/// The header sits at the start of the block after the one holding the end of the loader.
pub fn boot_from_nor<F: NorFlash, R: Ram>(
    flash: &mut F,
    memory: &MemoryMap,
    ram: &mut R,
) -> Result<BootImage> {
    let geometry = flash.geometry();
    let (block, block_size) = geometry
        .block_containing(memory.loader_image_size())
        .ok_or(Error::StorageNotFound)?;
    let offset = block + block_size;

    let mut bytes = [0u8; NorBootHeader::SIZE];
    flash.read(offset, &mut bytes)?;
    let header = NorBootHeader::decode(&bytes).ok_or(Error::StorageNotFound)?;
    if header.magic != BINARY_BOOT {
        warn!("no application header at {offset:#x} (magic {:#010x})", header.magic);
        return Err(Error::StorageNotFound);
    }

    let size = header.app_size as usize;
    info!(
        "copying {size:#x} bytes from NOR {:#x} to {:#010x}",
        offset as usize + NorBootHeader::SIZE,
        header.load_address
    );
    let dest = ram.region(header.load_address, size)?;
    flash.read(offset + NorBootHeader::SIZE as u32, dest)?;

    Ok(BootImage {
        magic: header.magic,
        entry_point: header.entry_point,
        load_address: header.load_address,
        size,
    })
}

/// One pass over the SD search window. Unreadable blocks are skipped; an image whose data cannot
/// be read, or does not fit the RAM window, resumes the scan after its header.
fn scan_card<D: BlockDevice, R: Ram>(
    card: &mut D,
    search: &RangeInclusive<u32>,
    ram: &mut R,
) -> Result<BootImage> {
    let mut block = [0u8; BLOCK_SIZE];

    for index in search.clone() {
        if let Err(e) = card.read_blocks(index, &mut block) {
            debug!("block {index} unreadable: {e:#}");
            continue;
        }
        let Some(header) = SdBootHeader::decode(&block) else {
            continue;
        };
        if !is_loader_family(header.magic) {
            continue;
        }

        let size = header.block_count as usize * BLOCK_SIZE;
        info!(
            "boot header at block {index}: {} blocks from {} to {:#010x}",
            header.block_count, header.start_block, header.load_address
        );
        let dest = match ram.region(header.load_address, size) {
            Ok(dest) => dest,
            Err(e) => {
                warn!("image behind block {index} cannot be loaded: {e:#}");
                continue;
            }
        };
        if let Err(e) = card.read_blocks(header.start_block, dest) {
            warn!("reading image behind block {index} failed: {e:#}");
            continue;
        }

        return Ok(BootImage {
            magic: header.magic,
            entry_point: header.entry_point,
            load_address: header.load_address,
            size,
        });
    }

    Err(Error::StorageNotFound)
}

/// Scan an SD/MMC card for a loader-family header and load its image, retrying the whole scan
/// up to `config.max_attempts` times.
pub fn boot_from_sdmmc<D: BlockDevice, R: Ram>(
    card: &mut D,
    config: &SdmmcConfig,
    ram: &mut R,
) -> Result<BootImage> {
    let mut attempt = 0;
    retry(NoDelay.take(config.max_attempts.saturating_sub(1)), || {
        attempt += 1;
        debug!("card scan attempt {attempt}");
        scan_card(card, &config.search, ram)
    })
    .map_err(|e| e.error)
}

/// Scan `range` on NAND for an application header and load the image it describes.
pub fn boot_from_nand<N: Nand, R: Ram>(
    nand: &mut N,
    range: RangeInclusive<u32>,
    ram: &mut R,
) -> Result<BootImage> {
    let layout = nand.get_layout();
    let mut page = vec![0u8; layout.bytes_per_page];

    for index in range {
        let header = match nand.block(index)? {
            None => {
                debug!("skipping bad block {index}");
                continue;
            }
            Some(block) => {
                if let Err(e) = block.read(0, &mut page) {
                    debug!("block {index} unreadable: {e:#}");
                    continue;
                }
                NandBootHeader::decode(&page)
            }
        };
        let Some(header) = header else {
            continue;
        };
        if !is_loader_family(header.magic) && header.magic != BINARY_BOOT {
            continue;
        }

        let size = header.page_count as usize * layout.bytes_per_page;
        info!(
            "boot header in block {index}: {} pages from {}:{} to {:#010x}",
            header.page_count, header.start_block, header.start_page, header.load_address
        );
        let dest = match ram.region(header.load_address, size) {
            Ok(dest) => dest,
            Err(e) => {
                warn!("image behind block {index} cannot be loaded: {e:#}");
                continue;
            }
        };
        if let Err(e) = read_chain(nand, header.start_block, header.start_page, dest) {
            warn!("reading image behind block {index} failed: {e:#}");
            continue;
        }

        return Ok(BootImage {
            magic: header.magic,
            entry_point: header.entry_point,
            load_address: header.load_address,
            size,
        });
    }

    Err(Error::StorageNotFound)
}
