//! SD/MMC cards as 512-byte block devices, and the boot header the loader scans them for.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use anyhow::ensure;
use deku::prelude::*;
use log::{debug, info};

use crate::error::{DeviceError, Result};
use crate::validate::HeaderTemplate;

pub const BLOCK_SIZE: usize = 512;

/// Represents an SD/MMC card (or any 512-byte block device)
pub trait BlockDevice {
    /// How many blocks on the card?
    fn block_count(&self) -> u32;

    /// Read an integral number of blocks, starting at `start`
    fn read_blocks(&mut self, start: u32, buf: &mut [u8]) -> anyhow::Result<()>;

    /// Write an integral number of blocks, starting at `start`
    fn write_blocks(&mut self, start: u32, data: &[u8]) -> anyhow::Result<()>;
}

/// Header block preceding an image on the card
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct SdBootHeader {
    pub magic: u32,
    pub entry_point: u32,
    pub block_count: u32,
    pub start_block: u32,
    pub load_address: u32,
}

impl SdBootHeader {
    pub fn decode(block: &[u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((block, 0)).ok()?;
        Some(header)
    }

    /// Encode into a whole block, padded with the erased pattern
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut block = self.to_bytes()?;
        block.resize(BLOCK_SIZE, 0xFF);
        Ok(block)
    }
}

fn check_blocks(count: u32, start: u32, len: usize) -> anyhow::Result<u64> {
    ensure!(len % BLOCK_SIZE == 0, "buffer not multiple of block size");
    let end = u64::from(start) + (len / BLOCK_SIZE) as u64;
    ensure!(
        end <= u64::from(count),
        "block range {start}..{end} out of bounds"
    );
    Ok(u64::from(start) * BLOCK_SIZE as u64)
}

/// Write a header at `header_block` and `data` in the blocks right after it.
///
/// Data goes out in `chunk_blocks`-block pieces, calling `on_chunk` after each; the last block is
/// padded with 0xFF.
pub fn write_image<D, F>(
    card: &mut D,
    header_block: u32,
    template: HeaderTemplate,
    data: &[u8],
    chunk_blocks: u32,
    mut on_chunk: F,
) -> Result<SdBootHeader>
where
    D: BlockDevice,
    F: FnMut() -> Result<()>,
{
    let block_count = u32::try_from(data.len().div_ceil(BLOCK_SIZE))
        .map_err(|_| anyhow::anyhow!("image too large"))?;
    let header = SdBootHeader {
        magic: template.magic,
        entry_point: template.entry_point,
        block_count,
        start_block: header_block + 1,
        load_address: template.load_address,
    };
    info!(
        "writing {block_count} blocks at {} (header at {header_block})",
        header.start_block
    );

    card.write_blocks(header_block, &header.encode()?)
        .map_err(|_| DeviceError::WriteFailed(header_block))?;

    let step = chunk_blocks.max(1) as usize * BLOCK_SIZE;
    let rpt = howudoin::new()
        .label("Writing card")
        .set_len(data.len().div_ceil(step) as u64);

    let mut block = header.start_block;
    let mut padded = Vec::with_capacity(step);
    for piece in data.chunks(step) {
        padded.clear();
        padded.extend_from_slice(piece);
        padded.resize(piece.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0xFF);

        if let Err(e) = card.write_blocks(block, &padded) {
            debug!("write at block {block} failed: {e:#}");
            rpt.close();
            return Err(DeviceError::WriteFailed(block).into());
        }
        block += (padded.len() / BLOCK_SIZE) as u32;
        rpt.inc();
        on_chunk()?;
    }

    rpt.close();
    Ok(header)
}

/// Overwrite blocks `range` with 0xFF, `chunk_blocks` at a time
pub fn erase_blocks<D, F>(
    card: &mut D,
    range: std::ops::RangeInclusive<u32>,
    chunk_blocks: u32,
    mut on_chunk: F,
) -> Result<()>
where
    D: BlockDevice,
    F: FnMut() -> Result<()>,
{
    let (start, end) = (*range.start(), (*range.end()).min(card.block_count().saturating_sub(1)));
    let chunk_blocks = chunk_blocks.max(1);
    let blank = vec![0xFF; chunk_blocks as usize * BLOCK_SIZE];

    let mut at = start;
    while at <= end {
        let count = chunk_blocks.min(end - at + 1);
        card.write_blocks(at, &blank[..count as usize * BLOCK_SIZE])
            .map_err(|_| DeviceError::EraseFailed(at))?;
        on_chunk()?;
        at += count;
    }

    Ok(())
}

/// A simulated in-memory card, for testing purposes
#[derive(Debug, Clone)]
pub struct SimCard {
    data: Vec<u8>,
    failing_reads: Vec<(u32, usize)>,
    reads: usize,
}

impl SimCard {
    pub fn new(blocks: u32) -> Self {
        Self {
            data: vec![0xFF; blocks as usize * BLOCK_SIZE],
            failing_reads: Vec::new(),
            reads: 0,
        }
    }

    /// Make the next `times` reads touching `block` fail
    pub fn fail_reads(&mut self, block: u32, times: usize) {
        self.failing_reads.push((block, times));
    }

    /// How many reads were issued so far
    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl BlockDevice for SimCard {
    fn block_count(&self) -> u32 {
        (self.data.len() / BLOCK_SIZE) as u32
    }

    fn read_blocks(&mut self, start: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        let offset = check_blocks(self.block_count(), start, buf.len())? as usize;
        self.reads += 1;

        let end = start + (buf.len() / BLOCK_SIZE) as u32;
        for (block, times) in self.failing_reads.iter_mut() {
            if (start..end).contains(block) && *times > 0 {
                *times -= 1;
                anyhow::bail!("simulated read failure at block {block}");
            }
        }

        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_blocks(&mut self, start: u32, data: &[u8]) -> anyhow::Result<()> {
        let offset = check_blocks(self.block_count(), start, data.len())? as usize;
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// A card (or card image) accessed through a file such as `/dev/mmcblk0`
#[derive(Debug)]
pub struct FileCard {
    file: File,
    blocks: u32,
}

impl FileCard {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let blocks = u32::try_from(len / BLOCK_SIZE as u64)?;
        Ok(Self { file, blocks })
    }
}

impl BlockDevice for FileCard {
    fn block_count(&self) -> u32 {
        self.blocks
    }

    fn read_blocks(&mut self, start: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        let offset = check_blocks(self.blocks, start, buf.len())?;
        Ok(self.file.read_exact_at(buf, offset)?)
    }

    fn write_blocks(&mut self, start: u32, data: &[u8]) -> anyhow::Result<()> {
        let offset = check_blocks(self.blocks, start, data.len())?;
        Ok(self.file.write_all_at(data, offset)?)
    }
}

#[test]
fn test_sim_card() -> anyhow::Result<()> {
    let mut card = SimCard::new(16);
    let data = [0x42u8; 2 * BLOCK_SIZE];
    card.write_blocks(3, &data)?;

    let mut buf = [0u8; BLOCK_SIZE];
    card.read_blocks(4, &mut buf)?;
    assert_eq!(buf, [0x42; BLOCK_SIZE]);

    card.fail_reads(4, 1);
    assert!(card.read_blocks(3, &mut [0u8; 2 * BLOCK_SIZE]).is_err());
    card.read_blocks(4, &mut buf)?;

    assert!(card.read_blocks(16, &mut buf).is_err());
    assert!(card.write_blocks(0, &[0u8; 100]).is_err());
    Ok(())
}

#[test]
fn test_header_block() -> anyhow::Result<()> {
    let header = SdBootHeader {
        magic: 0xA1AC_ED00,
        entry_point: 0x100,
        block_count: 4,
        start_block: 2,
        load_address: 0x20,
    };
    let block = header.encode()?;
    assert_eq!(block.len(), BLOCK_SIZE);
    assert_eq!(block[8..12], [4, 0, 0, 0]);
    assert_eq!(block[16..20], [0x20, 0, 0, 0]);
    assert_eq!(SdBootHeader::decode(&block), Some(header));
    Ok(())
}

#[test]
fn test_write_and_erase() -> anyhow::Result<()> {
    let mut card = SimCard::new(64);
    let data: Vec<u8> = (0..1300).map(|i| i as u8).collect();
    let template = HeaderTemplate {
        magic: 0xA1AC_ED00,
        entry_point: 0x100,
        load_address: 0x20,
    };

    let mut chunks = 0;
    let header = write_image(&mut card, 4, template, &data, 2, || {
        chunks += 1;
        Ok(())
    })?;
    assert_eq!(chunks, 2);
    assert_eq!(header.block_count, 3);
    assert_eq!(header.start_block, 5);

    let mut block = [0u8; BLOCK_SIZE];
    card.read_blocks(4, &mut block)?;
    assert_eq!(SdBootHeader::decode(&block), Some(header));

    let mut out = vec![0u8; 3 * BLOCK_SIZE];
    card.read_blocks(5, &mut out)?;
    assert_eq!(out[..data.len()], data[..]);
    assert!(out[data.len()..].iter().all(|&x| x == 0xFF));

    let mut chunks = 0;
    erase_blocks(&mut card, 1..=8, 3, || {
        chunks += 1;
        Ok(())
    })?;
    assert_eq!(chunks, 3);
    card.read_blocks(4, &mut block)?;
    assert_eq!(block, [0xFF; BLOCK_SIZE]);
    Ok(())
}
