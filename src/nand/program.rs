//! This module places boot images on NAND flash: redundant copies, bad-block exclusion, and
//! recovery from failed writes.
//!
//! Each copy is placed by a small state machine:
//!
//! ```text
//! Seek --(good block)--> Erase --(run erased)--> Header --(verified)--> Data --> Placed
//!   ^                      |                       |                     |
//!   +------(bad block)-----+-----(mark bad)--------+---(restart)---------+
//! ```
//!
//! A failure in a later block of a non-contiguous image does not restart the copy; the pages
//! already committed in that block are rewritten in the next good block instead.

use std::ops::RangeInclusive;

use log::{debug, info, warn};

use super::header::NandBootHeader;
use super::{Nand, NandBlock, NandLayout};
use crate::error::{DeviceError, Error, Result};
use crate::util::block_count;
use crate::validate::HeaderTemplate;

/// Where an image may land, and under which constraints
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Placement {
    /// Header written to page 0 of each copy, if any
    pub header: Option<HeaderTemplate>,

    /// First block searched
    pub start_block: u32,

    /// Last block a copy may start in
    pub end_block: u32,

    /// A copy must occupy an unbroken run of blocks
    pub contiguous: bool,

    /// How many copies to place back to back
    pub copies: u32,
}

impl Placement {
    /// An image with a header page, searched for in `range`
    pub fn with_header(header: HeaderTemplate, range: RangeInclusive<u32>, contiguous: bool) -> Self {
        Self {
            header: Some(header),
            start_block: *range.start(),
            end_block: *range.end(),
            contiguous,
            copies: 1,
        }
    }

    /// A header-less image beginning at `start_block`, free to use the rest of the device
    pub fn raw(start_block: u32, layout: NandLayout) -> Self {
        Self {
            header: None,
            start_block,
            end_block: layout.blocks.saturating_sub(1),
            contiguous: false,
            copies: 1,
        }
    }

    pub fn copies(mut self, copies: u32) -> Self {
        self.copies = copies.max(1);
        self
    }
}

/// The blocks one copy ended up in
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PlacedCopy {
    pub first_block: u32,
    pub last_block: u32,
}

/// Progress through the data pages of one copy
#[derive(Debug, Copy, Clone)]
struct Cursor {
    first: u32,
    block: u32,
    page: u32,
    pages_done: u32,
    blocks_remaining: u32,
    erased_until: u32,
}

#[derive(Debug, Copy, Clone)]
enum State {
    Seek { from: u32 },
    Erase { first: u32 },
    Header { first: u32 },
    Data(Cursor),
    Placed(PlacedCopy),
    Exhausted,
}

struct Placer<'p, N: Nand> {
    nand: &'p mut N,
    placement: &'p Placement,
    layout: NandLayout,
    data: &'p [u8],

    /// Data pages per copy
    page_count: u32,

    /// 1 if a header page precedes the data
    header_pages: u32,

    /// Blocks per copy
    required: u32,

    /// Last block any copy may touch
    limit: u32,

    write_buf: &'p mut [u8],
    read_buf: &'p mut [u8],
}

/// Program one page and read it back; false if either step fails or the contents differ.
fn program_verified<B: NandBlock>(
    block: &mut B,
    page: u32,
    content: &[u8],
    readback: &mut [u8],
) -> bool {
    if let Err(e) = block.program(page, content) {
        debug!("program of page {page} failed: {e:#}");
        return false;
    }
    if let Err(e) = block.read(page, readback) {
        debug!("read-back of page {page} failed: {e:#}");
        return false;
    }
    readback == content
}

impl<N: Nand> Placer<'_, N> {
    fn place_copy(&mut self, from: u32) -> Result<Option<PlacedCopy>> {
        let mut state = State::Seek { from };
        loop {
            state = match state {
                State::Seek { from } => self.seek(from)?,
                State::Erase { first } => self.erase_run(first)?,
                State::Header { first } => self.write_header(first)?,
                State::Data(cursor) => self.write_data(cursor)?,
                State::Placed(copy) => return Ok(Some(copy)),
                State::Exhausted => return Ok(None),
            };
        }
    }

    fn seek(&mut self, from: u32) -> Result<State> {
        let mut block = from;
        loop {
            if block > self.limit {
                warn!("no good blocks left in range");
                return Ok(State::Exhausted);
            }
            if self.nand.block(block)?.is_some() {
                debug!("attempting to start in block {block}");
                return Ok(State::Erase { first: block });
            }
            warn!("NAND block {block} is bad");
            block += 1;
        }
    }

    fn erase_run(&mut self, first: u32) -> Result<State> {
        if first + self.required - 1 > self.limit {
            warn!("copy starting at block {first} would overrun block {}", self.limit);
            return Ok(State::Exhausted);
        }

        for index in first..first + self.required {
            match self.nand.block(index)? {
                None => {
                    warn!("NAND block {index} is bad, restarting past it");
                    return Ok(State::Seek { from: index + 1 });
                }
                Some(mut block) => {
                    if let Err(e) = block.erase() {
                        warn!("erase of block {index} failed, marking bad: {e:#}");
                        block.mark_bad()?;
                        return Ok(State::Seek { from: index + 1 });
                    }
                }
            }
        }

        Ok(if self.header_pages > 0 {
            State::Header { first }
        } else {
            State::Data(self.cursor_at(first))
        })
    }

    fn cursor_at(&self, first: u32) -> Cursor {
        Cursor {
            first,
            block: first,
            page: self.header_pages,
            pages_done: 0,
            blocks_remaining: self.required,
            erased_until: first + self.required,
        }
    }

    fn write_header(&mut self, first: u32) -> Result<State> {
        let Some(template) = self.placement.header else {
            return Ok(State::Data(self.cursor_at(first)));
        };

        let header = NandBootHeader {
            magic: template.magic,
            entry_point: template.entry_point,
            page_count: self.page_count,
            start_block: first,
            start_page: 1,
            load_address: template.load_address,
        };
        header.encode(self.write_buf)?;
        debug!("writing header {header:x?} to block {first}, page 0");

        let Some(mut block) = self.nand.block(first)? else {
            return Ok(State::Seek { from: first + 1 });
        };
        if !program_verified(&mut block, 0, self.write_buf, self.read_buf) {
            warn!("header write to block {first} failed, marking bad");
            block.mark_bad()?;
            return Ok(State::Seek { from: first + 1 });
        }
        drop(block);

        Ok(State::Data(self.cursor_at(first)))
    }

    /// Give up on the copy starting at `first`; its header page must not survive.
    fn abandon(&mut self, first: u32) -> Result<()> {
        if self.header_pages == 0 {
            return Ok(());
        }
        let Some(mut block) = self.nand.block(first)? else {
            return Ok(());
        };
        info!("invalidating header of abandoned copy in block {first}");
        if let Err(e) = block.erase() {
            warn!("erase of block {first} failed, marking bad: {e:#}");
            block.mark_bad()?;
        }
        Ok(())
    }

    /// Make `cursor.block` a usable, erased block, skipping bad ones. False if the copy no longer
    /// fits the range.
    fn enter_block(&mut self, cursor: &mut Cursor) -> Result<bool> {
        loop {
            if cursor.block + cursor.blocks_remaining - 1 > self.limit {
                return Ok(false);
            }

            let index = cursor.block;
            match self.nand.block(index)? {
                None => {
                    warn!("NAND block {index} is bad, skipping");
                    cursor.block += 1;
                }
                Some(_) if index < cursor.erased_until => return Ok(true),
                Some(mut block) => match block.erase() {
                    Ok(()) => {
                        cursor.erased_until = index + 1;
                        return Ok(true);
                    }
                    Err(e) => {
                        warn!("erase of block {index} failed, marking bad: {e:#}");
                        block.mark_bad()?;
                        cursor.block += 1;
                    }
                },
            }
        }
    }

    fn stage_page(&mut self, index: u32) {
        let bpp = self.layout.bytes_per_page;
        let start = index as usize * bpp;
        let src = &self.data[start..(start + bpp).min(self.data.len())];
        self.write_buf[..src.len()].copy_from_slice(src);
        self.write_buf[src.len()..].fill(0xFF);
    }

    fn write_data(&mut self, mut c: Cursor) -> Result<State> {
        loop {
            if c.pages_done == self.page_count {
                return Ok(State::Placed(PlacedCopy {
                    first_block: c.first,
                    last_block: c.block,
                }));
            }

            if c.page == self.layout.pages_per_block {
                c.block += 1;
                c.blocks_remaining = c.blocks_remaining.saturating_sub(1).max(1);
                c.page = 0;
                if !self.enter_block(&mut c)? {
                    self.abandon(c.first)?;
                    return Ok(State::Exhausted);
                }
            }

            self.stage_page(c.pages_done);

            let committed = match self.nand.block(c.block)? {
                Some(mut block) => {
                    if program_verified(&mut block, c.page, self.write_buf, self.read_buf) {
                        true
                    } else {
                        warn!(
                            "write of block {}, page {} failed, marking bad",
                            c.block, c.page
                        );
                        block.mark_bad()?;
                        false
                    }
                }
                None => false,
            };

            if committed {
                c.pages_done += 1;
                c.page += 1;
                continue;
            }

            if c.block == c.first {
                // The header is lost with this block
                return Ok(State::Seek { from: c.block + 1 });
            }
            if self.placement.contiguous {
                self.abandon(c.first)?;
                return Ok(State::Seek { from: c.block + 1 });
            }

            // Pages already committed in the failed block go again in the next one
            c.pages_done -= c.page;
            c.page = 0;
            c.block += 1;
            if !self.enter_block(&mut c)? {
                self.abandon(c.first)?;
                return Ok(State::Exhausted);
            }
        }
    }
}

/// Place `placement.copies` copies of `data` on the NAND.
///
/// `scratch` must hold at least two pages; it is used as the write and read-back buffers.
/// Returns where each copy landed. Later copies that do not fit are tolerated once at least one
/// copy is placed.
pub fn program_image<N: Nand>(
    nand: &mut N,
    placement: &Placement,
    data: &[u8],
    scratch: &mut [u8],
) -> Result<Vec<PlacedCopy>> {
    if nand.is_write_protected()? {
        return Err(DeviceError::WriteProtected.into());
    }

    let layout = nand.get_layout();
    let bpp = layout.bytes_per_page;
    let scratch = scratch
        .get_mut(..2 * bpp)
        .ok_or(anyhow::anyhow!("scratch buffer smaller than two pages"))?;
    let (write_buf, read_buf) = scratch.split_at_mut(bpp);

    let page_count = u32::try_from(data.len().div_ceil(bpp))
        .map_err(|_| anyhow::anyhow!("image too large"))?;
    let header_pages = u32::from(placement.header.is_some());
    let required = (page_count + header_pages)
        .div_ceil(layout.pages_per_block)
        .max(1);
    let limit = (placement.end_block + required - 1).min(layout.blocks.saturating_sub(1));

    info!(
        "placing {} bytes ({page_count} pages, {required} blocks per copy) in blocks {}..={}",
        data.len(),
        placement.start_block,
        placement.end_block
    );

    let placed = nand
        .unprotect(placement.start_block.min(limit), limit)
        .map_err(Error::from)
        .and_then(|()| {
            let mut placer = Placer {
                nand: &mut *nand,
                placement,
                layout,
                data,
                page_count,
                header_pages,
                required,
                limit,
                write_buf,
                read_buf,
            };
            place_copies(&mut placer)
        });

    relock(nand, placed)
}

/// Lock the NAND again whatever happened while it was unlocked. The first error wins.
fn relock<N: Nand, T>(nand: &mut N, result: Result<T>) -> Result<T> {
    let locked = nand.protect();
    let value = result?;
    locked?;
    Ok(value)
}

fn place_copies<N: Nand>(placer: &mut Placer<'_, N>) -> Result<Vec<PlacedCopy>> {
    let placement = placer.placement;
    let rpt = howudoin::new()
        .label("Programming NAND")
        .set_len(u64::from(placement.copies));

    let mut placed = Vec::new();
    let mut from = placement.start_block;
    while placed.len() < placement.copies as usize {
        match placer.place_copy(from)? {
            Some(copy) => {
                info!(
                    "copy {} placed in blocks {}..={}",
                    placed.len(),
                    copy.first_block,
                    copy.last_block
                );
                from = copy.last_block + 1;
                placed.push(copy);
                rpt.inc();
            }
            None if !placed.is_empty() => {
                warn!(
                    "only {} of {} copies fit in range",
                    placed.len(),
                    placement.copies
                );
                break;
            }
            None => {
                rpt.close();
                return Err(Error::PlacementExhausted {
                    start: placement.start_block,
                    end: placement.end_block,
                });
            }
        }
    }

    rpt.close();
    Ok(placed)
}

/// Erase blocks `range`, `chunk_blocks` at a time, calling `on_chunk` after each chunk.
///
/// Bad blocks are skipped; any erase failure aborts immediately.
pub fn erase_range<N, F>(
    nand: &mut N,
    range: RangeInclusive<u32>,
    chunk_blocks: u32,
    mut on_chunk: F,
) -> Result<()>
where
    N: Nand,
    F: FnMut() -> Result<()>,
{
    if nand.is_write_protected()? {
        return Err(DeviceError::WriteProtected.into());
    }

    let count = block_count(&range)?;
    let (start, end) = (*range.start(), *range.end());
    let erased = nand
        .unprotect(start, end)
        .map_err(Error::from)
        .and_then(|()| erase_chunks(nand, start, count, chunk_blocks.max(1), &mut on_chunk));
    relock(nand, erased)
}

fn erase_chunks<N: Nand>(
    nand: &mut N,
    start: u32,
    count: u32,
    chunk_blocks: u32,
    on_chunk: &mut dyn FnMut() -> Result<()>,
) -> Result<()> {
    let block_size = nand.get_layout().block_size() as u32;
    let end = start + (count - 1);
    let rpt = howudoin::new()
        .label("Erasing blocks")
        .set_len(u64::from(count));

    let mut chunk_start = start;
    while chunk_start <= end {
        let chunk_end = end.min(chunk_start.saturating_add(chunk_blocks - 1));
        for index in chunk_start..=chunk_end {
            match nand.block(index)? {
                None => debug!("skipping bad block {index}"),
                Some(mut block) => {
                    if let Err(e) = block.erase() {
                        warn!("erase of block {index} failed: {e:#}");
                        rpt.close();
                        return Err(DeviceError::EraseFailed(index * block_size).into());
                    }
                }
            }
            rpt.inc();
        }
        on_chunk()?;
        chunk_start = chunk_end + 1;
    }

    rpt.close();
    Ok(())
}
