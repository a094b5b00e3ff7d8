//! Abstractions and code to access NAND flash

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::ensure;

pub mod header;
pub mod program;

#[cfg(target_os = "linux")]
pub mod mtd;

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

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub spare_bytes_per_page: usize,
}

impl NandLayout {
    /// Number of data bytes in one block
    pub fn block_size(&self) -> usize {
        self.pages_per_block as usize * self.bytes_per_page
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES", optionally followed by "xSPARE"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = s.split('x').collect();
        let (blocks, pages_per_block, bytes_per_page, spare) = match parts[..] {
            [b, p, n] => (b, p, n, None),
            [b, p, n, s] => (b, p, n, Some(s)),
            _ => anyhow::bail!("expected #x#x#[x#]"),
        };
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;
        let spare_bytes_per_page = spare.map(str::parse::<usize>).transpose()?.unwrap_or(0);

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            spare_bytes_per_page,
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;

    /// Is the whole device write-protected (e.g. by its WP pin)?
    fn is_write_protected(&self) -> anyhow::Result<bool>;

    /// Unlock blocks `start..=end` for program and erase
    fn unprotect(&mut self, start: u32, end: u32) -> anyhow::Result<()>;

    /// Lock every block that was unlocked
    fn protect(&mut self) -> anyhow::Result<()>;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `index` must be greater than any previously-written index, or in other words,
    /// writing a page makes it and all skipped pages nonwritable. This is to comply with the
    /// sequential-write requirements of certain MLC NANDs.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    ///
    /// This should be called if an erase() results in error, or if a program() or its read-back
    /// verification fails.
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// Read `out.len()` bytes of an image starting at page `page` of block `block`, continuing into
/// following blocks and skipping any marked bad.
pub fn read_chain<N: Nand>(
    nand: &mut N,
    mut block: u32,
    mut page: u32,
    out: &mut [u8],
) -> anyhow::Result<()> {
    let layout = nand.get_layout();
    let mut buf = vec![0u8; layout.bytes_per_page];

    for chunk in out.chunks_mut(layout.bytes_per_page) {
        if page == layout.pages_per_block {
            block += 1;
            page = 0;
        }

        // Only step onto good blocks at block boundaries
        if page == 0 {
            while nand.block(block)?.is_none() {
                block += 1;
            }
        }

        let b = nand
            .block(block)?
            .ok_or(anyhow::anyhow!("block {block} went bad during read"))?;
        b.read(page, &mut buf)?;
        chunk.copy_from_slice(&buf[..chunk.len()]);
        page += 1;
    }

    Ok(())
}

/// Misbehavior injected into a simulated block
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimFault {
    /// Every erase fails
    EraseFails,

    /// Programming any page at or after `from_page` fails
    ProgramFails { from_page: u32 },

    /// Pages at or after `from_page` program without error but read back corrupted
    Corrupts { from_page: u32 },
}

/// Misbehavior injected into the simulated block locking
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimLockFault {
    /// Unlocking releases the blocks but then reports an error
    UnlockFails,

    /// Locking reports an error after locking the blocks
    LockFails,
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
    write_protect: bool,
    locked: bool,
    lock_fault: Option<SimLockFault>,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,

    /// Injected misbehavior, if any
    fault: Option<SimFault>,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            layout,
            write_protect: false,
            locked: true,
            lock_fault: None,
        }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in 0..self.layout.blocks {
            let mut block = &mut self.blocks[block as usize];
            block.marked_bad = false;
            read.read_exact(&mut buf)?;
            block.erase()?;
            block.program(0, &buf)?;
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND block out to a writable stream (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in 0..self.layout.blocks {
            match self.block(block)? {
                None => buf.fill(0xBD),
                Some(block) => block.read(0, &mut buf)?,
            };

            write.write_all(&buf)?;
        }

        Ok(())
    }

    /// Make a block misbehave from now on
    pub fn inject(&mut self, block: u32, fault: SimFault) {
        if let Some(block) = self.blocks.get_mut(block as usize) {
            block.fault = Some(fault);
        }
    }

    /// Drive the simulated WP pin
    pub fn set_write_protect(&mut self, asserted: bool) {
        self.write_protect = asserted;
    }

    /// Make block locking misbehave from now on
    pub fn inject_lock_fault(&mut self, fault: SimLockFault) {
        self.lock_fault = Some(fault);
    }

    /// Are the blocks currently locked?
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            marked_bad: false,
            fault: None,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        match self.fault {
            Some(SimFault::ProgramFails { from_page }) if index >= from_page => {
                anyhow::bail!("simulated program failure on page {index}")
            }
            Some(SimFault::Corrupts { from_page }) if index >= from_page => {
                self.data.resize(begin, 0xFF);
                self.data.extend_from_slice(content);
                self.data[begin] ^= 0x01;
                return Ok(());
            }
            _ => (),
        }

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn is_write_protected(&self) -> anyhow::Result<bool> {
        Ok(self.write_protect)
    }

    fn unprotect(&mut self, start: u32, end: u32) -> anyhow::Result<()> {
        ensure!(
            start <= end && end < self.layout.blocks,
            "unlock range {start}..={end} out of bounds"
        );
        self.locked = false;
        ensure!(
            self.lock_fault != Some(SimLockFault::UnlockFails),
            "unlock of blocks {start}..={end} failed"
        );
        Ok(())
    }

    fn protect(&mut self) -> anyhow::Result<()> {
        self.locked = true;
        ensure!(
            self.lock_fault != Some(SimLockFault::LockFails),
            "lock failed"
        );
        Ok(())
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks_mut(self.page_size()) {
            self.read_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks(self.page_size()) {
            self.write_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        ensure!(
            self.fault != Some(SimFault::EraseFails),
            "simulated erase failure"
        );
        self.data.clear();

        Ok(())
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        self.data.clear();
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 64,
    pages_per_block: 8,
    bytes_per_page: 256,
    spare_bytes_per_page: 8,
};

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(1, &data_in).is_err());

    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.read(3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8)).unwrap();

    let mut buf = vec![0u8; nand.get_layout().block_size()];

    let block = nand.block(0).unwrap().unwrap();
    block.read(0, &mut buf).unwrap();

    assert!(buf.iter().all(|&x| x == 0x55u8));
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.inject(1, SimFault::EraseFails);
    nand.inject(2, SimFault::ProgramFails { from_page: 3 });
    nand.inject(3, SimFault::Corrupts { from_page: 0 });

    let page = vec![0x3Cu8; TEST_LAYOUT.bytes_per_page];
    let mut readback = page.clone();

    assert!(nand.block(1).unwrap().unwrap().erase().is_err());

    let mut block = nand.block(2).unwrap().unwrap();
    block.program(2, &page).unwrap();
    assert!(block.program(3, &page).is_err());

    let mut block = nand.block(3).unwrap().unwrap();
    block.program(0, &page).unwrap();
    block.read(0, &mut readback).unwrap();
    assert_ne!(readback, page);
}

#[test]
fn test_layout_parse() {
    let layout: NandLayout = "64x8x256x8".parse().unwrap();
    assert_eq!(layout, TEST_LAYOUT);

    let layout: NandLayout = "1024x64x2048".parse().unwrap();
    assert_eq!(layout.spare_bytes_per_page, 0);
    assert_eq!(layout.block_size(), 64 * 2048);

    assert!("1024x64".parse::<NandLayout>().is_err());
}
