//! Abstractions and code to access byte-addressable NOR flash and SPI memories

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::ensure;

use crate::util::parse_number;

pub mod header;
pub mod program;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Size and erase granularity of a NOR/SPI device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NorGeometry {
    /// Address the device is mapped at (for execute-in-place entry points)
    pub base: u32,

    /// Total bytes
    pub size: u32,

    /// Erase block size
    pub block_size: u32,
}

impl NorGeometry {
    /// The erase block containing `offset`, as (block offset, block size)
    pub fn block_containing(&self, offset: u32) -> Option<(u32, u32)> {
        (offset < self.size).then(|| (offset - offset % self.block_size, self.block_size))
    }

    /// The range of whole blocks covering `offset..offset + len`, as (start, length)
    pub fn covering(&self, offset: u32, len: u32) -> (u32, u32) {
        let start = offset - offset % self.block_size;
        let end = (offset + len).div_ceil(self.block_size) * self.block_size;
        (start, end - start)
    }
}

/// Parse strings like "SIZE,BLOCKSIZE", optionally followed by "@BASE" (hex accepted with 0x)
impl FromStr for NorGeometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (dims, base) = s.split_once('@').unwrap_or((s, "0"));
        let (size, block_size) = dims
            .split_once(',')
            .ok_or(anyhow::anyhow!("expected SIZE,BLOCKSIZE[@BASE]"))?;
        let geometry = NorGeometry {
            base: parse_number(base)?,
            size: parse_number(size)?,
            block_size: parse_number(block_size)?,
        };
        ensure!(
            geometry.block_size > 0 && geometry.size % geometry.block_size == 0,
            "size not a multiple of the block size"
        );
        Ok(geometry)
    }
}

/// Represents a NOR flash or SPI memory device
///
/// Offsets are relative to the start of the device.
pub trait NorFlash {
    fn geometry(&self) -> NorGeometry;

    /// Read `buf.len()` bytes at `offset`
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> anyhow::Result<()>;

    /// Erase every block overlapping `offset..offset + len`
    fn erase(&mut self, offset: u32, len: u32) -> anyhow::Result<()>;

    /// Program `data` at `offset`; the range should have been erased
    fn write(&mut self, offset: u32, data: &[u8]) -> anyhow::Result<()>;
}

/// Misbehavior injected into a simulated NOR device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimNorFault {
    /// Erasing the block containing this offset fails
    EraseFails { at: u32 },

    /// Writes touching this offset fail
    WriteFails { at: u32 },

    /// The byte at this offset silently loses its low bit when programmed
    Corrupts { at: u32 },
}

/// A simulated in-memory NOR flash, for testing purposes
///
/// Programming can only clear bits, as on the real thing.
#[derive(Debug, Clone)]
pub struct SimNor {
    data: Vec<u8>,
    geometry: NorGeometry,
    fault: Option<SimNorFault>,
}

impl SimNor {
    pub fn new(geometry: NorGeometry) -> Self {
        Self {
            data: vec![0xFF; geometry.size as usize],
            geometry,
            fault: None,
        }
    }

    /// Initialize the contents from a type implementing `Read`
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        read.read_exact(&mut self.data)?;
        Ok(())
    }

    /// Write the contents out to a writable stream (such as a File)
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        write.write_all(&self.data)?;
        Ok(())
    }

    pub fn inject(&mut self, fault: SimNorFault) {
        self.fault = Some(fault);
    }

    fn check_range(&self, offset: u32, len: usize) -> anyhow::Result<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start + len;
        ensure!(
            end <= self.data.len(),
            "range {start:#x}..{end:#x} out of bounds"
        );
        Ok(start..end)
    }
}

impl NorFlash for SimNor {
    fn geometry(&self) -> NorGeometry {
        self.geometry
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        let range = self.check_range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> anyhow::Result<()> {
        let (start, len) = self.geometry.covering(offset, len);
        let range = self.check_range(start, len as usize)?;
        if let Some(SimNorFault::EraseFails { at }) = self.fault {
            ensure!(
                !range.contains(&(at as usize)),
                "simulated erase failure at {at:#x}"
            );
        }
        self.data[range].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> anyhow::Result<()> {
        let range = self.check_range(offset, data.len())?;
        match self.fault {
            Some(SimNorFault::WriteFails { at }) if range.contains(&(at as usize)) => {
                anyhow::bail!("simulated write failure at {at:#x}")
            }
            _ => (),
        }

        for (dst, &src) in self.data[range.clone()].iter_mut().zip(data) {
            *dst &= src;
        }

        if let Some(SimNorFault::Corrupts { at }) = self.fault {
            if range.contains(&(at as usize)) {
                self.data[at as usize] ^= 0x01;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) const TEST_GEOMETRY: NorGeometry = NorGeometry {
    base: 0x6000_0000,
    size: 0x10_0000,
    block_size: 0x1_0000,
};

#[test]
fn test_sim_nor_and_write() -> anyhow::Result<()> {
    let mut nor = SimNor::new(TEST_GEOMETRY);
    nor.write(0x10, &[0xF0, 0x0F])?;
    nor.write(0x10, &[0x3C, 0xFF])?;

    let mut buf = [0u8; 3];
    nor.read(0x10, &mut buf)?;
    assert_eq!(buf, [0x30, 0x0F, 0xFF]);

    nor.erase(0x10, 1)?;
    nor.read(0x10, &mut buf)?;
    assert_eq!(buf, [0xFF; 3]);

    assert!(nor.read(TEST_GEOMETRY.size - 1, &mut buf).is_err());
    Ok(())
}

#[test]
fn test_geometry() {
    assert_eq!(TEST_GEOMETRY.covering(0x1_0010, 0x1_0000), (0x1_0000, 0x2_0000));
    assert_eq!(TEST_GEOMETRY.covering(0, 0x1_0000), (0, 0x1_0000));
    assert_eq!(
        TEST_GEOMETRY.block_containing(0x2_1234),
        Some((0x2_0000, 0x1_0000))
    );
    assert_eq!(TEST_GEOMETRY.block_containing(TEST_GEOMETRY.size), None);

    let parsed: NorGeometry = "0x100000,0x10000@0x60000000".parse().unwrap();
    assert_eq!(parsed, TEST_GEOMETRY);
    assert!("1000,3".parse::<NorGeometry>().is_err());
}
