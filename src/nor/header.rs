//! Boot headers written in front of redirect-to-RAM images on NOR and SPI memories.

use deku::prelude::*;

/// Header the NOR loader looks for at the start of the block after itself
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct NorBootHeader {
    pub magic: u32,
    pub entry_point: u32,
    pub app_size: u32,
    pub load_address: u32,
}

/// Header the SPI boot ROM (and loader) reads; `mem_address` is where the payload starts
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct SpiBootHeader {
    pub magic: u32,
    pub entry_point: u32,
    pub app_size: u32,
    pub mem_address: u32,
    pub load_address: u32,
}

impl NorBootHeader {
    pub const SIZE: usize = 16;

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((bytes.get(..Self::SIZE)?, 0)).ok()?;
        Some(header)
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.to_bytes()?)
    }
}

impl SpiBootHeader {
    pub const SIZE: usize = 20;

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((bytes.get(..Self::SIZE)?, 0)).ok()?;
        Some(header)
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.to_bytes()?)
    }
}

#[test]
fn test_header_sizes() -> anyhow::Result<()> {
    let nor = NorBootHeader {
        magic: 0x5542_4CBB,
        entry_point: 0x8000_0000,
        app_size: 0x1234,
        load_address: 0x8000_0000,
    };
    let bytes = nor.encode()?;
    assert_eq!(bytes.len(), NorBootHeader::SIZE);
    assert_eq!(bytes[..4], [0xBB, 0x4C, 0x42, 0x55]);
    assert_eq!(NorBootHeader::decode(&bytes), Some(nor));

    let spi = SpiBootHeader {
        magic: 0xA1AC_ED00,
        entry_point: 0x20,
        app_size: 0x100,
        mem_address: SpiBootHeader::SIZE as u32,
        load_address: 0x20,
    };
    let bytes = spi.encode()?;
    assert_eq!(bytes.len(), SpiBootHeader::SIZE);
    assert_eq!(bytes[12..16], [20, 0, 0, 0]);
    assert_eq!(SpiBootHeader::decode(&bytes), Some(spi));
    assert_eq!(SpiBootHeader::decode(&bytes[..19]), None);
    Ok(())
}
