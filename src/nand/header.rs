//! The boot header stored in page 0 of the first block of a NAND image copy.

use deku::prelude::*;

use super::PageUtil;

/// Page-0 record telling the ROM (or the loader) where the image lives
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct NandBootHeader {
    pub magic: u32,
    pub entry_point: u32,
    pub page_count: u32,
    pub start_block: u32,
    pub start_page: u32,
    pub load_address: u32,
}

impl NandBootHeader {
    pub const SIZE: usize = 24;

    /// Parse a header from the start of a page, rejecting erased pages
    pub fn decode(page: &[u8]) -> Option<Self> {
        let bytes = page.get(..Self::SIZE)?;
        if bytes.is_erased() {
            return None;
        }
        let (_, header) = Self::from_bytes((bytes, 0)).ok()?;
        Some(header)
    }

    /// Fill `page` with the erased pattern, then write the header at its start
    pub fn encode(&self, page: &mut [u8]) -> anyhow::Result<()> {
        let bytes = self.to_bytes()?;
        page.fill(0xFF);
        let out_bytes = page
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("page too small for boot header"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

#[test]
fn test_header_layout() -> anyhow::Result<()> {
    let header = NandBootHeader {
        magic: 0xA1AC_ED00,
        entry_point: 0x0000_0100,
        page_count: 3,
        start_block: 7,
        start_page: 1,
        load_address: 0x20,
    };

    let mut page = [0u8; 64];
    header.encode(&mut page)?;
    assert_eq!(page[..8], [0x00, 0xED, 0xAC, 0xA1, 0x00, 0x01, 0x00, 0x00]);
    assert_eq!(page[12..16], [7, 0, 0, 0]);
    assert!(page[NandBootHeader::SIZE..].is_erased());

    assert_eq!(NandBootHeader::decode(&page), Some(header));
    assert_eq!(NandBootHeader::decode(&[0xFF; 64]), None);
    Ok(())
}
