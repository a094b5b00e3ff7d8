//! Magic numbers identifying boot images and boot modes.

/// Application image copied to RAM by the loader
pub const BINARY_BOOT: u32 = 0x5542_4CBB;

/// Loader image family; the low byte selects the boot mode
pub const UBL_SAFE: u32 = 0xA1AC_ED00;
pub const UBL_DMA: u32 = 0xA1AC_ED11;
pub const UBL_IC: u32 = 0xA1AC_ED22;
pub const UBL_FAST: u32 = 0xA1AC_ED33;
pub const UBL_DMA_IC: u32 = 0xA1AC_ED44;
pub const UBL_DMA_IC_FAST: u32 = 0xA1AC_ED55;

/// Binary image loaded by the secondary-core ROM
pub const BIN_IMG: u32 = 0xA1AC_ED66;

const UBL_FAMILY_MASK: u32 = 0xFFFF_FF00;

/// Does `magic` belong to the loader family (any boot mode)?
pub fn is_loader_family(magic: u32) -> bool {
    magic & UBL_FAMILY_MASK == UBL_SAFE
}

#[test]
fn test_loader_family() {
    for magic in [
        UBL_SAFE,
        UBL_DMA,
        UBL_IC,
        UBL_FAST,
        UBL_DMA_IC,
        UBL_DMA_IC_FAST,
        BIN_IMG,
    ] {
        assert!(is_loader_family(magic));
    }
    assert!(!is_loader_family(BINARY_BOOT));
    assert!(!is_loader_family(0xFFFF_FFFF));
}
