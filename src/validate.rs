//! Bounds checks on received image headers.

use crate::config::{BootConvention, MemoryMap};
use crate::error::ValidationError;

/// Load address that marks an image as the secondary loader rather than an application
pub const LOADER_LOAD_ADDRESS: u32 = 0x0000_0020;

/// The header fields as they arrive on the wire
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageHeader {
    pub magic: u32,
    pub start_address: u32,
    pub byte_count: u32,
    pub load_address: u32,
}

/// Fields of a persisted boot header that come straight from the host
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeaderTemplate {
    pub magic: u32,
    pub entry_point: u32,
    pub load_address: u32,
}

impl From<&ImageHeader> for HeaderTemplate {
    fn from(value: &ImageHeader) -> Self {
        Self {
            magic: value.magic,
            entry_point: value.start_address,
            load_address: value.load_address,
        }
    }
}

impl HeaderTemplate {
    pub fn magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ImageClass {
    Loader,
    Application,
    /// Unified boot convention: no class distinction
    Unified,
}

/// The accepted ranges for one image class
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageBounds {
    pub min_start: u32,
    pub max_start: u32,
    pub max_size: u32,
}

impl ImageHeader {
    pub fn class(&self, convention: BootConvention) -> ImageClass {
        match convention {
            BootConvention::Ais => ImageClass::Unified,
            BootConvention::Davinci if self.load_address == LOADER_LOAD_ADDRESS => {
                ImageClass::Loader
            }
            BootConvention::Davinci => ImageClass::Application,
        }
    }
}

impl ImageClass {
    pub fn bounds(self, memory: &MemoryMap) -> ImageBounds {
        match self {
            ImageClass::Loader => ImageBounds {
                min_start: LOADER_LOAD_ADDRESS,
                max_start: memory.loader_image_size(),
                max_size: memory.loader_image_size(),
            },
            ImageClass::Application => ImageBounds {
                min_start: memory.external_ram_start,
                max_start: memory
                    .external_ram_start
                    .saturating_add(memory.external_ram_size),
                max_size: memory.app_image_size(),
            },
            ImageClass::Unified => ImageBounds {
                min_start: 0,
                max_start: u32::MAX,
                max_size: u32::MAX,
            },
        }
    }
}

/// Check a received header. Size is checked before address.
pub fn validate(
    header: &ImageHeader,
    convention: BootConvention,
    memory: &MemoryMap,
) -> Result<ImageClass, ValidationError> {
    let class = header.class(convention);
    let bounds = class.bounds(memory);

    if header.byte_count == 0 || header.byte_count > bounds.max_size {
        return Err(ValidationError::BadSize {
            byte_count: header.byte_count,
            max: bounds.max_size,
        });
    }

    if !(bounds.min_start..=bounds.max_start).contains(&header.start_address) {
        return Err(ValidationError::BadAddress {
            start: header.start_address,
            min: bounds.min_start,
            max: bounds.max_start,
        });
    }

    Ok(class)
}
