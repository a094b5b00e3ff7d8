//! The nested header-and-data exchange that brings one image over the link.

use std::io::{Read, Write};

use bytes::BytesMut;
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{info, warn};

use super::{token, wire::Link, HEADER_TERMINATOR};
use crate::arena::Arena;
use crate::config::PlatformConfig;
use crate::error::{Result, ValidationError};
use crate::validate::{validate, ImageClass, ImageHeader};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A validated image, with its payload in an arena buffer
#[derive(Debug)]
pub struct ReceivedImage {
    pub header: ImageHeader,
    pub class: ImageClass,
    pub data: BytesMut,
}

impl ReceivedImage {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn recv_header<P: Read + Write>(link: &mut Link<P>) -> Result<ImageHeader> {
    link.expect_token(token::ACK)?;

    // Every field is consumed before any failure is reported
    let magic = link.recv_hex_u32();
    let start_address = link.recv_hex_u32();
    let byte_count = link.recv_hex_u32();
    let load_address = link.recv_hex_u32();
    let terminator = link.expect_literal(HEADER_TERMINATOR);

    let header = ImageHeader {
        magic: magic?,
        start_address: start_address?,
        byte_count: byte_count?,
        load_address: load_address?,
    };
    terminator?;
    Ok(header)
}

/// Ask the host for an image, check its header, and receive its payload into `arena`.
///
/// A rejected header is answered with the matching rejection token before the error is returned.
pub fn receive_image<P: Read + Write>(
    link: &mut Link<P>,
    arena: &mut Arena,
    config: &PlatformConfig,
) -> Result<ReceivedImage> {
    link.send_token(token::SENDIMG)?;
    let header = recv_header(link)?;
    info!(
        "image header: magic {:#010x}, entry {:#010x}, {:#x} bytes, load {:#010x}",
        header.magic, header.start_address, header.byte_count, header.load_address
    );

    let class = match validate(&header, config.convention, &config.memory) {
        Ok(class) => class,
        Err(e) => {
            warn!("rejecting image: {e}");
            link.send_token(match e {
                ValidationError::BadSize { .. } => token::BADCNT,
                ValidationError::BadAddress { .. } | ValidationError::BadMagic(_) => {
                    token::BADADDR
                }
            })?;
            return Err(e.into());
        }
    };

    let mut data = arena.alloc(header.byte_count as usize)?;
    link.send_token(token::BEGIN)?;
    link.recv_exact(&mut data)?;
    link.send_token(token::DONE)?;

    info!(
        "received {:#x} bytes, crc32 {:#010x}",
        data.len(),
        CRC32.checksum(&data)
    );
    Ok(ReceivedImage {
        header,
        class,
        data,
    })
}
