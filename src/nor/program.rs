//! Linear erase/write/verify on NOR and SPI memories. There are no bad blocks here, so any
//! failure is final.

use log::{debug, info, warn};

use super::NorFlash;
use crate::error::{DeviceError, Result};

/// Erase exactly the blocks covering `offset..offset + len`
pub fn erase_region<F: NorFlash>(flash: &mut F, offset: u32, len: u32) -> Result<()> {
    debug!("erasing {len:#x} bytes at {offset:#x}");
    flash.erase(offset, len).map_err(|e| {
        warn!("erase at {offset:#x} failed: {e:#}");
        DeviceError::EraseFailed(offset)
    })?;
    Ok(())
}

/// Write `data` at `offset` in `chunk`-byte pieces, calling `on_chunk` after each one
pub fn write_chunked<F, C>(
    flash: &mut F,
    offset: u32,
    data: &[u8],
    chunk: usize,
    mut on_chunk: C,
) -> Result<()>
where
    F: NorFlash,
    C: FnMut() -> Result<()>,
{
    let rpt = howudoin::new()
        .label("Writing flash")
        .set_len(data.len().div_ceil(chunk.max(1)) as u64);

    let mut at = offset;
    for piece in data.chunks(chunk.max(1)) {
        if let Err(e) = flash.write(at, piece) {
            warn!("write at {at:#x} failed: {e:#}");
            rpt.close();
            return Err(DeviceError::WriteFailed(at).into());
        }
        at += piece.len() as u32;
        rpt.inc();
        on_chunk()?;
    }

    rpt.close();
    Ok(())
}

/// Read back `offset..offset + expected.len()` through `scratch` and compare
pub fn verify<F: NorFlash>(
    flash: &mut F,
    offset: u32,
    expected: &[u8],
    scratch: &mut [u8],
) -> Result<()> {
    let step = scratch.len().max(1);
    let mut at = offset;
    for piece in expected.chunks(step) {
        let readback = &mut scratch[..piece.len()];
        flash.read(at, readback)?;
        if let Some(i) = readback.iter().zip(piece).position(|(a, b)| a != b) {
            warn!("verify mismatch at {:#x}", at as usize + i);
            return Err(DeviceError::VerifyMismatch(at + i as u32).into());
        }
        at += piece.len() as u32;
    }

    debug!("verified {:#x} bytes at {offset:#x}", expected.len());
    Ok(())
}

/// Erase the covering region, write `data` in chunks, and optionally read it all back
pub fn program_region<F, C>(
    flash: &mut F,
    offset: u32,
    data: &[u8],
    chunk: usize,
    verify_with: Option<&mut [u8]>,
    on_chunk: C,
) -> Result<()>
where
    F: NorFlash,
    C: FnMut() -> Result<()>,
{
    info!("programming {:#x} bytes at {offset:#x}", data.len());
    erase_region(flash, offset, data.len() as u32)?;
    write_chunked(flash, offset, data, chunk, on_chunk)?;
    if let Some(scratch) = verify_with {
        verify(flash, offset, data, scratch)?;
    }
    Ok(())
}

/// Erase the whole device in `chunk`-byte pieces, calling `on_chunk` after each one
pub fn erase_chunked<F, C>(flash: &mut F, chunk: u32, mut on_chunk: C) -> Result<()>
where
    F: NorFlash,
    C: FnMut() -> Result<()>,
{
    let size = flash.geometry().size;
    let chunk = chunk.max(1);
    let rpt = howudoin::new()
        .label("Erasing flash")
        .set_len(u64::from(size.div_ceil(chunk)));

    let mut at = 0;
    while at < size {
        let len = chunk.min(size - at);
        if let Err(e) = erase_region(flash, at, len) {
            rpt.close();
            return Err(e);
        }
        rpt.inc();
        on_chunk()?;
        at += len;
    }

    rpt.close();
    Ok(())
}

/// Confirm every byte of the device reads back erased
pub fn verify_erased<F: NorFlash>(flash: &mut F, scratch: &mut [u8]) -> Result<()> {
    let size = flash.geometry().size;
    let step = scratch.len().max(1) as u32;

    let mut at = 0;
    while at < size {
        let len = step.min(size - at);
        let readback = &mut scratch[..len as usize];
        flash.read(at, readback)?;
        if let Some(i) = readback.iter().position(|&x| x != 0xFF) {
            warn!("byte at {:#x} not erased", at as usize + i);
            return Err(DeviceError::VerifyMismatch(at + i as u32).into());
        }
        at += len;
    }

    Ok(())
}
