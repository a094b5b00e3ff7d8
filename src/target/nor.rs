//! Host commands carried out on NOR flash and SPI memories.

use std::io::{Read, Write};

use bytes::BytesMut;
use log::info;

use super::{DeviceHandle, DeviceKind, FlashTarget, Geometry};
use crate::config::BootConvention;
use crate::error::{DeviceError, Error, Result};
use crate::nor::header::{NorBootHeader, SpiBootHeader};
use crate::nor::program::{erase_chunked, erase_region, program_region, verify_erased, write_chunked};
use crate::nor::NorFlash;
use crate::protocol::image::ReceivedImage;
use crate::protocol::{session::SessionContext, token, Command};

/// Which flavor of linear memory is attached
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NorKind {
    /// Parallel NOR, mapped into the address space; write failures are final
    Nor,

    /// SPI flash; everything written is read back and compared
    Spi,
}

#[derive(Debug)]
pub struct NorTarget<F> {
    flash: F,
    kind: NorKind,
    handle: DeviceHandle,
}

impl<F: NorFlash> NorTarget<F> {
    pub fn new(flash: F, kind: NorKind) -> Self {
        let device = match kind {
            NorKind::Nor => DeviceKind::Nor,
            NorKind::Spi => DeviceKind::Spi,
        };
        let handle = DeviceHandle::new(device, Geometry::Nor(flash.geometry()));
        Self {
            flash,
            kind,
            handle,
        }
    }

    pub fn at(mut self, interface: u32, chip_select: u32, register_base: u32) -> Self {
        self.handle = self.handle.at(interface, chip_select, register_base);
        self
    }

    pub fn kind(&self) -> NorKind {
        self.kind
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    /// Erase, write in chunks (reporting each), verify on SPI, and finish with DONE
    fn program<P: Read + Write>(
        &mut self,
        ctx: &mut SessionContext<P>,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        let chunk = ctx.config.write_chunk;
        let mut readback = match self.kind {
            NorKind::Spi => Some(ctx.arena.alloc(data.len())?),
            NorKind::Nor => None,
        };

        program_region(
            &mut self.flash,
            offset,
            data,
            chunk,
            readback.as_deref_mut(),
            || ctx.progress(),
        )?;
        ctx.send(token::DONE)
    }

    /// Assemble an SPI boot header and the payload into one arena buffer
    fn with_spi_header<P: Read + Write>(
        ctx: &mut SessionContext<P>,
        image: &ReceivedImage,
        offset: u32,
    ) -> Result<BytesMut> {
        let header = SpiBootHeader {
            magic: image.header.magic,
            entry_point: image.header.start_address,
            app_size: image.header.byte_count,
            mem_address: offset + SpiBootHeader::SIZE as u32,
            load_address: image.header.load_address,
        };
        let mut buf = ctx.arena.alloc(SpiBootHeader::SIZE + image.len())?;
        buf[..SpiBootHeader::SIZE].copy_from_slice(&header.encode()?);
        buf[SpiBootHeader::SIZE..].copy_from_slice(&image.data);
        Ok(buf)
    }

    fn flash_nor<P: Read + Write>(&mut self, ctx: &mut SessionContext<P>) -> Result<()> {
        let ubl = ctx.receive_image()?;
        self.program(ctx, 0, &ubl.data)?;

        // The application goes in the block after the one holding the end of the loader
        let geometry = self.flash.geometry();
        let (block, block_size) = geometry
            .block_containing(ubl.len() as u32)
            .ok_or(DeviceError::WriteFailed(ubl.len() as u32))?;
        let offset = block + block_size;

        let app = ctx.receive_image()?;
        let header = NorBootHeader {
            magic: app.header.magic,
            entry_point: app.header.start_address,
            app_size: app.header.byte_count,
            load_address: app.header.load_address,
        };
        info!("application header at {offset:#x}: {header:x?}");

        erase_region(
            &mut self.flash,
            offset,
            (NorBootHeader::SIZE + app.len()) as u32,
        )?;
        self.flash
            .write(offset, &header.encode()?)
            .map_err(|_| DeviceError::WriteFailed(offset))?;
        write_chunked(
            &mut self.flash,
            offset + NorBootHeader::SIZE as u32,
            &app.data,
            ctx.config.write_chunk,
            || ctx.progress(),
        )?;
        ctx.send(token::DONE)
    }

    fn flash_spi<P: Read + Write>(&mut self, ctx: &mut SessionContext<P>) -> Result<()> {
        let ubl = ctx.receive_image()?;
        match ctx.config.convention {
            BootConvention::Ais => self.program(ctx, 0, &ubl.data)?,
            BootConvention::Davinci => {
                let buf = Self::with_spi_header(ctx, &ubl, 0)?;
                self.program(ctx, 0, &buf)?;
            }
        }

        let offset = self.flash.geometry().block_size;
        let app = ctx.receive_image()?;
        let buf = Self::with_spi_header(ctx, &app, offset)?;
        self.program(ctx, offset, &buf)
    }

    fn flash_dsp<P: Read + Write>(&mut self, ctx: &mut SessionContext<P>) -> Result<()> {
        let offsets = ctx.config.spi;

        let dsp = ctx.receive_image()?;
        self.program(ctx, 0, &dsp.data)?;

        let arm = ctx.receive_image()?;
        self.program(ctx, offsets.arm_loader, &arm.data)?;

        let app = ctx.receive_image()?;
        let buf = Self::with_spi_header(ctx, &app, offsets.application)?;
        self.program(ctx, offsets.application, &buf)
    }

    fn erase<P: Read + Write>(&mut self, ctx: &mut SessionContext<P>) -> Result<()> {
        let size = self.flash.geometry().size;
        ctx.send_size(size)?;

        let chunk = ctx.config.erase_chunk as u32;
        erase_chunked(&mut self.flash, chunk, || ctx.progress())?;

        if self.kind == NorKind::Spi {
            let mut scratch = ctx.arena.alloc(ctx.config.write_chunk)?;
            verify_erased(&mut self.flash, &mut scratch)?;
        }
        ctx.send(token::DONE)
    }
}

impl<F: NorFlash> FlashTarget for NorTarget<F> {
    fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    fn execute<P: Read + Write>(
        &mut self,
        command: Command,
        ctx: &mut SessionContext<P>,
    ) -> Result<u32> {
        match (command, self.kind) {
            (Command::FlashNoUbl, kind) => {
                let image = ctx.receive_image()?;
                self.program(ctx, 0, &image.data)?;

                // Parallel NOR executes in place
                return Ok(match kind {
                    NorKind::Nor => self.flash.geometry().base,
                    NorKind::Spi => 0,
                });
            }
            (Command::Flash, NorKind::Nor) => self.flash_nor(ctx)?,
            (Command::Flash, NorKind::Spi) => self.flash_spi(ctx)?,
            (Command::FlashDsp, NorKind::Spi) => self.flash_dsp(ctx)?,
            (Command::FlashDsp, NorKind::Nor) => {
                return Err(Error::UnsupportedCommand(command.word()))
            }
            (Command::Erase, _) => self.erase(ctx)?,
            (Command::Finished, _) => {}
        }

        Ok(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::boot::{boot_from_nor, RamWindow};
    use crate::magic::{BINARY_BOOT, UBL_SAFE};
    use crate::nor::{SimNor, SimNorFault, TEST_GEOMETRY};
    use crate::testing::{run_session, test_config, HostScript};
    use crate::validate::{ImageHeader, LOADER_LOAD_ADDRESS};

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(29) ^ seed).collect()
    }

    fn loader(byte_count: u32) -> ImageHeader {
        ImageHeader {
            magic: UBL_SAFE,
            start_address: 0x20,
            byte_count,
            load_address: LOADER_LOAD_ADDRESS,
        }
    }

    fn app(byte_count: u32) -> ImageHeader {
        ImageHeader {
            magic: BINARY_BOOT,
            start_address: 0x8100_0040,
            byte_count,
            load_address: 0x8100_0000,
        }
    }

    fn read(nor: &mut SimNor, offset: u32, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut out = vec![0; len];
        nor.read(offset, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_nor_flash_then_boot() -> anyhow::Result<()> {
        let ubl = payload(0x2345, 1);
        let uboot = payload(0x5000, 2);
        let script = HostScript::new()
            .start()
            .command(Command::Flash)
            .image(loader(0x2345), &ubl)
            .image(app(0x5000), &uboot)
            .command(Command::Finished)
            .build();

        let mut target = NorTarget::new(SimNor::new(TEST_GEOMETRY), NorKind::Nor);
        let (outcome, fields) = run_session(&mut target, test_config(), &script);
        assert_eq!(outcome?, 0);
        assert_eq!(
            fields,
            [
                token::BOOTUBL,
                token::DONE,
                token::SENDIMG,
                token::BEGIN,
                token::DONE,
                token::SENDING,
                token::SENDING,
                token::SENDING,
                token::DONE,
                token::SENDIMG,
                token::BEGIN,
                token::DONE,
                token::SENDING,
                token::SENDING,
                token::SENDING,
                token::SENDING,
                token::SENDING,
                token::DONE,
                token::DONE,
                token::DONE,
                token::DONE,
            ]
        );

        let nor = target.flash_mut();
        assert_eq!(read(nor, 0, ubl.len())?, ubl);

        let mut ram = RamWindow::new(0x8100_0000, 0x8000);
        let image = boot_from_nor(nor, &test_config().memory, &mut ram)?;
        assert_eq!(image.entry_point, 0x8100_0040);
        assert_eq!(ram.as_bytes()[..uboot.len()], uboot[..]);
        Ok(())
    }

    #[test]
    fn test_nor_execute_in_place() -> anyhow::Result<()> {
        let data = payload(0x1800, 3);
        let script = HostScript::new()
            .start()
            .command(Command::FlashNoUbl)
            .image(app(0x1800), &data)
            .command(Command::Finished)
            .build();

        let mut target = NorTarget::new(SimNor::new(TEST_GEOMETRY), NorKind::Nor);
        let (outcome, _) = run_session(&mut target, test_config(), &script);
        assert_eq!(outcome?, TEST_GEOMETRY.base);
        assert_eq!(read(target.flash_mut(), 0, data.len())?, data);
        Ok(())
    }

    #[test]
    fn test_nor_erase() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Erase)
            .command(Command::Finished)
            .build();

        let mut nor = SimNor::new(TEST_GEOMETRY);
        nor.write(0x3_0000, &[0; 0x100])?;
        let mut target = NorTarget::new(nor, NorKind::Nor);
        let (outcome, fields) = run_session(&mut target, test_config(), &script);
        outcome?;

        let chunks = (TEST_GEOMETRY.size / 0x2_0000) as usize;
        let size = format!("{:08X}", TEST_GEOMETRY.size);
        let mut expected = vec![token::BOOTUBL, token::DONE, token::SIZE, size.as_str()];
        expected.extend(std::iter::repeat(token::SENDING).take(chunks));
        expected.extend([token::DONE, token::DONE, token::DONE, token::DONE]);
        assert_eq!(fields, expected);

        let contents = read(target.flash_mut(), 0, TEST_GEOMETRY.size as usize)?;
        assert!(contents.iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn test_nor_write_failure() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::FlashNoUbl)
            .image(app(0x3000), &payload(0x3000, 4))
            .build();

        let mut nor = SimNor::new(TEST_GEOMETRY);
        nor.inject(SimNorFault::WriteFails { at: 0x1800 });
        let mut target = NorTarget::new(nor, NorKind::Nor);
        let (_, fields) = run_session(&mut target, test_config(), &script);

        let tail: Vec<&str> = fields.iter().rev().take(2).map(String::as_str).collect();
        assert_eq!(tail, [token::FAIL, token::SENDING]);
        Ok(())
    }

    #[test]
    fn test_spi_flash_headers() -> anyhow::Result<()> {
        let ubl = payload(0x1000, 5);
        let uboot = payload(0x2000, 6);
        let script = HostScript::new()
            .start()
            .command(Command::Flash)
            .image(loader(0x1000), &ubl)
            .image(app(0x2000), &uboot)
            .command(Command::Finished)
            .build();

        let mut target = NorTarget::new(SimNor::new(TEST_GEOMETRY), NorKind::Spi);
        let (outcome, _) = run_session(&mut target, test_config(), &script);
        outcome?;

        let nor = target.flash_mut();
        let header = SpiBootHeader::decode(&read(nor, 0, SpiBootHeader::SIZE)?).unwrap();
        assert_eq!(header.magic, UBL_SAFE);
        assert_eq!(header.mem_address, SpiBootHeader::SIZE as u32);
        assert_eq!(read(nor, header.mem_address, ubl.len())?, ubl);

        let block = TEST_GEOMETRY.block_size;
        let header = SpiBootHeader::decode(&read(nor, block, SpiBootHeader::SIZE)?).unwrap();
        assert_eq!(header.app_size, 0x2000);
        assert_eq!(header.mem_address, block + SpiBootHeader::SIZE as u32);
        assert_eq!(read(nor, header.mem_address, uboot.len())?, uboot);
        Ok(())
    }

    #[test]
    fn test_spi_unified_loader_is_raw() -> anyhow::Result<()> {
        let ubl = payload(0x800, 7);
        let script = HostScript::new()
            .start()
            .command(Command::Flash)
            .image(loader(0x800), &ubl)
            .image(app(0x100), &payload(0x100, 8))
            .command(Command::Finished)
            .build();

        let mut config = test_config();
        config.convention = BootConvention::Ais;
        let mut target = NorTarget::new(SimNor::new(TEST_GEOMETRY), NorKind::Spi);
        let (outcome, _) = run_session(&mut target, config, &script);
        outcome?;
        assert_eq!(read(target.flash_mut(), 0, ubl.len())?, ubl);
        Ok(())
    }

    #[test]
    fn test_spi_flash_dsp() -> anyhow::Result<()> {
        let dsp = payload(0x1000, 9);
        let arm = payload(0x3000, 10);
        let uboot = payload(0x4000, 11);
        let script = HostScript::new()
            .start()
            .command(Command::FlashDsp)
            .image(loader(0x1000), &dsp)
            .image(app(0x3000), &arm)
            .image(app(0x4000), &uboot)
            .command(Command::Finished)
            .build();

        // Images this close together need a fine erase granularity
        let geometry = crate::nor::NorGeometry {
            block_size: 0x1000,
            ..TEST_GEOMETRY
        };
        let mut target = NorTarget::new(SimNor::new(geometry), NorKind::Spi);
        let (outcome, _) = run_session(&mut target, test_config(), &script);
        outcome?;

        let nor = target.flash_mut();
        assert_eq!(read(nor, 0, dsp.len())?, dsp);
        assert_eq!(read(nor, 0x2000, arm.len())?, arm);
        let header = SpiBootHeader::decode(&read(nor, 0x8000, SpiBootHeader::SIZE)?).unwrap();
        assert_eq!(header.mem_address, 0x8000 + SpiBootHeader::SIZE as u32);
        assert_eq!(read(nor, header.mem_address, uboot.len())?, uboot);
        Ok(())
    }

    #[test]
    fn test_spi_verify_failure() {
        let script = HostScript::new()
            .start()
            .command(Command::FlashNoUbl)
            .image(app(0x2000), &payload(0x2000, 12))
            .build();

        let mut nor = SimNor::new(TEST_GEOMETRY);
        nor.inject(SimNorFault::Corrupts { at: 0x1F00 });
        let mut target = NorTarget::new(nor, NorKind::Spi);
        let (_, fields) = run_session(&mut target, test_config(), &script);

        // Both chunks go out before the read-back catches the corruption
        let tail: Vec<&str> = fields.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(tail, [token::FAIL, token::SENDING, token::SENDING]);
    }

    #[test]
    fn test_spi_erase_verifies() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Erase)
            .command(Command::Finished)
            .build();

        let mut target = NorTarget::new(SimNor::new(TEST_GEOMETRY), NorKind::Spi);
        let (outcome, fields) = run_session(&mut target, test_config(), &script);
        outcome?;
        assert_eq!(fields[2], token::SIZE);
        Ok(())
    }

    #[test]
    fn test_spi_erase_scratch_from_arena() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Erase)
            .start()
            .command(Command::Finished)
            .build();

        // Too small for the verify buffer, so the erase is reported as failed
        let mut config = test_config();
        config.arena_size = config.write_chunk - 1;
        let mut target = NorTarget::new(SimNor::new(TEST_GEOMETRY), NorKind::Spi);
        let (outcome, fields) = run_session(&mut target, config.clone(), &script);
        outcome?;
        assert!(fields.iter().any(|f| f == token::SIZE));
        assert!(fields.iter().any(|f| f == token::FAIL));

        // Parallel NOR does not verify, so it needs no arena
        let mut target = NorTarget::new(SimNor::new(TEST_GEOMETRY), NorKind::Nor);
        let (outcome, fields) = run_session(&mut target, config, &script);
        outcome?;
        assert!(!fields.iter().any(|f| f == token::FAIL));
        Ok(())
    }

    #[test]
    fn test_spi_arena_accumulates() -> anyhow::Result<()> {
        let data = payload(0x4000, 13);
        let script = HostScript::new()
            .start()
            .command(Command::FlashNoUbl)
            .image(app(0x4000), &data)
            .command(Command::FlashNoUbl)
            .image(app(0x4000), &data)
            .start()
            .command(Command::Finished)
            .build();

        // Room for one image and its read-back copy, not two
        let mut config = test_config();
        config.arena_size = 0x9000;
        let mut target = NorTarget::new(SimNor::new(TEST_GEOMETRY), NorKind::Spi);
        let (outcome, fields) = run_session(&mut target, config, &script);
        outcome?;
        assert!(fields.iter().any(|f| f == token::FAIL));
        Ok(())
    }
}
