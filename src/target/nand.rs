//! Host commands carried out on NAND flash.

use std::io::{Read, Write};

use log::info;

use super::{DeviceHandle, DeviceKind, FlashTarget, Geometry};
use crate::config::BootConvention;
use crate::error::{DeviceError, Result};
use crate::magic::{BIN_IMG, UBL_DMA};
use crate::nand::program::{erase_range, program_image, Placement};
use crate::nand::Nand;
use crate::protocol::{session::SessionContext, token, Command};
use crate::util::range_bytes;
use crate::validate::HeaderTemplate;

#[derive(Debug)]
pub struct NandTarget<N> {
    nand: N,
    handle: DeviceHandle,
}

impl<N: Nand> NandTarget<N> {
    pub fn new(nand: N) -> Self {
        let handle = DeviceHandle::new(DeviceKind::Nand, Geometry::Nand(nand.get_layout()));
        Self { nand, handle }
    }

    pub fn at(mut self, interface: u32, chip_select: u32, register_base: u32) -> Self {
        self.handle = self.handle.at(interface, chip_select, register_base);
        self
    }

    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    pub fn into_inner(self) -> N {
        self.nand
    }

    /// Place one received image, then report it to the host
    fn place<P: Read + Write>(
        &mut self,
        ctx: &mut SessionContext<P>,
        placement: &Placement,
        data: &[u8],
        scratch: &mut [u8],
    ) -> Result<()> {
        let copies = program_image(&mut self.nand, placement, data, scratch)?;
        info!("image placed: {copies:?}");
        ctx.progress()?;
        ctx.send(token::DONE)
    }
}

impl<N: Nand> FlashTarget for NandTarget<N> {
    fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    fn execute<P: Read + Write>(
        &mut self,
        command: Command,
        ctx: &mut SessionContext<P>,
    ) -> Result<u32> {
        let layout = self.nand.get_layout();
        let config = ctx.config.clone();
        let ranges = &config.nand;

        // Write and read-back page buffers, taken from the arena on every command
        let mut scratch = ctx.arena.alloc_erased(2 * layout.bytes_per_page)?;

        match command {
            Command::FlashNoUbl => {
                let image = ctx.receive_image()?;
                let placement = Placement::raw(ranges.raw_start, layout);
                self.place(ctx, &placement, &image.data, &mut scratch)?;
            }

            Command::Flash => {
                let ubl = ctx.receive_image()?;
                let placement = match config.convention {
                    BootConvention::Ais => Placement::raw(ranges.raw_start, layout),
                    BootConvention::Davinci => Placement::with_header(
                        HeaderTemplate::from(&ubl.header),
                        ranges.loader.clone(),
                        true,
                    )
                    .copies(ranges.copies),
                };
                self.place(ctx, &placement, &ubl.data, &mut scratch)?;

                let app = ctx.receive_image()?;
                let placement = Placement::with_header(
                    HeaderTemplate::from(&app.header),
                    ranges.application.clone(),
                    false,
                )
                .copies(ranges.copies);
                self.place(ctx, &placement, &app.data, &mut scratch)?;
            }

            Command::FlashDsp => {
                let dsp = ctx.receive_image()?;
                let placement = Placement::raw(ranges.raw_start, layout);
                self.place(ctx, &placement, &dsp.data, &mut scratch)?;

                let arm = ctx.receive_image()?;
                let placement = Placement::with_header(
                    HeaderTemplate::from(&arm.header).magic(BIN_IMG),
                    ranges.arm_loader.clone(),
                    false,
                )
                .copies(ranges.copies);
                self.place(ctx, &placement, &arm.data, &mut scratch)?;

                let app = ctx.receive_image()?;
                let placement = Placement::with_header(
                    HeaderTemplate::from(&app.header).magic(UBL_DMA),
                    ranges.uboot.clone(),
                    false,
                )
                .copies(ranges.copies);
                self.place(ctx, &placement, &app.data, &mut scratch)?;
            }

            Command::Erase => {
                if self.nand.is_write_protected()? {
                    return Err(DeviceError::WriteProtected.into());
                }

                let range = *ranges.loader.start()..=*ranges.application.end();
                let block_bytes = layout.block_size();
                let size = range_bytes(&range, block_bytes)?;
                ctx.send_size(size)?;

                let chunk_blocks = (config.erase_chunk / block_bytes).max(1) as u32;
                erase_range(&mut self.nand, range, chunk_blocks, || ctx.progress())?;
                ctx.send(token::DONE)?;
            }

            Command::Finished => {}
        }

        Ok(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::magic::{BINARY_BOOT, UBL_SAFE};
    use crate::nand::header::NandBootHeader;
    use crate::nand::{read_chain, NandBlock, PageUtil, SimFault, SimNand, TEST_LAYOUT};
    use crate::testing::{run_session, test_config, HostScript};
    use crate::validate::{ImageHeader, LOADER_LOAD_ADDRESS};

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(13) ^ seed).collect()
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
            start_address: 0x8100_0000,
            byte_count,
            load_address: 0x8100_0000,
        }
    }

    fn header_at(nand: &mut SimNand, block: u32) -> anyhow::Result<Option<NandBootHeader>> {
        let mut page = vec![0; TEST_LAYOUT.bytes_per_page];
        nand.block(block)?.unwrap().read(0, &mut page)?;
        Ok(NandBootHeader::decode(&page))
    }

    fn image_at(nand: &mut SimNand, header: &NandBootHeader, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut out = vec![0; len];
        read_chain(nand, header.start_block, header.start_page, &mut out)?;
        Ok(out)
    }

    fn image_tokens() -> [&'static str; 5] {
        [
            token::SENDIMG,
            token::BEGIN,
            token::DONE,
            token::SENDING,
            token::DONE,
        ]
    }

    #[test]
    fn test_flash_loader_and_application() -> anyhow::Result<()> {
        let ubl = payload(0x1000, 0x11);
        let uboot = payload(0x3000, 0x22);
        let script = HostScript::new()
            .start()
            .command(Command::Flash)
            .image(loader(0x1000), &ubl)
            .image(app(0x3000), &uboot)
            .command(Command::Finished)
            .build();

        let mut target = NandTarget::new(SimNand::new(TEST_LAYOUT));
        let (outcome, fields) = run_session(&mut target, test_config(), &script);
        assert_eq!(outcome?, 0);

        let mut expected = vec![token::BOOTUBL, token::DONE];
        expected.extend(image_tokens());
        expected.extend(image_tokens());
        expected.extend([token::DONE, token::DONE, token::DONE]);
        assert_eq!(fields, expected);

        let nand = target.nand_mut();
        let header = header_at(nand, 1)?.unwrap();
        assert_eq!(
            header,
            NandBootHeader {
                magic: UBL_SAFE,
                entry_point: 0x20,
                page_count: 0x1000 / TEST_LAYOUT.bytes_per_page as u32,
                start_block: 1,
                start_page: 1,
                load_address: LOADER_LOAD_ADDRESS,
            }
        );
        assert_eq!(image_at(nand, &header, ubl.len())?, ubl);

        let header = header_at(nand, 25)?.unwrap();
        assert_eq!(header.magic, BINARY_BOOT);
        assert_eq!(header.page_count, 0x30);
        assert_eq!(image_at(nand, &header, uboot.len())?, uboot);
        assert!(nand.is_locked());
        Ok(())
    }

    #[test]
    fn test_flash_no_ubl() -> anyhow::Result<()> {
        let data = payload(0x900, 0x33);
        let script = HostScript::new()
            .start()
            .command(Command::FlashNoUbl)
            .image(app(0x900), &data)
            .command(Command::Finished)
            .build();

        let mut target = NandTarget::new(SimNand::new(TEST_LAYOUT));
        let (outcome, _) = run_session(&mut target, test_config(), &script);
        assert_eq!(outcome?, 0);

        let mut out = vec![0; data.len()];
        read_chain(target.nand_mut(), 1, 0, &mut out)?;
        assert_eq!(out, data);
        Ok(())
    }

    #[test]
    fn test_flash_unified_convention() -> anyhow::Result<()> {
        let ubl = payload(0x300, 0x44);
        let uboot = payload(0x200, 0x55);
        let mut header = loader(0x300);
        header.start_address = 0;
        let script = HostScript::new()
            .start()
            .command(Command::Flash)
            .image(header, &ubl)
            .image(app(0x200), &uboot)
            .command(Command::Finished)
            .build();

        let mut config = test_config();
        config.convention = BootConvention::Ais;
        let mut target = NandTarget::new(SimNand::new(TEST_LAYOUT));
        let (outcome, _) = run_session(&mut target, config, &script);
        outcome?;

        let nand = target.nand_mut();
        let mut out = vec![0; ubl.len()];
        read_chain(nand, 1, 0, &mut out)?;
        assert_eq!(out, ubl);
        assert!(header_at(nand, 25)?.is_some());
        Ok(())
    }

    #[test]
    fn test_flash_dsp() -> anyhow::Result<()> {
        let dsp = payload(0x400, 1);
        let arm = payload(0x800, 2);
        let uboot = payload(0x1000, 3);
        let script = HostScript::new()
            .start()
            .command(Command::FlashDsp)
            .image(loader(0x400), &dsp)
            .image(app(0x800), &arm)
            .image(app(0x1000), &uboot)
            .command(Command::Finished)
            .build();

        let mut target = NandTarget::new(SimNand::new(TEST_LAYOUT));
        let (outcome, fields) = run_session(&mut target, test_config(), &script);
        outcome?;
        assert_eq!(
            fields.iter().filter(|f| f.as_str() == token::SENDING).count(),
            3
        );

        let nand = target.nand_mut();
        let header = header_at(nand, 6)?.unwrap();
        assert_eq!(header.magic, BIN_IMG);
        assert_eq!(image_at(nand, &header, arm.len())?, arm);

        let header = header_at(nand, 25)?.unwrap();
        assert_eq!(header.magic, UBL_DMA);
        assert_eq!(image_at(nand, &header, uboot.len())?, uboot);

        let mut out = vec![0; dsp.len()];
        read_chain(nand, 1, 0, &mut out)?;
        assert_eq!(out, dsp);
        Ok(())
    }

    #[test]
    fn test_bad_block_in_application_range() -> anyhow::Result<()> {
        let ubl = payload(0x100, 4);
        let uboot = payload(0x1000, 5);
        let script = HostScript::new()
            .start()
            .command(Command::Flash)
            .image(loader(0x100), &ubl)
            .image(app(0x1000), &uboot)
            .command(Command::Finished)
            .build();

        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.inject(26, SimFault::ProgramFails { from_page: 3 });
        let mut target = NandTarget::new(nand);
        let (outcome, _) = run_session(&mut target, test_config(), &script);
        outcome?;

        let nand = target.nand_mut();
        assert!(nand.block(26)?.is_none());
        let header = header_at(nand, 25)?.unwrap();
        assert_eq!(image_at(nand, &header, uboot.len())?, uboot);
        Ok(())
    }

    #[test]
    fn test_erase() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Erase)
            .command(Command::Finished)
            .build();

        let mut nand = SimNand::new(TEST_LAYOUT);
        {
            let mut block = nand.block(30)?.unwrap();
            block.program(0, &[0; 256])?;
        }
        let mut target = NandTarget::new(nand);
        let (outcome, fields) = run_session(&mut target, test_config(), &script);
        outcome?;

        let size = format!("{:08X}", 50 * TEST_LAYOUT.block_size());
        assert_eq!(
            fields,
            [
                token::BOOTUBL,
                token::DONE,
                token::SIZE,
                size.as_str(),
                token::SENDING,
                token::DONE,
                token::DONE,
                token::DONE,
                token::DONE,
            ]
        );

        let mut page = vec![0; 256];
        target.nand_mut().block(30)?.unwrap().read(0, &mut page)?;
        assert!(page.is_erased());
        Ok(())
    }

    #[test]
    fn test_write_protected() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Erase)
            .start()
            .command(Command::Finished)
            .build();

        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.set_write_protect(true);
        let mut target = NandTarget::new(nand);
        let (outcome, fields) = run_session(&mut target, test_config(), &script);
        outcome?;
        assert_eq!(
            fields,
            [
                token::BOOTUBL,
                token::DONE,
                token::FAIL,
                token::BOOTUBL,
                token::DONE,
                token::DONE,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_erase_inverted_range_fails() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Erase)
            .start()
            .command(Command::Finished)
            .build();

        let mut config = test_config();
        config.nand.loader = 40..=41;
        config.nand.application = 10..=30;
        let mut target = NandTarget::new(SimNand::new(TEST_LAYOUT));
        let (outcome, fields) = run_session(&mut target, config, &script);
        outcome?;
        assert_eq!(
            fields,
            [
                token::BOOTUBL,
                token::DONE,
                token::FAIL,
                token::BOOTUBL,
                token::DONE,
                token::DONE,
            ]
        );
        assert!(target.nand_mut().is_locked());
        Ok(())
    }

    #[test]
    fn test_exhausted_range_fails_command() {
        let script = HostScript::new()
            .start()
            .command(Command::FlashNoUbl)
            .image(app(0x100), &[0; 0x100])
            .build();

        let mut config = test_config();
        config.nand.raw_start = TEST_LAYOUT.blocks;
        let mut target = NandTarget::new(SimNand::new(TEST_LAYOUT));
        let (outcome, fields) = run_session(&mut target, config, &script);

        // The failure is reported, then the host hangs up
        assert!(matches!(outcome, Err(Error::Transport(_))));
        assert_eq!(fields.last().map(String::as_str), Some(token::FAIL));
    }
}
