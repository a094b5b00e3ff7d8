//! Host commands carried out on SD/MMC cards.

use std::io::{Read, Write};

use log::info;

use super::{DeviceHandle, DeviceKind, FlashTarget, Geometry};
use crate::error::{Error, Result};
use crate::protocol::image::ReceivedImage;
use crate::protocol::{session::SessionContext, token, Command};
use crate::sdmmc::{erase_blocks, write_image, BlockDevice, BLOCK_SIZE};
use crate::util::range_bytes;
use crate::validate::HeaderTemplate;

#[derive(Debug)]
pub struct SdTarget<D> {
    card: D,
    handle: DeviceHandle,
}

impl<D: BlockDevice> SdTarget<D> {
    pub fn new(card: D) -> Self {
        let geometry = Geometry::Sdmmc {
            blocks: card.block_count(),
        };
        Self {
            card,
            handle: DeviceHandle::new(DeviceKind::Sdmmc, geometry),
        }
    }

    pub fn at(mut self, interface: u32, chip_select: u32, register_base: u32) -> Self {
        self.handle = self.handle.at(interface, chip_select, register_base);
        self
    }

    pub fn card_mut(&mut self) -> &mut D {
        &mut self.card
    }

    pub fn into_inner(self) -> D {
        self.card
    }

    /// Write `image` behind a header at `header_block`, keeping clear of `limit` if given
    fn place<P: Read + Write>(
        &mut self,
        ctx: &mut SessionContext<P>,
        image: &ReceivedImage,
        header_block: u32,
        limit: Option<u32>,
    ) -> Result<()> {
        let blocks = image.len().div_ceil(BLOCK_SIZE) as u32;
        let end = header_block + blocks;
        if end >= limit.unwrap_or(u32::MAX) || end >= self.card.block_count() {
            return Err(Error::PlacementExhausted {
                start: header_block,
                end,
            });
        }

        let chunk_blocks = (ctx.config.write_chunk / BLOCK_SIZE) as u32;
        let header = write_image(
            &mut self.card,
            header_block,
            HeaderTemplate::from(&image.header),
            &image.data,
            chunk_blocks,
            || ctx.progress(),
        )?;
        info!("image written: {header:x?}");
        ctx.send(token::DONE)
    }
}

impl<D: BlockDevice> FlashTarget for SdTarget<D> {
    fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    fn execute<P: Read + Write>(
        &mut self,
        command: Command,
        ctx: &mut SessionContext<P>,
    ) -> Result<u32> {
        let sdmmc = ctx.config.sdmmc.clone();

        match command {
            Command::FlashNoUbl => {
                let image = ctx.receive_image()?;
                self.place(ctx, &image, sdmmc.application_block, None)?;
            }
            Command::Flash => {
                let ubl = ctx.receive_image()?;
                self.place(ctx, &ubl, sdmmc.loader_block, Some(sdmmc.application_block))?;

                let app = ctx.receive_image()?;
                self.place(ctx, &app, sdmmc.application_block, None)?;
            }
            Command::Erase => {
                let size = range_bytes(&sdmmc.search, BLOCK_SIZE)?;
                ctx.send_size(size)?;

                let chunk_blocks = (ctx.config.erase_chunk / BLOCK_SIZE) as u32;
                erase_blocks(&mut self.card, sdmmc.search, chunk_blocks, || {
                    ctx.progress()
                })?;
                ctx.send(token::DONE)?;
            }
            Command::FlashDsp => return Err(Error::UnsupportedCommand(command.word())),
            Command::Finished => {}
        }

        Ok(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::boot::{boot_from_sdmmc, RamWindow};
    use crate::magic::{BINARY_BOOT, UBL_SAFE};
    use crate::sdmmc::{SdBootHeader, SimCard};
    use crate::testing::{run_session, test_config, HostScript};
    use crate::validate::{ImageHeader, LOADER_LOAD_ADDRESS};

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(13) ^ seed).collect()
    }

    fn loader(byte_count: u32) -> ImageHeader {
        ImageHeader {
            magic: UBL_SAFE,
            start_address: 0x100,
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

    fn header_at(card: &mut SimCard, block: u32) -> anyhow::Result<SdBootHeader> {
        let mut buf = [0u8; BLOCK_SIZE];
        card.read_blocks(block, &mut buf)?;
        SdBootHeader::decode(&buf).ok_or(anyhow::anyhow!("no header at block {block}"))
    }

    #[test]
    fn test_flash_then_boot() -> anyhow::Result<()> {
        let ubl = payload(0x2100, 1);
        let uboot = payload(0x3000, 2);
        let script = HostScript::new()
            .start()
            .command(Command::Flash)
            .image(loader(0x2100), &ubl)
            .image(app(0x3000), &uboot)
            .command(Command::Finished)
            .build();

        let mut target = SdTarget::new(SimCard::new(0x400));
        let (outcome, fields) = run_session(&mut target, test_config(), &script);
        assert_eq!(outcome?, 0);

        // 0x2100 bytes is three 8-block chunks, 0x3000 is three
        let sending = fields.iter().filter(|f| *f == token::SENDING).count();
        assert_eq!(sending, 6);

        let card = target.card_mut();
        let header = header_at(card, 1)?;
        assert_eq!(header.block_count, 17);
        assert_eq!(header.start_block, 2);
        assert_eq!(header.entry_point, 0x100);

        let header = header_at(card, 0x100)?;
        assert_eq!(header.magic, BINARY_BOOT);
        assert_eq!(header.start_block, 0x101);

        let mut ram = RamWindow::new(0, 0x8000);
        let image = boot_from_sdmmc(card, &test_config().sdmmc, &mut ram)?;
        assert_eq!(image.magic, UBL_SAFE);
        assert_eq!(image.entry_point, 0x100);
        assert_eq!(ram.as_bytes()[0x20..0x20 + ubl.len()], ubl[..]);
        Ok(())
    }

    #[test]
    fn test_flash_no_ubl() -> anyhow::Result<()> {
        let data = payload(0x400, 3);
        let script = HostScript::new()
            .start()
            .command(Command::FlashNoUbl)
            .image(app(0x400), &data)
            .command(Command::Finished)
            .build();

        let mut target = SdTarget::new(SimCard::new(0x400));
        let (outcome, _) = run_session(&mut target, test_config(), &script);
        outcome?;

        let card = target.card_mut();
        assert_eq!(header_at(card, 0x100)?.block_count, 2);
        let mut buf = vec![0u8; 2 * BLOCK_SIZE];
        card.read_blocks(0x101, &mut buf)?;
        assert_eq!(buf[..data.len()], data[..]);
        Ok(())
    }

    #[test]
    fn test_erase() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Erase)
            .command(Command::Finished)
            .build();

        let mut card = SimCard::new(0x400);
        card.write_blocks(0x10, &[0u8; BLOCK_SIZE])?;
        let mut target = SdTarget::new(card);
        let (outcome, fields) = run_session(&mut target, test_config(), &script);
        outcome?;

        assert_eq!(
            fields,
            [
                token::BOOTUBL,
                token::DONE,
                token::SIZE,
                "00040000",
                token::SENDING,
                token::SENDING,
                token::DONE,
                token::DONE,
                token::DONE,
                token::DONE,
            ]
        );

        let mut buf = [0u8; BLOCK_SIZE];
        target.card_mut().read_blocks(0x10, &mut buf)?;
        assert!(buf.iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn test_erase_inverted_search_fails() -> anyhow::Result<()> {
        let script = HostScript::new()
            .start()
            .command(Command::Erase)
            .start()
            .command(Command::Finished)
            .build();

        let mut config = test_config();
        config.sdmmc.search = 0x20..=0x10;
        let mut target = SdTarget::new(SimCard::new(0x400));
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
        Ok(())
    }

    #[test]
    fn test_no_dsp_variant() {
        let script = HostScript::new()
            .start()
            .command(Command::FlashDsp)
            .build();

        let mut target = SdTarget::new(SimCard::new(0x400));
        let (_, fields) = run_session(&mut target, test_config(), &script);
        assert_eq!(fields, [token::BOOTUBL, token::DONE, token::FAIL]);
    }

    #[test]
    fn test_card_too_small() {
        let script = HostScript::new()
            .start()
            .command(Command::FlashNoUbl)
            .image(app(0x400), &payload(0x400, 4))
            .build();

        let mut target = SdTarget::new(SimCard::new(0x101));
        let (_, fields) = run_session(&mut target, test_config(), &script);
        assert_eq!(fields.last().map(String::as_str), Some(token::FAIL));
    }
}
