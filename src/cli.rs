//! Argument parsing and device selection shared by the `sft` and `ubl` binaries.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use log::info;
use retry::{delay::Fixed, retry};

use crate::boot::{boot_from_nand, boot_from_nor, boot_from_sdmmc, BootImage, Ram};
use crate::config::{BootConvention, PlatformConfig};
use crate::error::{Error, Result};
#[cfg(target_os = "linux")]
use crate::nand::mtd::MtdNand;
use crate::nand::{NandLayout, SimNand};
#[cfg(target_os = "linux")]
use crate::nor::mtd::MtdNor;
use crate::nor::{NorFlash, NorGeometry, SimNor};
use crate::protocol::session::SessionContext;
use crate::sdmmc::FileCard;
use crate::target::nand::NandTarget;
use crate::target::nor::{NorKind, NorTarget};
use crate::target::sdmmc::SdTarget;
use crate::target::FlashTarget;
use crate::util::parse_number;

const OPEN_RETRY_MS: u64 = 100;
const OPEN_RETRIES: usize = 10;

#[derive(Args, Debug)]
#[group(required = true)]
pub struct DeviceOptions {
    /// Name of the MTD NAND device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "device")]
    nand_mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` NAND device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "device")]
    nand_mtd_dev: Option<PathBuf>,

    /// Path to a `/dev/mtdX` NOR or SPI-NOR device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "device")]
    nor_mtd_dev: Option<PathBuf>,

    /// Layout of a NAND to simulate, as BLOCKSxPAGESxBYTES[xSPARE]
    #[clap(long, group = "device")]
    nand_sim: Option<NandLayout>,

    /// Geometry of a NOR to simulate, as SIZE,BLOCKSIZE[@BASE]
    #[clap(long, group = "device")]
    nor_sim: Option<NorGeometry>,

    /// Path to an SD/MMC card, or a card image
    #[clap(long, group = "device")]
    sdcard: Option<PathBuf>,

    /// Treat the NOR device as SPI memory
    #[clap(long)]
    spi: bool,

    /// Address the NOR device is mapped at
    #[clap(long, value_parser = parse_number)]
    nor_base: Option<u32>,

    /// Image file backing the simulated device
    #[clap(long)]
    sim_path: Option<PathBuf>,

    /// Write back the simulated device's image when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl DeviceOptions {
    fn nor_kind(&self) -> NorKind {
        match self.spi {
            true => NorKind::Spi,
            false => NorKind::Nor,
        }
    }

    pub fn open(&self) -> anyhow::Result<Device> {
        let device = if let Some(layout) = self.nand_sim {
            let mut sim = SimNand::new(layout);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            Device::SimNand(NandTarget::new(sim))
        } else if let Some(mut geometry) = self.nor_sim {
            if let Some(base) = self.nor_base {
                geometry.base = base;
            }
            let mut sim = SimNor::new(geometry);
            if let Some(path) = &self.sim_path {
                sim.load(&mut File::open(path)?)?;
            }

            Device::SimNor(NorTarget::new(sim, self.nor_kind()))
        } else if let Some(path) = &self.sdcard {
            let card = retry(Fixed::from_millis(OPEN_RETRY_MS).take(OPEN_RETRIES), || {
                FileCard::open(path)
            })
            .map_err(|e| e.error)
            .with_context(|| path.display().to_string())?;

            Device::Card(SdTarget::new(card))
        } else {
            #[cfg(target_os = "linux")]
            {
                self.open_mtd()?
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        info!("opened {}", device.describe());
        Ok(device)
    }

    #[cfg(target_os = "linux")]
    fn open_mtd(&self) -> anyhow::Result<Device> {
        let open_retry = || Fixed::from_millis(OPEN_RETRY_MS).take(OPEN_RETRIES);

        let device = if let Some(name) = &self.nand_mtd_name {
            let nand = retry(open_retry(), || MtdNand::open_named(name))
                .map_err(|e| e.error)
                .context(name.clone())?;
            Device::MtdNand(NandTarget::new(nand))
        } else if let Some(dev) = &self.nand_mtd_dev {
            let nand = retry(open_retry(), || MtdNand::open(dev))
                .map_err(|e| e.error)
                .with_context(|| dev.display().to_string())?;
            Device::MtdNand(NandTarget::new(nand))
        } else if let Some(dev) = &self.nor_mtd_dev {
            let base = self.nor_base.unwrap_or(0);
            let nor = retry(open_retry(), || MtdNor::open(dev, base))
                .map_err(|e| e.error)
                .with_context(|| dev.display().to_string())?;
            Device::MtdNor(NorTarget::new(nor, self.nor_kind()))
        } else {
            unreachable!()
        };

        Ok(device)
    }

    pub fn cleanup(&self, device: Device) -> anyhow::Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                match device {
                    Device::SimNand(target) => {
                        target.into_inner().save(&mut File::create(path)?)?;
                    }
                    Device::SimNor(target) => {
                        target.into_inner().save(&mut File::create(path)?)?;
                    }
                    _ => (),
                }
            }
        }

        Ok(())
    }
}

/// Options describing the part being served
#[derive(Args, Debug)]
pub struct PlatformOptions {
    /// Boot convention of the ROM: davinci or ais
    #[clap(long, default_value = "davinci")]
    convention: BootConvention,

    /// Size of the receive arena, in bytes
    #[clap(long, value_parser = parse_number)]
    arena_size: Option<u32>,

    /// Number of redundant copies of each headed NAND image
    #[clap(long)]
    nand_copies: Option<u32>,

    /// Announce readiness without waiting for the host's start token
    #[clap(long)]
    no_wait_start: bool,
}

impl PlatformOptions {
    pub fn config(&self) -> PlatformConfig {
        let mut config = PlatformConfig {
            convention: self.convention,
            wait_for_start: !self.no_wait_start,
            ..Default::default()
        };
        if let Some(size) = self.arena_size {
            config.arena_size = size as usize;
        }
        if let Some(copies) = self.nand_copies {
            config.nand.copies = copies;
        }
        config
    }
}

/// Whichever storage backend was selected on the command line
#[derive(Debug)]
pub enum Device {
    SimNand(NandTarget<SimNand>),
    SimNor(NorTarget<SimNor>),
    Card(SdTarget<FileCard>),

    #[cfg(target_os = "linux")]
    MtdNand(NandTarget<MtdNand>),

    #[cfg(target_os = "linux")]
    MtdNor(NorTarget<MtdNor>),
}

impl Device {
    fn describe(&self) -> String {
        let handle = match self {
            Device::SimNand(target) => *target.handle(),
            Device::SimNor(target) => *target.handle(),
            Device::Card(target) => *target.handle(),

            #[cfg(target_os = "linux")]
            Device::MtdNand(target) => *target.handle(),

            #[cfg(target_os = "linux")]
            Device::MtdNor(target) => *target.handle(),
        };
        format!("{:?} {:?}", handle.kind, handle.geometry)
    }

    /// Run a flashing session against this device
    pub fn serve<P: Read + Write>(&mut self, ctx: &mut SessionContext<P>) -> Result<u32> {
        match self {
            Device::SimNand(target) => ctx.run(target),
            Device::SimNor(target) => ctx.run(target),
            Device::Card(target) => ctx.run(target),

            #[cfg(target_os = "linux")]
            Device::MtdNand(target) => ctx.run(target),

            #[cfg(target_os = "linux")]
            Device::MtdNor(target) => ctx.run(target),
        }
    }

    /// Find and load the image this device boots
    pub fn boot<R: Ram>(&mut self, config: &PlatformConfig, ram: &mut R) -> Result<BootImage> {
        let search = config.nand.application.clone();
        match self {
            Device::SimNand(target) => boot_from_nand(target.nand_mut(), search, ram),
            Device::SimNor(target) => boot_nor(target, config, ram),
            Device::Card(target) => boot_from_sdmmc(target.card_mut(), &config.sdmmc, ram),

            #[cfg(target_os = "linux")]
            Device::MtdNand(target) => boot_from_nand(target.nand_mut(), search, ram),

            #[cfg(target_os = "linux")]
            Device::MtdNor(target) => boot_nor(target, config, ram),
        }
    }
}

fn boot_nor<F: NorFlash, R: Ram>(
    target: &mut NorTarget<F>,
    config: &PlatformConfig,
    ram: &mut R,
) -> Result<BootImage> {
    match target.kind() {
        NorKind::Nor => boot_from_nor(target.flash_mut(), &config.memory, ram),
        NorKind::Spi => Err(Error::StorageNotFound),
    }
}

/// Sleep until the board is reset.
pub fn wait_forever() -> ! {
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
