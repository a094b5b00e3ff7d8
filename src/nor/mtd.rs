//! NOR/SPI-NOR implementation over the Linux MTD subsystem

use super::{NorFlash, NorGeometry};
use crate::nand::mtd::{find_named, get_info, ioctl, set_locked};

use anyhow::ensure;

use std::fs::File;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NOR flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNor {
    file: File,
    geometry: NorGeometry,
}

impl MtdNor {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0"); `base` is where the device is mapped
    pub fn open<P: AsRef<Path>>(path: P, base: u32) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let info = get_info(&file)?;
        ensure!(info.erasesize > 0, "MTD device reports no erase size");

        let geometry = NorGeometry {
            base,
            size: info.size,
            block_size: info.erasesize,
        };

        // NOR parts commonly power up locked
        set_locked(&file, 0, geometry.size, false)?;

        Ok(Self { file, geometry })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str, base: u32) -> anyhow::Result<Self> {
        Self::open(find_named(name)?, base)
    }
}

impl NorFlash for MtdNor {
    fn geometry(&self) -> NorGeometry {
        self.geometry
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        Ok(self.file.read_exact_at(buf, u64::from(offset))?)
    }

    fn erase(&mut self, offset: u32, len: u32) -> anyhow::Result<()> {
        let (start, length) = self.geometry.covering(offset, len);
        ensure!(
            start + length <= self.geometry.size,
            "erase {start:#x}+{length:#x} out of bounds"
        );
        let erase_info = ioctl::erase_info_user { start, length };
        unsafe {
            ioctl::memerase(self.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> anyhow::Result<()> {
        Ok(self.file.write_all_at(data, u64::from(offset))?)
    }
}
