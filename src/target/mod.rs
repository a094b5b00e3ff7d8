//! Storage backends as seen by the session: each one turns a host command into erase/program
//! operations on its device.

use std::io::{Read, Write};

use crate::error::Result;
use crate::nand::NandLayout;
use crate::nor::NorGeometry;
use crate::protocol::{session::SessionContext, Command};

pub mod nand;
pub mod nor;
pub mod sdmmc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeviceKind {
    Nand,
    Nor,
    Spi,
    Sdmmc,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Geometry {
    Nand(NandLayout),
    Nor(NorGeometry),
    Sdmmc { blocks: u32 },
}

/// Identifies the device a target drives
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DeviceHandle {
    pub kind: DeviceKind,
    pub interface: u32,
    pub chip_select: u32,
    pub register_base: u32,
    pub geometry: Geometry,
}

impl DeviceHandle {
    pub fn new(kind: DeviceKind, geometry: Geometry) -> Self {
        Self {
            kind,
            interface: 0,
            chip_select: 0,
            register_base: 0,
            geometry,
        }
    }

    /// Where the device sits on the bus
    pub fn at(mut self, interface: u32, chip_select: u32, register_base: u32) -> Self {
        self.interface = interface;
        self.chip_select = chip_select;
        self.register_base = register_base;
        self
    }
}

/// A storage backend the session can dispatch commands to
pub trait FlashTarget {
    fn handle(&self) -> &DeviceHandle;

    /// Carry out `command`, exchanging images and progress with the host through `ctx`.
    ///
    /// Returns the entry point to report for this command.
    fn execute<P: Read + Write>(
        &mut self,
        command: Command,
        ctx: &mut SessionContext<P>,
    ) -> Result<u32>;
}
