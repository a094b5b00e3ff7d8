//! The boot-time loader.
//!
//! Scans the selected storage for a boot header, copies the image it describes into a RAM
//! window, and reports where execution would continue. Jumping there is up to the platform, so
//! the loaded window can be dumped to a file instead.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use serial_flasher::{
    boot::{BootImage, RamWindow},
    cli::{wait_forever, DeviceOptions, PlatformOptions},
    util::parse_number,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The storage to boot from
    #[clap(flatten)]
    device: DeviceOptions,

    #[clap(flatten)]
    platform: PlatformOptions,

    /// Bus address of the start of the RAM window; external RAM if omitted
    #[clap(long, value_parser = parse_number)]
    ram_base: Option<u32>,

    /// Size of the RAM window, in bytes
    #[clap(long, value_parser = parse_number, default_value = "0x1000000")]
    ram_size: u32,

    /// Write the RAM window here once the image is loaded
    #[clap(long)]
    dump: Option<PathBuf>,

    /// On failure, report the error and hang instead of exiting
    #[clap(long)]
    halt: bool,
}

fn run(args: &Cli) -> Result<BootImage> {
    let config = args.platform.config();
    let base = args.ram_base.unwrap_or(config.memory.external_ram_start);
    let mut ram = RamWindow::new(base, args.ram_size as usize);

    let mut device = args.device.open()?;
    let image = device.boot(&config, &mut ram)?;

    if let Some(path) = &args.dump {
        fs::write(path, ram.as_bytes()).with_context(|| path.display().to_string())?;
    }

    Ok(image)
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Cli::parse();

    match run(&args) {
        Ok(image) => {
            println!(
                "[+] Loaded {:#x} bytes at {:#010x} (magic {:#010x}), entry point {:#010x}",
                image.size, image.load_address, image.magic, image.entry_point
            );
            Ok(())
        }
        Err(error) if args.halt => {
            eprintln!("[-] Boot failed:\n{error:#}");
            wait_forever()
        }
        Err(error) => Err(error),
    }
}
