//! The serial flasher target.
//!
//! Opens the storage device and the link to the host, then serves the host's commands until it
//! sends FINISHED. Without `--port`, the session runs over stdin/stdout, which is handy for
//! driving a simulated device from a host-side tool through a pipe or a pty.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use retry::{delay::Fixed, retry};

use serial_flasher::{
    cli::{DeviceOptions, PlatformOptions},
    protocol::session::SessionContext,
    serial::{SerialPort, StdioPort},
};

#[derive(Args, Debug)]
struct LinkOptions {
    /// Serial device connected to the host; stdin/stdout if omitted
    #[clap(long)]
    port: Option<PathBuf>,

    /// Line rate of the serial device
    #[clap(long, default_value_t = 115200)]
    baud: u32,

    /// How long the line may stay idle before the handshake restarts, in milliseconds
    #[clap(long, default_value_t = 1000)]
    timeout_ms: u64,
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The storage to flash
    #[clap(flatten)]
    device: DeviceOptions,

    #[clap(flatten)]
    platform: PlatformOptions,

    #[clap(flatten)]
    link: LinkOptions,
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Cli::parse();

    let config = args.platform.config();
    let mut device = args.device.open()?;

    let entry_point = match &args.link.port {
        Some(path) => {
            // Progress goes to the terminal only when it is not carrying the session
            howudoin::init(howudoin::consumers::TermLine::default());

            let timeout = Duration::from_millis(args.link.timeout_ms);
            let port = retry(Fixed::from_millis(100).take(10), || {
                SerialPort::open(path, args.link.baud, timeout)
            })
            .map_err(|e| e.error)
            .with_context(|| path.display().to_string())?;

            device.serve(&mut SessionContext::new(port, config))?
        }
        None => device.serve(&mut SessionContext::new(StdioPort::new(), config))?,
    };

    eprintln!("[+] Flashing finished, entry point {entry_point:#010x}");
    args.device.cleanup(device)
}
