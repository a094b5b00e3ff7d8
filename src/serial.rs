//! The device end of the host link: a tty in raw mode.
//!
//! Reads return early once the line has been idle for the configured timeout, which the wire
//! layer turns into [`TransportError::Timeout`](crate::error::TransportError::Timeout).

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use log::debug;
use nix::fcntl::OFlag;
use nix::sys::termios::{
    cfmakeraw, cfsetspeed, tcflush, tcgetattr, tcsetattr, BaudRate, ControlFlags, FlushArg,
    SetArg, SpecialCharacterIndices,
};

/// Map a numeric line rate onto a termios speed
fn baud_rate(rate: u32) -> anyhow::Result<BaudRate> {
    Ok(match rate {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        #[cfg(target_os = "linux")]
        460800 => BaudRate::B460800,
        #[cfg(target_os = "linux")]
        921600 => BaudRate::B921600,
        _ => bail!("unsupported baud rate {rate}"),
    })
}

/// Idle timeout in tenths of a second, as VTIME wants it
fn vtime(timeout: Duration) -> u8 {
    let tenths = timeout.as_millis().div_ceil(100);
    tenths.clamp(1, u8::MAX as u128) as u8
}

/// An open serial line
#[derive(Debug)]
pub struct SerialPort {
    file: File,
}

impl SerialPort {
    /// Open `path` without making it our controlling terminal, and switch it to raw 8N1 at
    /// `rate` with the given idle timeout.
    pub fn open<P: AsRef<Path>>(path: P, rate: u32, timeout: Duration) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::options()
            .read(true)
            .write(true)
            .custom_flags(OFlag::O_NOCTTY.bits())
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;

        let mut termios = tcgetattr(&file)?;
        cfmakeraw(&mut termios);
        cfsetspeed(&mut termios, baud_rate(rate)?)?;
        termios.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        termios.control_flags &= !(ControlFlags::CSTOPB | ControlFlags::CRTSCTS);
        termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        termios.control_chars[SpecialCharacterIndices::VTIME as usize] = vtime(timeout);
        tcsetattr(&file, SetArg::TCSANOW, &termios)?;
        tcflush(&file, FlushArg::TCIOFLUSH)?;

        debug!("{} open at {rate} baud", path.display());
        Ok(Self { file })
    }
}

impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// The process's standard input and output as a link, for running behind another program
#[derive(Debug)]
pub struct StdioPort {
    stdin: io::Stdin,
    stdout: io::Stdout,
}

impl StdioPort {
    pub fn new() -> Self {
        Self {
            stdin: io::stdin(),
            stdout: io::stdout(),
        }
    }
}

impl Default for StdioPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for StdioPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdin.read(buf)
    }
}

impl Write for StdioPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdout.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdout.flush()
    }
}

#[test]
fn test_line_settings() {
    assert_eq!(baud_rate(115200).unwrap(), BaudRate::B115200);
    assert!(baud_rate(12345).is_err());

    assert_eq!(vtime(Duration::from_millis(0)), 1);
    assert_eq!(vtime(Duration::from_millis(250)), 3);
    assert_eq!(vtime(Duration::from_secs(60)), 255);
}
