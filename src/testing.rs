//! A scripted host for driving the device end of the link in tests.

use std::io::{self, Read, Write};

use crate::config::PlatformConfig;
use crate::error::Result;
use crate::protocol::{session::SessionContext, token, Command, HEADER_TERMINATOR};
use crate::target::FlashTarget;
use crate::validate::ImageHeader;

/// Defaults, with an arena small enough for tests
pub fn test_config() -> PlatformConfig {
    PlatformConfig {
        arena_size: 4 << 20,
        ..Default::default()
    }
}

/// Run a whole session against `target`; returns its outcome and every field the device sent
pub fn run_session<T: FlashTarget>(
    target: &mut T,
    config: PlatformConfig,
    script: &[u8],
) -> (Result<u32>, Vec<String>) {
    let port = ScriptedPort::new(script).hang_up_when_drained();
    let mut ctx = SessionContext::new(port, config);
    let outcome = ctx.run(target);
    (outcome, ctx.link.get_mut().fields())
}

/// A port that replays what the host sends and records what the device answers
#[derive(Debug, Default)]
pub struct ScriptedPort {
    input: Vec<u8>,
    cursor: usize,
    output: Vec<u8>,
    hang_up: bool,
}

impl ScriptedPort {
    /// Once the script is drained, reads return nothing, like an idle serial line
    pub fn new(script: &[u8]) -> Self {
        Self {
            input: script.to_vec(),
            ..Default::default()
        }
    }

    /// Once the script is drained, reads fail as if the port was closed
    pub fn hang_up_when_drained(mut self) -> Self {
        self.hang_up = true;
        self
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Everything the device sent, split at NULs
    pub fn fields(&self) -> Vec<String> {
        self.output
            .split(|&b| b == 0)
            .filter(|f| !f.is_empty())
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }
}

impl Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.input[self.cursor..];
        if rest.is_empty() && self.hang_up {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.cursor += n;
        Ok(n)
    }
}

impl Write for ScriptedPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Builds the byte stream a host would send
#[derive(Debug, Default)]
pub struct HostScript {
    bytes: Vec<u8>,
}

impl HostScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(mut self, token: &str) -> Self {
        self.bytes.extend_from_slice(token.as_bytes());
        self.bytes.push(0);
        self
    }

    pub fn hex(mut self, value: u32) -> Self {
        self.bytes.extend_from_slice(format!("{value:08X}").as_bytes());
        self
    }

    pub fn raw(mut self, data: &[u8]) -> Self {
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn start(self) -> Self {
        self.token(token::START)
    }

    pub fn command(self, command: Command) -> Self {
        self.command_word(command.word())
    }

    pub fn command_word(self, word: u32) -> Self {
        self.token(token::CMD).hex(word)
    }

    /// The image acknowledgment, header fields, and terminator
    pub fn header(self, header: ImageHeader) -> Self {
        self.token(token::ACK)
            .hex(header.magic)
            .hex(header.start_address)
            .hex(header.byte_count)
            .hex(header.load_address)
            .raw(HEADER_TERMINATOR.as_bytes())
    }

    pub fn image(self, header: ImageHeader, data: &[u8]) -> Self {
        self.header(header).raw(data)
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}
