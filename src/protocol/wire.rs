//! Framing of the individual wire elements: tokens, hex words, and raw payloads.

use std::io::{self, Read, Write};

use log::trace;

use super::TOKEN_LEN;
use crate::error::TransportError;
use crate::util::{is_timeout, ReadExt};

type Result<T> = std::result::Result<T, TransportError>;

/// The device end of the serial link
#[derive(Debug)]
pub struct Link<P> {
    port: P,
}

fn io_error(e: io::Error) -> TransportError {
    if is_timeout(&e) {
        TransportError::Timeout
    } else {
        TransportError::Io(e)
    }
}

impl<P: Read + Write> Link<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn get_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_inner(self) -> P {
        self.port
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes).map_err(io_error)?;
        self.port.flush().map_err(io_error)
    }

    /// Send a 7-character token and its NUL
    pub fn send_token(&mut self, token: &str) -> Result<()> {
        trace!("-> {token:?}");
        if token.len() != TOKEN_LEN {
            return Err(TransportError::BadTokenLength(token.to_owned()));
        }
        let mut bytes = [0u8; TOKEN_LEN + 1];
        bytes[..TOKEN_LEN].copy_from_slice(token.as_bytes());
        self.write(&bytes)
    }

    /// Send a word as eight uppercase hex digits and a NUL
    pub fn send_hex_u32(&mut self, value: u32) -> Result<()> {
        trace!("-> {value:#010x}");
        let mut bytes = format!("{value:08X}").into_bytes();
        bytes.push(0);
        self.write(&bytes)
    }

    /// Read exactly `buf.len()` bytes; nothing at all is a timeout
    pub fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let received = self.port.read_fill(buf).map_err(io_error)?;
        match received {
            n if n == buf.len() => Ok(()),
            0 => Err(TransportError::Timeout),
            n => Err(TransportError::ShortRead {
                expected: buf.len(),
                received: n,
            }),
        }
    }

    /// Receive `literal` verbatim, without a NUL
    pub fn expect_literal(&mut self, literal: &'static str) -> Result<()> {
        let mut buf = vec![0u8; literal.len()];
        self.recv_exact(&mut buf)?;
        if buf != literal.as_bytes() {
            return Err(TransportError::UnexpectedToken {
                expected: literal,
                received: String::from_utf8_lossy(&buf).into_owned(),
            });
        }
        Ok(())
    }

    /// Receive a 7-character token and its NUL
    pub fn expect_token(&mut self, token: &'static str) -> Result<()> {
        let mut buf = [0u8; TOKEN_LEN + 1];
        self.recv_exact(&mut buf)?;
        trace!("<- {:?}", String::from_utf8_lossy(&buf));
        if &buf[..TOKEN_LEN] != token.as_bytes() || buf[TOKEN_LEN] != 0 {
            return Err(TransportError::UnexpectedToken {
                expected: token,
                received: String::from_utf8_lossy(&buf).into_owned(),
            });
        }
        Ok(())
    }

    /// Receive a word as eight hex digits, most significant first, either case
    pub fn recv_hex_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 8];
        self.recv_exact(&mut buf)?;
        let text = String::from_utf8_lossy(&buf);
        if !buf.iter().all(u8::is_ascii_hexdigit) {
            return Err(TransportError::MalformedHex(text.into_owned()));
        }
        u32::from_str_radix(&text, 16).map_err(|_| TransportError::MalformedHex(text.into_owned()))
    }
}
