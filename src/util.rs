//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};
use std::ops::RangeInclusive;

pub trait ReadExt {
    /// Tries to fill `buf`, like `read_exact`, but unlike `read_exact`, is forgiving of an
    /// unexpected EOF or a polling timeout.
    ///
    /// Returns how many bytes were placed at the start of `buf`; this is strictly shorter than
    /// `buf.len()` only if the stream ran dry.
    fn read_fill(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read> ReadExt for T {
    fn read_fill(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut cursor = 0;
        while cursor < buf.len() {
            cursor += match self.read(&mut buf[cursor..]) {
                // EOF, or a serial port whose VTIME expired
                Ok(0) => break,

                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(e) if is_timeout(&e) => break,
                Err(x) => return Err(x),
            };
        }

        Ok(cursor)
    }
}

/// Does this error only mean "nothing arrived in time"?
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Parse a number in decimal, or in hex with a `0x` prefix
pub fn parse_number(s: &str) -> anyhow::Result<u32> {
    Ok(match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => s.parse()?,
    })
}

/// Number of blocks in `range`; an inverted range is an error
pub fn block_count(range: &RangeInclusive<u32>) -> anyhow::Result<u32> {
    range
        .end()
        .checked_sub(*range.start())
        .and_then(|n| n.checked_add(1))
        .ok_or(anyhow::anyhow!("block range {range:?} is inverted or too large"))
}

/// Size in bytes of the blocks in `range`, as reported to the host
pub fn range_bytes(range: &RangeInclusive<u32>, block_size: usize) -> anyhow::Result<u32> {
    let blocks = block_count(range)?;
    u32::try_from(block_size)
        .ok()
        .and_then(|size| blocks.checked_mul(size))
        .ok_or(anyhow::anyhow!("block range {range:?} too large to report"))
}

#[test]
fn test_range_bytes() {
    assert_eq!(block_count(&(3..=3)).unwrap(), 1);
    assert_eq!(range_bytes(&(0x10..=0x20), 512).unwrap(), 0x11 * 512);
    assert!(block_count(&(5..=4)).is_err());
    assert!(block_count(&(0..=u32::MAX)).is_err());
    assert!(range_bytes(&(0..=0x100_0000), 512).is_err());
}

#[test]
fn test_parse_number() {
    assert_eq!(parse_number("0x60000000").unwrap(), 0x6000_0000);
    assert_eq!(parse_number("4096").unwrap(), 4096);
    assert!(parse_number("0xZZ").is_err());
}

#[test]
fn test_read_fill() -> io::Result<()> {
    let mut buf = [0u8; 4];
    assert_eq!(io::repeat(0xAA).read_fill(&mut buf)?, 4);
    assert_eq!(buf, [0xAA; 4]);

    let mut buf = [0u8; 8];
    assert_eq!((&[1, 2, 3][..]).read_fill(&mut buf)?, 3);
    assert_eq!(buf[..3], [1, 2, 3]);
    Ok(())
}
