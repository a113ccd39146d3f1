//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

pub trait ReadExt {
    /// Tries to read exactly `read_len` bytes, like `read_exact`, but unlike `read_exact`, is
    /// forgiving of unexpected EOF.
    ///
    /// The returned vector will have exactly `read_len` bytes appended, unless an EOF was
    /// encountered, in which case it will have strictly shorter than `read_len` new bytes added.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        const CHUNK_SIZE: usize = 65536;

        let read_len = read_len + vec.len();
        let mut cursor = vec.len();
        while cursor < read_len {
            vec.resize(std::cmp::min(read_len, cursor + CHUNK_SIZE), 0u8);

            cursor += match self.read(&mut vec[cursor..]) {
                // EOF; the final size is `cursor`
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }

        vec.truncate(cursor);
        Ok(())
    }
}

/// Round `len` up to a multiple of `align`
pub fn align_up(len: u64, align: u64) -> u64 {
    len.div_ceil(align) * align
}

/// Copy `data`, padded with erased (0xFF) bytes up to a multiple of `align`
pub fn pad_erased(data: &[u8], align: usize) -> Vec<u8> {
    let len = align_up(data.len() as u64, align as u64) as usize;
    let mut padded = Vec::with_capacity(len);
    padded.extend_from_slice(data);
    padded.resize(len, 0xFF);
    padded
}

/// Format an offset or size the way U-Boot scripts expect it: `0x` and uppercase hex digits
pub fn format_hex(value: u64) -> String {
    format!("0x{value:X}")
}

/// Parse a number written either as `0x`-prefixed hex or as decimal
pub fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    io::repeat(0xBB).read_to_vec(&mut vec, 2)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB]);
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_pad_erased() {
    assert_eq!(pad_erased(&[1, 2, 3], 4), [1, 2, 3, 0xFF]);
    assert_eq!(pad_erased(&[1, 2, 3, 4], 4), [1, 2, 3, 4]);
    assert!(pad_erased(&[], 4).is_empty());
}

#[test]
fn test_hex_numbers() {
    assert_eq!(format_hex(0x7D00000), "0x7D00000");
    assert_eq!(format_hex(0), "0x0");
    assert_eq!(parse_number("0x7D00000"), Some(0x7D00000));
    assert_eq!(parse_number("0x7d00000"), Some(0x7D00000));
    assert_eq!(parse_number("131072"), Some(0x20000));
    assert_eq!(parse_number(" 8 "), Some(8));
    assert_eq!(parse_number("0xZZ"), None);
    assert_eq!(parse_number(""), None);
}
