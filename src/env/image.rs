//! The on-flash format of one copy of a U-Boot environment.
//!
//! ```text
//! crc32 (LE) | flags (redundant only) | "key=value\0" ... "\0" | 0x00 padding
//! ```
//!
//! The CRC covers the whole data area, padding included.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;
use tracing::warn;

use super::EnvRecord;
use crate::error::MigrateError;

pub const ENV_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, DekuRead)]
#[deku(endian = "little")]
struct SingleHeader {
    crc: u32,
}

#[derive(Debug, DekuRead)]
#[deku(endian = "little")]
struct RedundantHeader {
    crc: u32,
    flags: u8,
}

/// The geometry of an environment copy
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EnvImage {
    /// Total bytes per copy, header included
    pub size: usize,

    /// Is there a flags byte after the CRC?
    pub redundant: bool,
}

impl EnvImage {
    pub fn new(size: usize, redundant: bool) -> Self {
        Self { size, redundant }
    }

    fn header_size(&self) -> usize {
        if self.redundant {
            5
        } else {
            4
        }
    }

    /// Bytes available for `key=value` pairs and the terminator
    pub fn data_size(&self) -> usize {
        self.size.saturating_sub(self.header_size())
    }

    /// Serialize `record` into a complete copy (mkenvimage)
    pub fn encode(&self, record: &EnvRecord, flags: u8) -> Result<Vec<u8>, MigrateError> {
        let mut data = BytesMut::with_capacity(self.data_size());
        for (key, value) in record.iter() {
            data.put_slice(key.as_bytes());
            data.put_u8(b'=');
            data.put_slice(value.as_bytes());
            data.put_u8(0);
        }
        data.put_u8(0);

        if data.len() > self.data_size() {
            return Err(MigrateError::ImageTooLarge {
                name: "environment".into(),
                size: data.len() as u64,
                max: self.data_size() as u64,
            });
        }
        data.resize(self.data_size(), 0);

        let crc = ENV_CRC.checksum(&data);
        let mut image = BytesMut::with_capacity(self.size);
        image.put_u32_le(crc);
        if self.redundant {
            image.put_u8(flags);
        }
        image.put_slice(&data);

        Ok(image.to_vec())
    }

    /// Parse a copy, returning its flags (0 when not redundant) and contents
    ///
    /// Returns None if the copy is truncated or its CRC does not match.
    pub fn decode(&self, raw: &[u8]) -> Option<(u8, EnvRecord)> {
        let raw = raw.get(..self.size)?;

        let ((data, _), crc, flags) = if self.redundant {
            let (rest, header) = RedundantHeader::from_bytes((raw, 0)).ok()?;
            (rest, header.crc, header.flags)
        } else {
            let (rest, header) = SingleHeader::from_bytes((raw, 0)).ok()?;
            (rest, header.crc, 0)
        };

        if ENV_CRC.checksum(data) != crc {
            return None;
        }

        let mut record = EnvRecord::new();
        for entry in data.split(|&b| b == 0).take_while(|e| !e.is_empty()) {
            let Ok(entry) = std::str::from_utf8(entry) else {
                warn!(
                    "dropping environment entry that is not UTF-8: {:?}",
                    String::from_utf8_lossy(entry)
                );
                continue;
            };
            if let Some((key, value)) = entry.split_once('=') {
                // Entries U-Boot itself would refuse are dropped rather than failing the copy
                let _ = record.insert(key, value);
            }
        }

        Some((flags, record))
    }
}

/// Is `b` a newer flags serial than `a`?
///
/// The serial wraps, so this compares by signed distance.
pub fn is_newer(b: u8, a: u8) -> bool {
    (b.wrapping_sub(a) as i8) > 0
}

#[cfg(test)]
fn sample() -> EnvRecord {
    let mut env = EnvRecord::new();
    env.insert("bootdelay", "3").unwrap();
    env.insert("ethaddr", "00:0A:35:DD:EE:FF").unwrap();
    env
}

#[test]
fn test_encode_layout() {
    let image = EnvImage::new(64, true);
    let raw = image.encode(&sample(), 7).unwrap();

    assert_eq!(raw.len(), 64);
    assert_eq!(raw[4], 7);
    assert_eq!(&raw[5..16], b"bootdelay=3");
    assert_eq!(raw[16], 0);
    assert!(raw[5..].starts_with(b"bootdelay=3\0ethaddr=00:0A:35:DD:EE:FF\0\0"));
    assert!(raw[5 + 39..].iter().all(|&b| b == 0));

    let crc = u32::from_le_bytes(raw[..4].try_into().unwrap());
    assert_eq!(crc, ENV_CRC.checksum(&raw[5..]));
}

#[test]
fn test_decode() {
    for redundant in [false, true] {
        let image = EnvImage::new(128, redundant);
        let raw = image.encode(&sample(), 3).unwrap();

        let (flags, record) = image.decode(&raw).unwrap();
        assert_eq!(flags, if redundant { 3 } else { 0 });
        assert_eq!(record, sample());
    }
}

#[test]
fn test_decode_rejects_damage() {
    let image = EnvImage::new(128, true);
    let mut raw = image.encode(&sample(), 1).unwrap();

    assert!(image.decode(&raw[..100]).is_none());
    assert!(image.decode(&[0xFF; 128]).is_none());

    raw[20] ^= 0x01;
    assert!(image.decode(&raw).is_none());
}

#[test]
fn test_decode_drops_non_utf8_entries() {
    let image = EnvImage::new(64, true);
    let mut data = b"a=1\0b=\xFF\xFE\0c=3\0\0".to_vec();
    data.resize(64 - 5, 0);

    let mut raw = ENV_CRC.checksum(&data).to_le_bytes().to_vec();
    raw.push(2);
    raw.extend_from_slice(&data);

    let (flags, record) = image.decode(&raw).unwrap();
    assert_eq!(flags, 2);
    assert_eq!(record.len(), 2);
    assert_eq!(record.get("a"), Some("1"));
    assert_eq!(record.get("b"), None);
    assert_eq!(record.get("c"), Some("3"));
}

#[test]
fn test_encode_too_large() {
    let image = EnvImage::new(16, true);
    assert!(matches!(
        image.encode(&sample(), 0),
        Err(MigrateError::ImageTooLarge { .. })
    ));
}

#[test]
fn test_is_newer() {
    assert!(is_newer(2, 1));
    assert!(!is_newer(1, 2));
    assert!(!is_newer(5, 5));
    assert!(is_newer(0, 255));
    assert!(!is_newer(255, 0));
}
