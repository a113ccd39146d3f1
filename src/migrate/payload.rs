//! The stage2 payload: the images Stage2 installs, shipped as a gzipped tarball.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::MigrateError;
use crate::image::files;

#[derive(Debug, Clone)]
pub struct Stage2Payload {
    pub kernel: Vec<u8>,
    pub factory: Vec<u8>,
    pub bitstream: Vec<u8>,

    /// A prebuilt miner configuration environment, written verbatim to every copy
    pub miner_cfg: Option<Vec<u8>>,

    /// The `fw_env.config` for the miner configuration environment
    pub miner_cfg_config: Option<String>,
}

impl Stage2Payload {
    /// Unpack a `.tgz` stream
    pub fn from_archive<R: Read>(reader: R) -> Result<Self, MigrateError> {
        let bad = |e: std::io::Error| MigrateError::Payload(e.to_string());

        let mut archive = tar::Archive::new(GzDecoder::new(reader));
        let mut members = BTreeMap::new();
        for entry in archive.entries().map_err(bad)? {
            let mut entry = entry.map_err(bad)?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let name = entry
                .path()
                .map_err(bad)?
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned);
            let Some(name) = name else {
                continue;
            };

            // The header's size is not trusted; the data has to actually be there
            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(bad)?;
            debug!("payload member {name}: {:#x} bytes", data.len());
            members.insert(name, data);
        }

        Self::from_members(|name| Ok(members.remove(name)))
    }

    /// Load from a directory the payload was already extracted into
    pub fn from_dir(dir: &Path) -> Result<Self, MigrateError> {
        Self::from_members(|name| match fs::read(dir.join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
    }

    fn from_members(
        mut member: impl FnMut(&str) -> Result<Option<Vec<u8>>, MigrateError>,
    ) -> Result<Self, MigrateError> {
        let mut required = |name: &str| {
            member(name)?.ok_or_else(|| MigrateError::Payload(format!("missing {name}")))
        };

        let kernel = required(files::KERNEL)?;
        let factory = required(files::FACTORY)?;
        let bitstream = required(files::BITSTREAM)?;

        let miner_cfg = member(files::MINER_CFG)?;
        let miner_cfg_config = member(files::MINER_CFG_CONFIG)?
            .map(|raw| {
                String::from_utf8(raw).map_err(|_| {
                    MigrateError::Payload(format!("{} is not text", files::MINER_CFG_CONFIG))
                })
            })
            .transpose()?;

        Ok(Self {
            kernel,
            factory,
            bitstream,
            miner_cfg,
            miner_cfg_config,
        })
    }
}

/// Build a `.tgz` holding the given members
#[cfg(test)]
pub fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("./{name}"), *data)
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

#[test]
fn test_from_archive() {
    let archive = build_archive(&[
        (files::KERNEL, &b"kernel"[..]),
        (files::FACTORY, &b"factory"[..]),
        (files::BITSTREAM, &b"bitstream"[..]),
        (files::MINER_CFG_CONFIG, &b"/dev/mtd5 0x0 0x20000 0x20000\n"[..]),
    ]);

    let payload = Stage2Payload::from_archive(&archive[..]).unwrap();
    assert_eq!(payload.kernel, &b"kernel"[..]);
    assert_eq!(payload.factory, &b"factory"[..]);
    assert_eq!(payload.bitstream, &b"bitstream"[..]);
    assert!(payload.miner_cfg.is_none());
    assert!(payload.miner_cfg_config.unwrap().starts_with("/dev/mtd5"));
}

#[test]
fn test_from_archive_trailing_padding() {
    // Read back from flash, the archive is followed by erased bytes up to the page boundary
    let mut archive = build_archive(&[
        (files::KERNEL, &b"k"[..]),
        (files::FACTORY, &b"f"[..]),
        (files::BITSTREAM, &b"b"[..]),
    ]);
    archive.resize(archive.len() + 700, 0xFF);

    assert!(Stage2Payload::from_archive(&archive[..]).is_ok());
}

#[test]
fn test_missing_member() {
    let archive = build_archive(&[(files::KERNEL, &b"k"[..]), (files::BITSTREAM, &b"b"[..])]);
    let err = Stage2Payload::from_archive(&archive[..]).unwrap_err();
    assert!(err.to_string().contains(files::FACTORY));

    assert!(matches!(
        Stage2Payload::from_archive(&b"not a tarball"[..]),
        Err(MigrateError::Payload(_))
    ));
}

#[test]
fn test_lying_member_size() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    // A header claiming a terabyte, followed by a few bytes and nothing else
    let mut header = tar::Header::new_gnu();
    header.set_path(files::KERNEL).unwrap();
    header.set_size(1 << 40);
    header.set_mode(0o644);
    header.set_cksum();

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(header.as_bytes()).unwrap();
    gz.write_all(&[0x44; 512]).unwrap();
    let archive = gz.finish().unwrap();

    assert!(matches!(
        Stage2Payload::from_archive(&archive[..]),
        Err(MigrateError::Payload(_))
    ));
}

#[test]
fn test_from_dir() {
    let dir = tempfile::tempdir().unwrap();
    for (name, data) in [
        (files::KERNEL, &b"k"[..]),
        (files::FACTORY, &b"f"[..]),
        (files::BITSTREAM, &b"b"[..]),
        (files::MINER_CFG, &b"cfg"[..]),
    ] {
        fs::write(dir.path().join(name), data).unwrap();
    }

    let payload = Stage2Payload::from_dir(dir.path()).unwrap();
    assert_eq!(payload.miner_cfg.as_deref(), Some(&b"cfg"[..]));
    assert!(payload.miner_cfg_config.is_none());
}
