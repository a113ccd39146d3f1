//! Build artifacts staged for writing.
//!
//! Every image is read fully into memory and checked against the room at its destination before
//! any flash is touched, so an oversized or missing file aborts a migration while it is still a
//! no-op.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::MigrateError;
use crate::flash::Flash;
use crate::layout::Placement;
use crate::util::ReadExt;

/// File names in a firmware directory
pub mod files {
    pub const SPL: &str = "boot.bin";
    pub const UBOOT: &str = "u-boot.img";
    pub const BITSTREAM: &str = "system.bit.gz";
    pub const UBOOT_ENV: &str = "uboot_env.bin";
    pub const KERNEL: &str = "fit.itb";
    pub const STAGE2: &str = "stage2.tgz";

    /// Stage2 payload contents
    pub const FACTORY: &str = "factory.bin.gz";
    pub const MINER_CFG: &str = "miner_cfg.bin";
    pub const MINER_CFG_CONFIG: &str = "miner_cfg.config";
}

#[derive(Debug, Clone)]
pub struct StagedImage {
    pub name: String,
    pub source: PathBuf,
    pub target: Placement,
    pub data: Vec<u8>,
}

impl StagedImage {
    /// Read the image at `path`, failing if it would not fit at `target`
    pub fn load(name: &str, path: &Path, target: Placement) -> Result<Self, MigrateError> {
        let mut file = File::open(path)
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))?;

        // Read one byte past the limit to detect oversized images without reading all of them
        let mut data = Vec::new();
        file.read_to_vec(&mut data, target.max_size as usize + 1)?;
        if data.len() as u64 > target.max_size {
            let size = file.metadata()?.len();
            return Err(MigrateError::ImageTooLarge {
                name: name.to_owned(),
                size,
                max: target.max_size,
            });
        }

        Ok(Self {
            name: name.to_owned(),
            source: path.to_owned(),
            target,
            data,
        })
    }

    /// Stage bytes that are already in memory
    pub fn from_bytes(name: &str, data: Vec<u8>, target: Placement) -> Result<Self, MigrateError> {
        if data.len() as u64 > target.max_size {
            return Err(MigrateError::ImageTooLarge {
                name: name.to_owned(),
                size: data.len() as u64,
                max: target.max_size,
            });
        }

        Ok(Self {
            name: name.to_owned(),
            source: PathBuf::from(name),
            target,
            data,
        })
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Program the image at its destination, which must already be erased
    pub fn write<F: Flash>(&self, flash: &mut F) -> Result<(), MigrateError> {
        info!(
            "writing {} ({:#x} bytes) to mtd{} at {:#x}",
            self.name,
            self.size(),
            self.target.mtd,
            self.target.offset
        );
        flash.write_at(self.target.mtd, self.target.offset, &self.data)
    }
}

#[test]
fn test_load_checks_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(files::KERNEL);
    std::fs::write(&path, vec![0xAB; 0x1001]).unwrap();

    let image = StagedImage::load("kernel", &path, Placement::new(6, 0, 0x2000)).unwrap();
    assert_eq!(image.size(), 0x1001);
    assert_eq!(image.source, path);

    let err = StagedImage::load("kernel", &path, Placement::new(6, 0, 0x1000)).unwrap_err();
    assert!(matches!(
        err,
        MigrateError::ImageTooLarge {
            size: 0x1001,
            max: 0x1000,
            ..
        }
    ));

    // Exactly at the limit is fine
    assert!(StagedImage::load("kernel", &path, Placement::new(6, 0, 0x1001)).is_ok());
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        StagedImage::load("spl", &dir.path().join(files::SPL), Placement::new(0, 0, 0x100)),
        Err(MigrateError::Io(_))
    ));
}

#[test]
fn test_from_bytes_checks_size() {
    assert!(StagedImage::from_bytes("factory", vec![0; 16], Placement::new(6, 0, 8)).is_err());
    let image = StagedImage::from_bytes("factory", vec![0; 8], Placement::new(6, 0, 8)).unwrap();
    assert_eq!(image.size(), 8);
}
