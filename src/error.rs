//! The error taxonomy shared by every layer above the raw NAND traits.
//!
//! The NAND traits themselves speak `anyhow`, as they wrap whatever the backend (ioctl, simulator)
//! produced. The flash writer attaches the device/offset context and turns those into the
//! variants below, which is what the migrators and the binaries match on.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("unsupported hardware variant: {0}")]
    UnsupportedVariant(String),

    #[error("failed to erase mtd{device} at {offset:#x}")]
    FlashEraseFailed {
        device: u32,
        offset: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to write {len:#x} bytes to mtd{device} at {offset:#x}")]
    FlashWriteFailed {
        device: u32,
        offset: u64,
        len: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to read {len:#x} bytes from mtd{device} at {offset:#x}")]
    FlashReadFailed {
        device: u32,
        offset: u64,
        len: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("read-back of mtd{device} at {offset:#x} does not match what was written")]
    FlashVerifyFailed { device: u32, offset: u64 },

    #[error("environment is corrupt: none of its {copies} copies is valid")]
    EnvironmentCorrupt { copies: usize },

    #[error("environment variable `{0}` not found")]
    NotFound(String),

    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("bad environment config {path}: {reason}")]
    EnvConfig { path: PathBuf, reason: String },

    #[error("image `{name}` is {size:#x} bytes, but only {max:#x} bytes fit at its destination")]
    ImageTooLarge { name: String, size: u64, max: u64 },

    #[error("stage2 payload: {0}")]
    Payload(String),

    #[error("backup: {0}")]
    Backup(String),

    #[error("reboot failed")]
    Reboot(#[source] nix::errno::Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MigrateError {
    /// The process exit status a binary should use when aborting with this error
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::UnsupportedVariant(_) => 2,
            MigrateError::FlashEraseFailed { .. }
            | MigrateError::FlashWriteFailed { .. }
            | MigrateError::FlashReadFailed { .. }
            | MigrateError::FlashVerifyFailed { .. } => 3,
            MigrateError::EnvironmentCorrupt { .. }
            | MigrateError::NotFound(_)
            | MigrateError::EnvConfig { .. } => 4,
            _ => 1,
        }
    }

    /// Is this an I/O failure on the flash itself (as opposed to bad input)?
    pub fn is_flash_failure(&self) -> bool {
        self.exit_code() == 3
    }
}

#[test]
fn test_exit_codes() {
    assert_eq!(MigrateError::UnsupportedVariant("x".into()).exit_code(), 2);
    assert_eq!(MigrateError::FlashVerifyFailed { device: 1, offset: 0 }.exit_code(), 3);
    assert_eq!(MigrateError::EnvironmentCorrupt { copies: 2 }.exit_code(), 4);
    assert_eq!(MigrateError::Payload("x".into()).exit_code(), 1);
    assert!(MigrateError::FlashEraseFailed {
        device: 0,
        offset: 0,
        source: anyhow::anyhow!("boom"),
    }
    .is_flash_failure());
}
