//! The environment variables Stage1 leaves for the bootloader and for Stage2.
//!
//! U-Boot consumes the `*_off`/`*_size` pairs directly in its boot scripts, so the formatting is
//! fixed: `0x` followed by uppercase hex. `stage2_mtd` is a plain decimal index.

use crate::env::EnvRecord;
use crate::error::MigrateError;
use crate::layout::HardwareVariant;
use crate::util::{format_hex, parse_number};

pub const BITSTREAM_OFF: &str = "bitstream_off";
pub const BITSTREAM_SIZE: &str = "bitstream_size";
pub const KERNEL_OFF: &str = "kernel_off";
pub const KERNEL_SIZE: &str = "kernel_size";
pub const STAGE2_OFF: &str = "stage2_off";
pub const STAGE2_SIZE: &str = "stage2_size";
pub const STAGE2_MTD: &str = "stage2_mtd";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MigrationMetadata {
    pub bitstream_off: u64,
    pub bitstream_size: u64,
    pub kernel_off: u64,
    pub kernel_size: u64,
    pub stage2_off: u64,
    pub stage2_size: u64,
    pub stage2_mtd: u32,
}

impl MigrationMetadata {
    /// The metadata describing images of the given sizes, placed per `variant`
    pub fn new(
        variant: &HardwareVariant,
        bitstream_size: u64,
        kernel_size: u64,
        stage2_size: u64,
    ) -> Self {
        Self {
            bitstream_off: variant.bitstream_off,
            bitstream_size,
            kernel_off: variant.kernel_off,
            kernel_size,
            stage2_off: variant.stage2_off,
            stage2_size,
            stage2_mtd: variant.stage2_mtd,
        }
    }

    pub fn apply_to(&self, record: &mut EnvRecord) -> Result<(), MigrateError> {
        for (key, value) in [
            (BITSTREAM_OFF, self.bitstream_off),
            (BITSTREAM_SIZE, self.bitstream_size),
            (KERNEL_OFF, self.kernel_off),
            (KERNEL_SIZE, self.kernel_size),
            (STAGE2_OFF, self.stage2_off),
            (STAGE2_SIZE, self.stage2_size),
        ] {
            record.insert(key, &format_hex(value))?;
        }
        record.insert(STAGE2_MTD, &self.stage2_mtd.to_string())
    }

    pub fn from_record(record: &EnvRecord) -> Result<Self, MigrateError> {
        let number = |key: &str| {
            let value = record
                .get(key)
                .ok_or_else(|| MigrateError::NotFound(key.to_owned()))?;
            parse_number(value).ok_or_else(|| MigrateError::InvalidValue {
                key: key.to_owned(),
                reason: format!("`{value}` is not a number"),
            })
        };

        let stage2_mtd = number(STAGE2_MTD)?;
        Ok(Self {
            bitstream_off: number(BITSTREAM_OFF)?,
            bitstream_size: number(BITSTREAM_SIZE)?,
            kernel_off: number(KERNEL_OFF)?,
            kernel_size: number(KERNEL_SIZE)?,
            stage2_off: number(STAGE2_OFF)?,
            stage2_size: number(STAGE2_SIZE)?,
            stage2_mtd: u32::try_from(stage2_mtd).map_err(|_| MigrateError::InvalidValue {
                key: STAGE2_MTD.into(),
                reason: "out of range".into(),
            })?,
        })
    }
}

#[test]
fn test_formatting() {
    let variant = crate::layout::VARIANTS.by_name("A").unwrap();
    let meta = MigrationMetadata::new(variant, 0x1234, 0x5AB000, 0xA00);

    let mut record = EnvRecord::new();
    meta.apply_to(&mut record).unwrap();

    assert_eq!(record.get(KERNEL_OFF), Some("0x7D00000"));
    assert_eq!(record.get(KERNEL_SIZE), Some("0x5AB000"));
    assert_eq!(record.get(BITSTREAM_OFF), Some("0x300000"));
    assert_eq!(record.get(BITSTREAM_SIZE), Some("0x1234"));
    assert_eq!(record.get(STAGE2_OFF), Some("0xD00000"));
    assert_eq!(record.get(STAGE2_SIZE), Some("0xA00"));
    assert_eq!(record.get(STAGE2_MTD), Some("8"));

    assert_eq!(MigrationMetadata::from_record(&record).unwrap(), meta);
}

#[test]
fn test_from_record_errors() {
    let variant = crate::layout::VARIANTS.by_name("B").unwrap();
    let mut record = EnvRecord::new();
    MigrationMetadata::new(variant, 1, 2, 3)
        .apply_to(&mut record)
        .unwrap();

    record.insert(STAGE2_SIZE, "lots").unwrap();
    assert!(matches!(
        MigrationMetadata::from_record(&record),
        Err(MigrateError::InvalidValue { ref key, .. }) if key == STAGE2_SIZE
    ));

    record.remove(KERNEL_OFF);
    assert!(matches!(
        MigrationMetadata::from_record(&record),
        Err(MigrateError::NotFound(ref key)) if key == KERNEL_OFF
    ));
}
