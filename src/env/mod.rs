//! Reading and writing redundant U-Boot environments on raw NAND.
//!
//! The store is located by an `fw_env.config`, exactly like `fw_printenv`/`fw_setenv` locate it.
//! Reads accept any copy with a good CRC, preferring the newest; writes rewrite every copy with
//! identical bytes, so a store written by us is always fully healthy afterward.

pub mod config;
pub mod image;
pub mod swap;

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::MigrateError;
use crate::flash::Flash;

pub use config::{EnvConfig, EnvCopy};
pub use image::EnvImage;
pub use swap::{recover_interrupted, with_env_config, ConfigSwap};

/// The contents of an environment: `key=value` pairs, kept in key order as U-Boot exports them
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct EnvRecord {
    vars: BTreeMap<String, String>,
}

impl EnvRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Set `key`, rejecting names and values the on-flash format cannot represent
    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), MigrateError> {
        let invalid = |reason: &str| MigrateError::InvalidValue {
            key: key.to_owned(),
            reason: reason.to_owned(),
        };

        if key.is_empty() || key.contains(['=', '\0']) {
            return Err(invalid("not a valid variable name"));
        }
        if value.contains('\0') {
            return Err(invalid("contains a NUL byte"));
        }

        self.vars.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// What a read of the store found
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    pub record: EnvRecord,

    /// Flags serial of the copy that was selected
    pub flags: u8,

    /// Index (in config order) of the copy that was selected
    pub source: usize,

    /// Every copy is valid and byte-identical to the others
    pub healthy: bool,
}

/// A redundant environment, as described by an `fw_env.config`
#[derive(Debug, Clone)]
pub struct EnvStore {
    config: EnvConfig,
    image: EnvImage,
}

impl EnvStore {
    pub fn new(config: EnvConfig) -> Self {
        let image = EnvImage::new(config.env_size() as usize, config.is_redundant());
        Self { config, image }
    }

    /// Open the store described by the config file at `path`
    pub fn open(path: &Path) -> Result<Self, MigrateError> {
        Ok(Self::new(EnvConfig::load(path)?))
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Read every copy and select the one to believe
    pub fn load<F: Flash>(&self, flash: &mut F) -> Result<EnvSnapshot, MigrateError> {
        let mut raws = Vec::with_capacity(self.config.copies.len());
        let mut best: Option<(usize, u8, EnvRecord)> = None;

        for (index, copy) in self.config.copies.iter().enumerate() {
            let mut raw = vec![0u8; copy.env_size as usize];
            let decoded = match flash.read_at(copy.device, copy.offset, &mut raw) {
                Ok(()) => self.image.decode(&raw),
                Err(e) => {
                    warn!("environment copy {index}: {e}");
                    None
                }
            };

            match decoded {
                Some((flags, record)) => {
                    let newer = best
                        .as_ref()
                        .map_or(true, |(_, best_flags, _)| image::is_newer(flags, *best_flags));
                    if newer {
                        best = Some((index, flags, record));
                    }
                    raws.push(Some(raw));
                }
                None => {
                    warn!(
                        "environment copy {index} (mtd{} at {:#x}) is invalid",
                        copy.device, copy.offset
                    );
                    raws.push(None);
                }
            }
        }

        let Some((source, flags, record)) = best else {
            return Err(MigrateError::EnvironmentCorrupt {
                copies: self.config.copies.len(),
            });
        };

        let healthy = raws
            .iter()
            .all(|raw| raw.is_some() && *raw == raws[source]);
        if !healthy {
            warn!("environment copies disagree; using copy {source}");
        }

        Ok(EnvSnapshot {
            record,
            flags,
            source,
            healthy,
        })
    }

    pub fn get<F: Flash>(&self, flash: &mut F, key: &str) -> Result<Option<String>, MigrateError> {
        Ok(self.load(flash)?.record.get(key).map(str::to_owned))
    }

    /// Like `get()`, but the key must exist
    pub fn require<F: Flash>(&self, flash: &mut F, key: &str) -> Result<String, MigrateError> {
        self.get(flash, key)?
            .ok_or_else(|| MigrateError::NotFound(key.to_owned()))
    }

    pub fn list<F: Flash>(&self, flash: &mut F) -> Result<Vec<(String, String)>, MigrateError> {
        let snapshot = self.load(flash)?;
        Ok(snapshot
            .record
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect())
    }

    pub fn set<F: Flash>(&self, flash: &mut F, key: &str, value: &str) -> Result<(), MigrateError> {
        self.update(flash, |record| record.insert(key, value))
    }

    /// Remove `key`, returning whether it was present
    pub fn remove<F: Flash>(&self, flash: &mut F, key: &str) -> Result<bool, MigrateError> {
        self.update(flash, |record| Ok(record.remove(key).is_some()))
    }

    /// Read, modify, and write back the environment
    ///
    /// Nothing is written if `f` fails, or if it left the record unchanged and every copy is
    /// healthy. An unhealthy store is always rewritten.
    pub fn update<F: Flash, T>(
        &self,
        flash: &mut F,
        f: impl FnOnce(&mut EnvRecord) -> Result<T, MigrateError>,
    ) -> Result<T, MigrateError> {
        let snapshot = self.load(flash)?;
        self.apply(flash, snapshot, f)
    }

    /// Like `update()`, but start from an empty environment if no valid copy exists
    pub fn update_or_default<F: Flash, T>(
        &self,
        flash: &mut F,
        f: impl FnOnce(&mut EnvRecord) -> Result<T, MigrateError>,
    ) -> Result<T, MigrateError> {
        let snapshot = match self.load(flash) {
            Ok(snapshot) => snapshot,
            Err(MigrateError::EnvironmentCorrupt { .. }) => {
                info!("no valid environment found; starting from an empty one");
                EnvSnapshot {
                    record: EnvRecord::new(),
                    flags: 0,
                    source: 0,
                    healthy: false,
                }
            }
            Err(e) => return Err(e),
        };
        self.apply(flash, snapshot, f)
    }

    fn apply<F: Flash, T>(
        &self,
        flash: &mut F,
        snapshot: EnvSnapshot,
        f: impl FnOnce(&mut EnvRecord) -> Result<T, MigrateError>,
    ) -> Result<T, MigrateError> {
        let mut record = snapshot.record.clone();
        let value = f(&mut record)?;

        if snapshot.healthy && record == snapshot.record {
            debug!("environment unchanged, not writing");
        } else {
            self.write(flash, &record, snapshot.flags.wrapping_add(1))?;
        }

        Ok(value)
    }

    /// Encode `record` with the given flags serial, the way it would be written
    pub fn encode(&self, record: &EnvRecord, flags: u8) -> Result<Vec<u8>, MigrateError> {
        self.image.encode(record, flags)
    }

    /// Unconditionally rewrite every copy
    pub fn write<F: Flash>(
        &self,
        flash: &mut F,
        record: &EnvRecord,
        flags: u8,
    ) -> Result<(), MigrateError> {
        let raw = self.image.encode(record, flags)?;

        for copy in &self.config.copies {
            flash.erase_region(copy.device, copy.offset, copy.sector_size)?;
            flash.write_at(copy.device, copy.offset, &raw)?;
        }

        debug!(
            "wrote {} environment copies ({} variables, flags {flags})",
            self.config.copies.len(),
            record.len()
        );
        Ok(())
    }
}

/// Set one variable in the environment described by an alternate `fw_env.config`
pub fn write_with_config<F: Flash>(
    flash: &mut F,
    config_path: &Path,
    key: &str,
    value: &str,
) -> Result<(), MigrateError> {
    EnvStore::open(config_path)?.set(flash, key, value)
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::flash::FlashWriter;
    use crate::layout::{EnvPlacement, NandMap, PartitionSpec};
    use crate::nand::{NandLayout, SimMtdSet, SimNand};

    pub const LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 4,
        bytes_per_page: 256,
    };

    pub static MAP: NandMap = NandMap {
        name: "env-test",
        partitions: &[
            PartitionSpec::new("env", 0, 0x0000, 0x2000),
            PartitionSpec::new("other", 1, 0x2000, 0x2000),
        ],
    };

    pub const PLACEMENT: EnvPlacement = EnvPlacement {
        mtd: 0,
        copies: &[0x0, 0x1000],
        size: 0x400,
    };

    pub fn flash() -> FlashWriter<SimMtdSet> {
        FlashWriter::new(SimMtdSet::new(SimNand::new(LAYOUT), &MAP).unwrap())
    }

    pub fn store() -> EnvStore {
        EnvStore::new(EnvConfig::from_placement(&PLACEMENT))
    }
}

#[cfg(test)]
use crate::flash::{FlashOp, RecordingFlash};

#[test]
fn test_record_rejects_bad_names() {
    let mut record = EnvRecord::new();
    assert!(record.insert("", "x").is_err());
    assert!(record.insert("a=b", "x").is_err());
    assert!(record.insert("a", "x\0y").is_err());
    record.insert("a", "x=y").unwrap();
    assert_eq!(record.get("a"), Some("x=y"));
}

#[test]
fn test_blank_store_is_corrupt() {
    let store = test_support::store();
    let mut flash = test_support::flash();

    assert!(matches!(
        store.get(&mut flash, "ethaddr"),
        Err(MigrateError::EnvironmentCorrupt { copies: 2 })
    ));
}

#[test]
fn test_set_get_list() {
    let store = test_support::store();
    let mut flash = test_support::flash();

    store
        .update_or_default(&mut flash, |env| env.insert("ethaddr", "00:0A:35:DD:EE:FF"))
        .unwrap();
    store.set(&mut flash, "bootdelay", "3").unwrap();

    assert_eq!(
        store.require(&mut flash, "ethaddr").unwrap(),
        "00:0A:35:DD:EE:FF"
    );
    assert!(matches!(
        store.require(&mut flash, "miner_hwid"),
        Err(MigrateError::NotFound(ref key)) if key == "miner_hwid"
    ));
    assert_eq!(
        store.list(&mut flash).unwrap(),
        [
            ("bootdelay".to_owned(), "3".to_owned()),
            ("ethaddr".to_owned(), "00:0A:35:DD:EE:FF".to_owned()),
        ]
    );

    assert!(store.remove(&mut flash, "bootdelay").unwrap());
    assert!(!store.remove(&mut flash, "bootdelay").unwrap());
    assert_eq!(store.get(&mut flash, "bootdelay").unwrap(), None);
}

#[test]
fn test_read_survives_corrupt_copy() {
    let store = test_support::store();

    for damaged in [0x0, 0x1000] {
        let mut flash = test_support::flash();
        store
            .update_or_default(&mut flash, |env| env.insert("kernel_off", "0x7D00000"))
            .unwrap();

        // Scribble over one copy
        flash.erase_region(0, damaged, 0x400).unwrap();
        flash.write_at(0, damaged, &[0x5A; 0x100]).unwrap();

        let snapshot = store.load(&mut flash).unwrap();
        assert!(!snapshot.healthy);
        assert_eq!(snapshot.record.get("kernel_off"), Some("0x7D00000"));
    }
}

#[test]
fn test_three_copies() {
    static TRIPLE: crate::layout::EnvPlacement = crate::layout::EnvPlacement {
        mtd: 0,
        copies: &[0x0, 0x800, 0x1000],
        size: 0x400,
    };
    let store = EnvStore::new(EnvConfig::from_placement(&TRIPLE));
    let mut flash = test_support::flash();

    store
        .update_or_default(&mut flash, |env| env.insert("ethaddr", "00:0A:35:DD:EE:FF"))
        .unwrap();
    assert!(store.load(&mut flash).unwrap().healthy);

    // Losing any two copies still leaves the third
    flash.erase_region(0, 0x0, 0x400).unwrap();
    flash.write_at(0, 0x0, &[0x5A; 0x100]).unwrap();
    flash.erase_region(0, 0x1000, 0x400).unwrap();
    let snapshot = store.load(&mut flash).unwrap();
    assert!(!snapshot.healthy);
    assert_eq!(snapshot.source, 1);
    assert_eq!(snapshot.record.get("ethaddr"), Some("00:0A:35:DD:EE:FF"));

    // A newer third copy wins over the first two
    let mut newer = snapshot.record.clone();
    newer.insert("miner_hwid", "abcdefghijklmnop").unwrap();
    store.write(&mut flash, &snapshot.record, 5).unwrap();
    flash.erase_region(0, 0x1000, 0x400).unwrap();
    flash
        .write_at(0, 0x1000, &store.encode(&newer, 6).unwrap())
        .unwrap();
    let snapshot = store.load(&mut flash).unwrap();
    assert_eq!(snapshot.source, 2);
    assert_eq!(snapshot.record.get("miner_hwid"), Some("abcdefghijklmnop"));

    flash.erase_region(0, 0x800, 0x400).unwrap();
    flash.erase_region(0, 0x1000, 0x400).unwrap();
    assert_eq!(store.load(&mut flash).unwrap().source, 0);
    flash.erase_region(0, 0x0, 0x400).unwrap();
    assert!(matches!(
        store.load(&mut flash),
        Err(MigrateError::EnvironmentCorrupt { copies: 3 })
    ));
}

#[test]
fn test_newest_copy_wins() {
    let store = test_support::store();
    let mut flash = test_support::flash();

    let mut old = EnvRecord::new();
    old.insert("stage2_mtd", "7").unwrap();
    store.write(&mut flash, &old, 0xFF).unwrap();

    // Only the second copy gets the update, with a wrapped serial
    let mut new = EnvRecord::new();
    new.insert("stage2_mtd", "8").unwrap();
    let raw = store.encode(&new, 0x00).unwrap();
    let copy = store.config().copies[1];
    flash.erase_region(copy.device, copy.offset, copy.sector_size).unwrap();
    flash.write_at(copy.device, copy.offset, &raw).unwrap();

    let snapshot = store.load(&mut flash).unwrap();
    assert_eq!(snapshot.source, 1);
    assert_eq!(snapshot.record.get("stage2_mtd"), Some("8"));
}

#[test]
fn test_tie_goes_to_primary() {
    let store = test_support::store();
    let mut flash = test_support::flash();

    let mut a = EnvRecord::new();
    a.insert("which", "primary").unwrap();
    let mut b = EnvRecord::new();
    b.insert("which", "secondary").unwrap();

    for (offset, record) in [(0x0, &a), (0x1000, &b)] {
        flash.erase_region(0, offset, 0x400).unwrap();
        flash.write_at(0, offset, &store.encode(record, 4).unwrap()).unwrap();
    }

    assert_eq!(store.get(&mut flash, "which").unwrap().as_deref(), Some("primary"));
}

#[test]
fn test_write_is_idempotent_and_heals() {
    let store = test_support::store();
    let mut flash = RecordingFlash::new(test_support::flash());

    store
        .update_or_default(&mut flash, |env| env.insert("ethaddr", "00:0A:35:DD:EE:FF"))
        .unwrap();
    assert_eq!(flash.ops.len(), 4);

    // Same value again: no flash I/O at all
    flash.ops.clear();
    store.set(&mut flash, "ethaddr", "00:0A:35:DD:EE:FF").unwrap();
    assert!(flash.ops.is_empty());

    // Damage the secondary; the same write now repairs it
    flash.inner.erase_region(0, 0x1000, 0x400).unwrap();
    store.set(&mut flash, "ethaddr", "00:0A:35:DD:EE:FF").unwrap();
    assert_eq!(
        flash.ops,
        [
            FlashOp::Erase { device: 0, offset: 0x0, len: 0x400 },
            FlashOp::Write { device: 0, offset: 0x0, len: 0x400 },
            FlashOp::Erase { device: 0, offset: 0x1000, len: 0x400 },
            FlashOp::Write { device: 0, offset: 0x1000, len: 0x400 },
        ]
    );
    assert!(store.load(&mut flash).unwrap().healthy);
}

#[test]
fn test_flags_increment_on_write() {
    let store = test_support::store();
    let mut flash = test_support::flash();

    store
        .update_or_default(&mut flash, |env| env.insert("a", "1"))
        .unwrap();
    let first = store.load(&mut flash).unwrap().flags;
    store.set(&mut flash, "a", "2").unwrap();
    assert_eq!(store.load(&mut flash).unwrap().flags, first.wrapping_add(1));
}

#[test]
fn test_write_with_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fw_env.config");
    std::fs::write(
        &path,
        EnvConfig::from_placement(&test_support::PLACEMENT).render(),
    )
    .unwrap();

    let mut flash = test_support::flash();
    test_support::store()
        .update_or_default(&mut flash, |_| Ok(()))
        .unwrap();

    write_with_config(&mut flash, &path, "miner_hwid", "abcdefghijklmnop").unwrap();
    assert_eq!(
        test_support::store()
            .get(&mut flash, "miner_hwid")
            .unwrap()
            .as_deref(),
        Some("abcdefghijklmnop")
    );
}
