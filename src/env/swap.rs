//! Temporarily pointing the system's `fw_env.config` at a different environment.
//!
//! The live config is moved aside and the replacement copied into its place. Whatever happens
//! while the guard is held, dropping it puts the original back.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::error::MigrateError;

/// Guard returned by `ConfigSwap::install()`
#[derive(Debug)]
pub struct ConfigSwap {
    live: PathBuf,
    backup: PathBuf,
    restored: bool,
}

impl ConfigSwap {
    /// Replace the config at `live` with a copy of `replacement`
    pub fn install(live: &Path, replacement: &Path) -> Result<Self, MigrateError> {
        recover_interrupted(live)?;
        let backup = backup_path(live);

        fs::rename(live, &backup)?;
        if let Err(e) = fs::copy(replacement, live) {
            // Put the original back before reporting the failure
            fs::rename(&backup, live)?;
            return Err(e.into());
        }

        debug!("{} now points at {}", live.display(), replacement.display());
        Ok(Self {
            live: live.to_owned(),
            backup,
            restored: false,
        })
    }

    /// Put the original config back, reporting failure
    pub fn restore(mut self) -> Result<(), MigrateError> {
        self.restore_inner()
    }

    fn restore_inner(&mut self) -> Result<(), MigrateError> {
        if !self.restored {
            fs::rename(&self.backup, &self.live)?;
            self.restored = true;
            debug!("restored {}", self.live.display());
        }
        Ok(())
    }
}

impl Drop for ConfigSwap {
    fn drop(&mut self) {
        if let Err(e) = self.restore_inner() {
            error!(
                "could not restore {} from {}: {e}",
                self.live.display(),
                self.backup.display()
            );
        }
    }
}

fn backup_path(live: &Path) -> PathBuf {
    let mut backup = live.as_os_str().to_owned();
    backup.push(".orig");
    PathBuf::from(backup)
}

/// Undo a swap whose guard never got to run (killed process, power loss)
///
/// A leftover backup is always the real config, so it goes back over whatever is live. Returns
/// whether anything had to be restored.
pub fn recover_interrupted(live: &Path) -> Result<bool, MigrateError> {
    let backup = backup_path(live);
    if !backup.exists() {
        return Ok(false);
    }

    warn!(
        "{} was left swapped out; restoring it from {}",
        live.display(),
        backup.display()
    );
    fs::rename(&backup, live)?;
    Ok(true)
}

/// Run `f` with `replacement` installed as the live config at `live`
///
/// The original config is back in place when this returns, whether or not `f` succeeded. If `f`
/// failed, its error takes precedence over a failure to restore.
pub fn with_env_config<T>(
    live: &Path,
    replacement: &Path,
    f: impl FnOnce() -> Result<T, MigrateError>,
) -> Result<T, MigrateError> {
    let guard = ConfigSwap::install(live, replacement)?;
    let result = f();

    match (result, guard.restore()) {
        (Ok(value), Ok(())) => Ok(value),
        (Err(e), _) | (Ok(_), Err(e)) => Err(e),
    }
}

#[cfg(test)]
fn swap_fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let live = dir.path().join("fw_env.config");
    let replacement = dir.path().join("miner_cfg.config");
    fs::write(&live, "/dev/mtd4 0x0 0x20000 0x20000\n").unwrap();
    fs::write(&replacement, "/dev/mtd5 0x0 0x20000 0x20000\n").unwrap();
    (dir, live, replacement)
}

#[test]
fn test_swap_and_restore() {
    let (_dir, live, replacement) = swap_fixture();

    let seen = with_env_config(&live, &replacement, || Ok(fs::read_to_string(&live)?)).unwrap();
    assert!(seen.starts_with("/dev/mtd5"));
    assert!(fs::read_to_string(&live).unwrap().starts_with("/dev/mtd4"));
    assert!(!live.with_extension("config.orig").exists());
}

#[test]
fn test_restore_on_error() {
    let (_dir, live, replacement) = swap_fixture();

    let result: Result<(), _> = with_env_config(&live, &replacement, || {
        Err(MigrateError::NotFound("ethaddr".into()))
    });
    assert!(matches!(result, Err(MigrateError::NotFound(_))));
    assert!(fs::read_to_string(&live).unwrap().starts_with("/dev/mtd4"));
}

#[test]
fn test_restore_on_drop() {
    let (_dir, live, replacement) = swap_fixture();

    {
        let _guard = ConfigSwap::install(&live, &replacement).unwrap();
        assert!(fs::read_to_string(&live).unwrap().starts_with("/dev/mtd5"));
    }
    assert!(fs::read_to_string(&live).unwrap().starts_with("/dev/mtd4"));
}

#[test]
fn test_missing_replacement_leaves_live_alone() {
    let (dir, live, _) = swap_fixture();

    assert!(ConfigSwap::install(&live, &dir.path().join("nope")).is_err());
    assert!(fs::read_to_string(&live).unwrap().starts_with("/dev/mtd4"));
}

#[test]
fn test_interrupted_swap_is_undone() {
    let (_dir, live, replacement) = swap_fixture();

    // A run that died while swapped: miner config live, the real one set aside
    fs::rename(&live, backup_path(&live)).unwrap();
    fs::copy(&replacement, &live).unwrap();

    let seen = with_env_config(&live, &replacement, || Ok(fs::read_to_string(&live)?)).unwrap();
    assert!(seen.starts_with("/dev/mtd5"));
    assert!(fs::read_to_string(&live).unwrap().starts_with("/dev/mtd4"));
    assert!(!backup_path(&live).exists());
}

#[test]
fn test_recover_interrupted() {
    let (_dir, live, replacement) = swap_fixture();
    assert!(!recover_interrupted(&live).unwrap());

    fs::rename(&live, backup_path(&live)).unwrap();
    fs::copy(&replacement, &live).unwrap();
    assert!(recover_interrupted(&live).unwrap());
    assert!(fs::read_to_string(&live).unwrap().starts_with("/dev/mtd4"));
}
