//! Stage2: runs under the new firmware and finishes the job Stage1 started.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::metadata;
use super::{Identity, MigrationMetadata, Runner, Stage, Stage2Payload, Stage2State, StageError};
use crate::env::{recover_interrupted, with_env_config, EnvConfig, EnvStore};
use crate::error::MigrateError;
use crate::flash::Flash;
use crate::image::{files, StagedImage};
use crate::layout::FinalLayout;
use crate::system::Platform;

/// What Stage2 did, for the operator
#[derive(Debug, Clone)]
pub struct Stage2Report {
    pub identity: Identity,

    /// Whether the payload carried a miner configuration; `None` if an earlier run already
    /// wrote it
    pub miner_cfg_prebuilt: Option<bool>,
    pub reached: Stage2State,
}

pub struct Stage2 {
    /// The live `fw_env.config`, which describes the environment Stage1 left behind
    pub env_config: PathBuf,

    /// The `fw_env.config` for the miner configuration; taken from the payload, or derived from
    /// the layout, if not given
    pub miner_config: Option<PathBuf>,

    /// Use an already-extracted payload instead of reading it from flash
    pub payload_dir: Option<PathBuf>,

    /// Scratch space for generated files
    pub work_dir: PathBuf,

    pub layout: &'static FinalLayout,
}

const STEPS: usize = 6;

/// How far an earlier run got, as far as the flash shows
#[derive(Debug)]
enum Progress {
    /// Nothing past Stage1 has happened
    Fresh(MigrationMetadata),

    /// The miner configuration already carries the identity; only the retired partitions may
    /// still need erasing
    Configured,
}

impl Stage2 {
    pub fn run<F: Flash, P: Platform>(
        &self,
        flash: &mut F,
        platform: &mut P,
    ) -> Result<Stage2Report, StageError> {
        let layout = self.layout;
        let mut runner = Runner::new(Stage::Stage2, Stage2State::Start, STEPS);

        let (identity, progress) =
            runner.step("Reading identity", Stage2State::IdentityRead, |_| {
                if recover_interrupted(&self.env_config)? {
                    warn!("an earlier run was interrupted while the miner configuration was live");
                }
                let found = self.read_identity(flash)?;
                info!(
                    "identity: ethaddr={} miner_hwid={}",
                    found.0.ethaddr, found.0.miner_hwid
                );
                Ok(found)
            })?;

        let miner_cfg_prebuilt = match progress {
            Progress::Fresh(metadata) => {
                Some(self.configure(&mut runner, flash, &identity, &metadata)?)
            }
            Progress::Configured => {
                runner.skip("Unpacking stage2 payload", Stage2State::PayloadUnpacked);
                runner.skip("Writing recovery", Stage2State::RecoveryWritten);
                runner.skip("Writing miner configuration", Stage2State::MinerConfigWritten);
                None
            }
        };

        runner.step(
            "Erasing retired partitions",
            Stage2State::LegacyErased,
            |_| {
                for &device in layout.retired {
                    flash.erase_partition(device)?;
                }
                Ok(())
            },
        )?;

        runner.step("Rebooting into recovery", Stage2State::Done, |_| {
            platform.sync();
            platform.reboot()
        })?;

        Ok(Stage2Report {
            identity,
            miner_cfg_prebuilt,
            reached: runner.finish(),
        })
    }

    /// Steps 2-4: recovery bundle and miner configuration. Returns whether the payload had a
    /// prebuilt miner configuration.
    fn configure<F: Flash>(
        &self,
        runner: &mut Runner<Stage2State>,
        flash: &mut F,
        identity: &Identity,
        metadata: &MigrationMetadata,
    ) -> Result<bool, StageError> {
        let layout = self.layout;

        let (payload, recovery) = runner.step(
            "Unpacking stage2 payload",
            Stage2State::PayloadUnpacked,
            |_| {
                let payload = self.load_payload(flash, metadata)?;
                let rec = &layout.recovery;
                let recovery = [
                    StagedImage::from_bytes(files::KERNEL, payload.kernel.clone(), rec.kernel)?,
                    StagedImage::from_bytes(files::FACTORY, payload.factory.clone(), rec.factory)?,
                    StagedImage::from_bytes(
                        files::BITSTREAM,
                        payload.bitstream.clone(),
                        rec.bitstream,
                    )?,
                ];
                Ok((payload, recovery))
            },
        )?;

        runner.step("Writing recovery", Stage2State::RecoveryWritten, |_| {
            flash.erase_partition(layout.recovery.kernel.mtd)?;
            for image in &recovery {
                image.write(flash)?;
            }
            Ok(())
        })?;

        runner.step(
            "Writing miner configuration",
            Stage2State::MinerConfigWritten,
            |rpt| {
                flash.erase_partition(layout.miner_cfg.mtd)?;

                if let Some(miner_cfg) = &payload.miner_cfg {
                    for copy in layout.miner_cfg.copy_placements() {
                        StagedImage::from_bytes(files::MINER_CFG, miner_cfg.clone(), copy)?
                            .write(flash)?;
                    }
                } else {
                    rpt.add_info("No prebuilt miner configuration; starting from an empty one");
                }

                let miner_config = self.miner_config_path(&payload)?;
                with_env_config(&self.env_config, &miner_config, || {
                    let store = EnvStore::open(&self.env_config)?;
                    store.update_or_default(flash, |record| identity.apply_to(record))
                })
            },
        )?;

        Ok(payload.miner_cfg.is_some())
    }

    /// Find the identity, and work out how much of the migration is already done
    ///
    /// Normally the identity comes from the environment Stage1 wrote. Once that has been erased,
    /// the miner configuration is the only place left that holds it.
    fn read_identity<F: Flash>(&self, flash: &mut F) -> Result<(Identity, Progress), MigrateError> {
        let record = match EnvStore::open(&self.env_config)?.load(flash) {
            Ok(snapshot) => snapshot.record,
            Err(err @ MigrateError::EnvironmentCorrupt { .. }) => {
                warn!("{err}; taking the identity from the miner configuration");
                let record = self.miner_store()?.load(flash)?.record;
                return Ok((Identity::from_record(&record)?, Progress::Configured));
            }
            Err(err) => return Err(err),
        };

        let identity = Identity::from_record(&record)?;
        if self.configured_identity(flash)?.as_ref() == Some(&identity) {
            info!("miner configuration already carries this identity");
            return Ok((identity, Progress::Configured));
        }

        let metadata = MigrationMetadata::from_record(&record)?;
        Ok((identity, Progress::Fresh(metadata)))
    }

    /// The identity in the miner configuration, if it holds a complete one
    fn configured_identity<F: Flash>(&self, flash: &mut F) -> Result<Option<Identity>, MigrateError> {
        match self.miner_store()?.load(flash) {
            Ok(snapshot) => Ok(Identity::from_record(&snapshot.record).ok()),
            Err(MigrateError::EnvironmentCorrupt { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn miner_store(&self) -> Result<EnvStore, MigrateError> {
        match &self.miner_config {
            Some(path) => EnvStore::open(path),
            None => Ok(EnvStore::new(EnvConfig::from_placement(
                &self.layout.miner_cfg,
            ))),
        }
    }

    fn load_payload<F: Flash>(
        &self,
        flash: &mut F,
        metadata: &MigrationMetadata,
    ) -> Result<Stage2Payload, MigrateError> {
        if let Some(dir) = &self.payload_dir {
            info!("using extracted payload in {}", dir.display());
            return Stage2Payload::from_dir(dir);
        }

        let room = self
            .layout
            .map
            .by_mtd(metadata.stage2_mtd)
            .map(|part| part.size.saturating_sub(metadata.stage2_off))
            .ok_or_else(|| MigrateError::InvalidValue {
                key: metadata::STAGE2_MTD.into(),
                reason: format!("no mtd{} in the final layout", metadata.stage2_mtd),
            })?;
        if metadata.stage2_size > room {
            return Err(MigrateError::InvalidValue {
                key: metadata::STAGE2_SIZE.into(),
                reason: format!(
                    "{:#x} bytes at {:#x} runs past the end of mtd{}",
                    metadata.stage2_size, metadata.stage2_off, metadata.stage2_mtd
                ),
            });
        }

        info!(
            "reading {:#x}-byte payload from mtd{} at {:#x}",
            metadata.stage2_size, metadata.stage2_mtd, metadata.stage2_off
        );
        let mut archive = vec![0u8; metadata.stage2_size as usize];
        flash.read_at(metadata.stage2_mtd, metadata.stage2_off, &mut archive)?;
        Stage2Payload::from_archive(&archive[..])
    }

    /// Find (or write) the `fw_env.config` that points at the miner configuration
    fn miner_config_path(&self, payload: &Stage2Payload) -> Result<PathBuf, MigrateError> {
        if let Some(path) = &self.miner_config {
            return Ok(path.clone());
        }

        let text = match &payload.miner_cfg_config {
            Some(text) => text.clone(),
            None => {
                warn!("payload has no {}; deriving it", files::MINER_CFG_CONFIG);
                EnvConfig::from_placement(&self.layout.miner_cfg).render()
            }
        };

        // Refuse a config that wouldn't parse before it replaces the live one
        EnvConfig::parse(&text).map_err(|reason| MigrateError::EnvConfig {
            path: PathBuf::from(files::MINER_CFG_CONFIG),
            reason,
        })?;

        let path = self.work_dir.join(files::MINER_CFG_CONFIG);
        write_file(&path, &text)?;
        Ok(path)
    }
}

fn write_file(path: &Path, text: &str) -> Result<(), MigrateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(fs::write(path, text)?)
}
