//! Stage1: runs under the factory firmware and installs everything the new firmware needs to boot.

use std::path::PathBuf;

use rand::Rng;
use tracing::info;

use super::{Identity, MigrationMetadata, Runner, Stage, Stage1State, StageError};
use crate::env::{EnvConfig, EnvImage, EnvStore};
use crate::error::MigrateError;
use crate::flash::Flash;
use crate::image::{files, StagedImage};
use crate::layout::{HardwareVariant, VariantTable};
use crate::system::Platform;

/// Everything Stage1 writes, loaded and size-checked up front
#[derive(Debug)]
pub struct Stage1Images {
    pub spl: StagedImage,
    pub uboot: StagedImage,
    pub bitstream: StagedImage,
    pub uboot_env: StagedImage,
    pub kernel: StagedImage,
    pub stage2: StagedImage,
}

impl Stage1Images {
    pub fn load(dir: &std::path::Path, variant: &HardwareVariant) -> Result<Self, MigrateError> {
        let load = |name, target| StagedImage::load(name, &dir.join(name), target);

        let env_target = variant
            .env
            .copy_placements()
            .next()
            .ok_or_else(|| MigrateError::Payload("variant has no environment copies".into()))?;

        let images = Self {
            spl: load(files::SPL, variant.spl)?,
            uboot: load(files::UBOOT, variant.uboot)?,
            bitstream: load(files::BITSTREAM, variant.bitstream)?,
            uboot_env: load(files::UBOOT_ENV, env_target)?,
            kernel: load(files::KERNEL, variant.kernel)?,
            stage2: load(files::STAGE2, variant.stage2)?,
        };

        // The environment image is written verbatim, so it had better be one
        let env_image = EnvImage::new(variant.env.size as usize, variant.env.copies.len() > 1);
        if env_image.decode(&images.uboot_env.data).is_none() {
            return Err(MigrateError::InvalidValue {
                key: files::UBOOT_ENV.into(),
                reason: format!(
                    "not a valid {:#x}-byte environment image",
                    variant.env.size
                ),
            });
        }

        Ok(images)
    }
}

/// What Stage1 did, for the operator
#[derive(Debug, Clone)]
pub struct Stage1Report {
    pub variant: &'static str,
    pub identity: Identity,
    pub metadata: MigrationMetadata,
    pub reached: Stage1State,
}

pub struct Stage1 {
    /// The factory environment, as the live `fw_env.config` describes it
    pub env: EnvStore,
    pub firmware_dir: PathBuf,

    /// Operator-supplied hardware ID
    pub hwid: Option<String>,

    pub variants: &'static VariantTable,
}

const STEPS: usize = 7;

impl Stage1 {
    pub fn run<F: Flash, P: Platform, R: Rng>(
        &self,
        flash: &mut F,
        platform: &mut P,
        rng: &mut R,
    ) -> Result<Stage1Report, StageError> {
        let mut runner = Runner::new(Stage::Stage1, Stage1State::Start, STEPS);

        let (variant, images, identity) = runner.step(
            "Resolving hardware variant",
            Stage1State::VariantResolved,
            |_| {
                let factory = self.env.load(flash)?.record;
                let variant = self.variants.resolve(&factory)?;
                info!("hardware variant {}", variant.name);

                let images = Stage1Images::load(&self.firmware_dir, variant)?;
                let identity = Identity::determine(
                    &factory,
                    self.hwid.as_deref(),
                    platform.mac_address(),
                    rng,
                )?;
                info!("identity: ethaddr={} miner_hwid={}", identity.ethaddr, identity.miner_hwid);

                Ok((variant, images, identity))
            },
        )?;

        runner.step("Writing bootloader", Stage1State::BootloaderWritten, |_| {
            for device in variant.boot_devices() {
                flash.erase_partition(device)?;
            }
            images.spl.write(flash)?;
            images.uboot.write(flash)?;
            images.bitstream.write(flash)
        })?;

        runner.step(
            "Erasing environment",
            Stage1State::EnvironmentErased,
            |_| flash.erase_partition(variant.env.mtd),
        )?;

        runner.step(
            "Writing environment",
            Stage1State::EnvironmentWritten,
            |_| {
                for copy in variant.env.copy_placements() {
                    flash.write_at(copy.mtd, copy.offset, &images.uboot_env.data)?;
                }
                Ok(())
            },
        )?;

        runner.step(
            "Writing kernel and stage2 payload",
            Stage1State::PayloadWritten,
            |_| {
                flash.erase_partition(variant.kernel.mtd)?;
                if variant.stage2.mtd != variant.kernel.mtd {
                    flash.erase_partition(variant.stage2.mtd)?;
                }
                images.kernel.write(flash)?;
                images.stage2.write(flash)
            },
        )?;

        let metadata = MigrationMetadata::new(
            variant,
            images.bitstream.size(),
            images.kernel.size(),
            images.stage2.size(),
        );
        runner.step(
            "Publishing migration metadata",
            Stage1State::MetadataPublished,
            |_| {
                let store = EnvStore::new(EnvConfig::from_placement(&variant.env));
                store.update(flash, |record| {
                    metadata.apply_to(record)?;
                    identity.apply_to(record)
                })
            },
        )?;

        runner.step("Rebooting", Stage1State::Done, |_| {
            platform.sync();
            platform.reboot()
        })?;

        Ok(Stage1Report {
            variant: variant.name,
            identity,
            metadata,
            reached: runner.finish(),
        })
    }
}
