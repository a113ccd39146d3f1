//! Pieces shared by the command-line front-ends: flash backend selection, logging, and exit codes.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use tracing::{error, info};

use crate::backup::{self, MtdPartition};
use crate::error::MigrateError;
use crate::flash::{Flash, FlashWriter, GoodBlocks};
use crate::layout::{nand_map, NandMap};
use crate::migrate::StageError;
use crate::nand::{NandLayout, SimMtdSet, SimNand};
use crate::system::LinuxPlatform;

#[cfg(target_os = "linux")]
use crate::nand::mtd::LinuxMtdSet;

/// Where the live environment's `fw_env.config` normally lives
pub const DEFAULT_ENV_CONFIG: &str = "/etc/fw_env.config";

#[derive(Args, Debug)]
pub struct FlashOptions {
    /// Operate on a NAND image file instead of the system's MTD devices
    #[clap(long, requires_all = ["sim_layout", "sim_map"])]
    pub sim_image: Option<PathBuf>,

    /// Layout of the NAND to simulate (BLOCKSxPAGESxBYTES)
    #[clap(long)]
    pub sim_layout: Option<NandLayout>,

    /// Partition map to carve the simulated NAND with (final, dm-factory, ab-factory)
    #[clap(long, value_parser = parse_map)]
    pub sim_map: Option<&'static NandMap>,

    /// Write back the NAND image file when done
    #[clap(long, requires = "sim_image")]
    pub sim_write: bool,

    /// Read back and compare everything written
    #[clap(long)]
    pub verify: bool,
}

fn parse_map(name: &str) -> Result<&'static NandMap, String> {
    nand_map(name).ok_or_else(|| format!("unknown NAND map {name:?}"))
}

impl FlashOptions {
    pub fn is_simulated(&self) -> bool {
        self.sim_image.is_some()
    }

    pub fn open(&self) -> anyhow::Result<Backend> {
        if let (Some(path), Some(layout), Some(map)) = (&self.sim_image, self.sim_layout, self.sim_map)
        {
            let mut chip = SimNand::new(layout);
            if path.exists() {
                chip.load(&mut File::open(path)?)
                    .with_context(|| path.display().to_string())?;
            } else {
                info!("{} does not exist; starting from a blank NAND", path.display());
            }

            let writer = FlashWriter::new(SimMtdSet::new(chip, map)?).verify(self.verify);
            return Ok(Backend::Sim {
                writer,
                map,
                path: self.sim_write.then(|| path.clone()),
            });
        }

        #[cfg(target_os = "linux")]
        {
            Ok(Backend::Mtd(
                FlashWriter::new(LinuxMtdSet::new()).verify(self.verify),
            ))
        }

        #[cfg(not(target_os = "linux"))]
        anyhow::bail!("no MTD support on this platform; use --sim-image")
    }

    /// The platform to run against; simulated runs never reboot the host
    pub fn platform(&self, no_reboot: bool) -> LinuxPlatform {
        LinuxPlatform::new(!(no_reboot || self.is_simulated()))
    }
}

/// The flash a front-end was asked to operate on
#[derive(Debug)]
pub enum Backend {
    Sim {
        writer: FlashWriter<SimMtdSet>,
        map: &'static NandMap,

        /// Where to save the image on close, if at all
        path: Option<PathBuf>,
    },

    #[cfg(target_os = "linux")]
    Mtd(FlashWriter<LinuxMtdSet>),
}

impl Backend {
    /// Warn about any partition of `map` that the running kernel numbers differently
    pub fn check_map(&self, map: &NandMap) {
        match self {
            Backend::Sim { .. } => (),

            #[cfg(target_os = "linux")]
            Backend::Mtd(writer) => writer.mtds().check_map(map),
        }
    }

    /// Every MTD device, in order
    pub fn partitions(&self) -> Result<Vec<MtdPartition>, MigrateError> {
        match self {
            Backend::Sim { map, .. } => Ok(backup::partitions_of(map)),

            #[cfg(target_os = "linux")]
            Backend::Mtd(_) => backup::system_partitions(),
        }
    }

    /// Finish up, saving the simulated NAND if requested
    pub fn close(self) -> anyhow::Result<()> {
        if let Backend::Sim {
            writer,
            path: Some(path),
            ..
        } = self
        {
            save(writer.into_inner().into_chip(), &path)?;
        }
        Ok(())
    }
}

fn save(mut chip: SimNand, path: &Path) -> anyhow::Result<()> {
    chip.save(&mut File::create(path)?)
        .with_context(|| path.display().to_string())?;
    info!("saved NAND image to {}", path.display());
    Ok(())
}

impl Flash for Backend {
    fn erase_region(&mut self, device: u32, offset: u64, len: u64) -> Result<(), MigrateError> {
        match self {
            Backend::Sim { writer, .. } => writer.erase_region(device, offset, len),

            #[cfg(target_os = "linux")]
            Backend::Mtd(writer) => writer.erase_region(device, offset, len),
        }
    }

    fn erase_partition(&mut self, device: u32) -> Result<(), MigrateError> {
        match self {
            Backend::Sim { writer, .. } => writer.erase_partition(device),

            #[cfg(target_os = "linux")]
            Backend::Mtd(writer) => writer.erase_partition(device),
        }
    }

    fn write_at(&mut self, device: u32, offset: u64, payload: &[u8]) -> Result<(), MigrateError> {
        match self {
            Backend::Sim { writer, .. } => writer.write_at(device, offset, payload),

            #[cfg(target_os = "linux")]
            Backend::Mtd(writer) => writer.write_at(device, offset, payload),
        }
    }

    fn read_at(&mut self, device: u32, offset: u64, buf: &mut [u8]) -> Result<(), MigrateError> {
        match self {
            Backend::Sim { writer, .. } => writer.read_at(device, offset, buf),

            #[cfg(target_os = "linux")]
            Backend::Mtd(writer) => writer.read_at(device, offset, buf),
        }
    }

    fn good_blocks(&mut self, device: u32) -> Result<GoodBlocks, MigrateError> {
        match self {
            Backend::Sim { writer, .. } => writer.good_blocks(device),

            #[cfg(target_os = "linux")]
            Backend::Mtd(writer) => writer.good_blocks(device),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LogOptions {
    /// Enable debug logging
    #[clap(short, long)]
    pub verbose: bool,

    /// Don't draw the progress line
    #[clap(long)]
    pub no_progress: bool,
}

impl LogOptions {
    /// Install the log subscriber (stderr, `RUST_LOG` honored) and the progress consumer
    pub fn init(&self) -> anyhow::Result<()> {
        let level = match self.verbose {
            true => tracing::Level::DEBUG,
            false => tracing::Level::INFO,
        };

        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env_lossy(),
            )
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("could not install log subscriber: {e}"))?;

        if !self.no_progress {
            howudoin::init(howudoin::consumers::TermLine::default());
        }
        Ok(())
    }

    /// Tear down the progress line before the process exits
    pub fn finish(&self) {
        if !self.no_progress {
            howudoin::disable();
            thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down
        }
    }
}

/// The process exit code for an error that ended a run
pub fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|e| {
            e.downcast_ref::<StageError>()
                .map(StageError::exit_code)
                .or_else(|| e.downcast_ref::<MigrateError>().map(MigrateError::exit_code))
        })
        .unwrap_or(1)
}

/// Log the error chain and turn it into an exit code
pub fn fail(err: anyhow::Error) -> ExitCode {
    error!("{err:#}");
    ExitCode::from(exit_code(&err))
}

#[test]
fn test_exit_code() {
    use crate::migrate::{Checkpoint, Stage, Stage1State};

    let stage = StageError {
        stage: Stage::Stage1,
        step: "Resolving hardware variant",
        completed: Checkpoint::Stage1(Stage1State::Start),
        source: MigrateError::UnsupportedVariant("rootfs_flag=c".into()),
    };
    assert_eq!(exit_code(&anyhow::Error::new(stage)), 2);

    let env = anyhow::Error::new(MigrateError::NotFound("kernel_off".into())).context("printenv");
    assert_eq!(exit_code(&env), 4);

    assert_eq!(exit_code(&anyhow::anyhow!("usage")), 1);
}

#[test]
fn test_sim_backend() {
    use clap::Parser;

    #[derive(clap::Parser, Debug)]
    struct Cli {
        #[clap(flatten)]
        flash: FlashOptions,
    }

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("nand.bin");
    let path = image.to_str().unwrap();
    let args = ["test", "--sim-image", path, "--sim-layout", "2048x64x2048"];

    // Without a map there is nothing to carve the chip with
    assert!(Cli::try_parse_from(args).is_err());

    let cli = Cli::try_parse_from(args.iter().chain(&["--sim-map", "final"])).unwrap();
    assert!(cli.flash.is_simulated());
    assert!(!cli.flash.sim_write);

    let mut backend = cli.flash.open().unwrap();
    let parts = backend.partitions().unwrap();
    assert_eq!(parts.len(), 9);
    assert_eq!((parts[5].mtd, parts[5].name.as_str()), (5, "miner_cfg"));

    backend.erase_partition(5).unwrap();
    backend.write_at(5, 0x800, b"hello").unwrap();
    let mut buf = [0u8; 5];
    backend.read_at(5, 0x800, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");
    backend.close().unwrap();
    assert!(!image.exists());

    assert!(Cli::try_parse_from(args.iter().chain(&["--sim-map", "nonesuch"])).is_err());
}
