//! First stage of the NAND migration, run from the factory firmware.
//!
//! On success the device reboots into the freshly written bootloader, which boots the transitional
//! kernel that runs `stage2`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use nand_migrate::{
    backup,
    cli::{self, FlashOptions, LogOptions, DEFAULT_ENV_CONFIG},
    env::EnvStore,
    layout::VARIANTS,
    migrate::{identity, Stage1},
    system::Platform,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    flash: FlashOptions,

    #[clap(flatten)]
    log: LogOptions,

    /// Directory holding boot.bin, u-boot.img, system.bit.gz, uboot_env.bin, fit.itb and stage2.tgz
    #[clap(long)]
    firmware_dir: PathBuf,

    /// The `fw_env.config` describing the factory environment
    #[clap(long, default_value = DEFAULT_ENV_CONFIG)]
    env_config: PathBuf,

    /// Dump every MTD partition here before touching anything
    #[clap(long, required_unless_present = "no_backup")]
    backup_dir: Option<PathBuf>,

    /// Skip the backup
    #[clap(long, conflicts_with = "backup_dir")]
    no_backup: bool,

    /// Hardware ID to record, instead of the existing or a generated one
    #[clap(long)]
    hwid: Option<String>,

    /// Stop instead of rebooting at the end
    #[clap(long)]
    no_reboot: bool,
}

fn run(args: Cli) -> anyhow::Result<()> {
    args.log.init()?;

    let stage1 = Stage1 {
        env: EnvStore::open(&args.env_config)?,
        firmware_dir: args.firmware_dir,
        hwid: args.hwid,
        variants: &VARIANTS,
    };

    let mut flash = args.flash.open()?;
    let mut platform = args.flash.platform(args.no_reboot);

    if let Some(dir) = &args.backup_dir {
        let ethaddr = stage1
            .env
            .get(&mut flash, identity::ETHADDR)
            .ok()
            .flatten()
            .or_else(|| platform.mac_address());
        let parts = flash.partitions()?;
        backup::backup(&mut flash, &parts, dir, ethaddr.as_deref())
            .with_context(|| format!("backing up to {}", dir.display()))?;
    } else {
        warn!("no backup requested; the factory firmware cannot be restored afterward");
    }

    let result = stage1.run(&mut flash, &mut platform, &mut rand::thread_rng());
    flash.close()?;

    let report = result?;
    info!(
        "stage1 complete: variant {}, kernel at {:#x}, stage2 payload on mtd{} at {:#x}",
        report.variant,
        report.metadata.kernel_off,
        report.metadata.stage2_mtd,
        report.metadata.stage2_off
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Cli::parse();
    let log = args.log.clone();

    let result = run(args);
    log.finish();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => cli::fail(err),
    }
}
