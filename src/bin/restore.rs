//! Write a backup taken by `stage1 --backup-dir` back onto the NAND.
//!
//! Run this from a recovery system that numbers the MTD devices the way the backup's `uEnv.txt`
//! does, i.e. one booted with its `recovery_mtdparts`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use nand_migrate::{
    backup,
    cli::{self, FlashOptions, LogOptions},
    system::Platform,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    flash: FlashOptions,

    #[clap(flatten)]
    log: LogOptions,

    /// Directory holding the `mtdN.bin` dumps and `uEnv.txt`
    backup_dir: PathBuf,

    /// Stop instead of rebooting at the end
    #[clap(long)]
    no_reboot: bool,
}

fn run(args: Cli) -> anyhow::Result<()> {
    args.log.init()?;

    let mut flash = args.flash.open()?;
    let expected = backup::read_uenv(&args.backup_dir)?;
    let actual = flash.partitions()?;
    for part in &expected {
        match actual.iter().find(|p| p.mtd == part.mtd) {
            Some(p) if p.name == part.name => (),
            Some(p) => warn!(
                "mtd{} is {:?} here, but {:?} in the backup",
                part.mtd, p.name, part.name
            ),
            None => warn!("mtd{} ({}) does not exist here", part.mtd, part.name),
        }
    }

    let result = backup::restore(&mut flash, &args.backup_dir)
        .with_context(|| format!("restoring from {}", args.backup_dir.display()));
    flash.close()?;
    let restored = result?;
    info!("restored {} partitions", restored.len());

    let mut platform = args.flash.platform(args.no_reboot);
    platform.sync();
    platform.reboot()?;
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
