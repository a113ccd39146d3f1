//! Second stage of the NAND migration, run from the transitional kernel Stage1 installed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use nand_migrate::{
    cli::{self, FlashOptions, LogOptions, DEFAULT_ENV_CONFIG},
    layout::FINAL_LAYOUT,
    migrate::Stage2,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    flash: FlashOptions,

    #[clap(flatten)]
    log: LogOptions,

    /// The `fw_env.config` describing the environment Stage1 wrote
    #[clap(long, default_value = DEFAULT_ENV_CONFIG)]
    env_config: PathBuf,

    /// The `fw_env.config` describing the miner configuration [default: from the payload]
    #[clap(long)]
    miner_config: Option<PathBuf>,

    /// Use an already-extracted stage2 payload instead of reading it from NAND
    #[clap(long)]
    payload_dir: Option<PathBuf>,

    /// Scratch directory for generated files
    #[clap(long, default_value = "/tmp/stage2")]
    work_dir: PathBuf,

    /// Stop instead of rebooting at the end
    #[clap(long)]
    no_reboot: bool,
}

fn run(args: Cli) -> anyhow::Result<()> {
    args.log.init()?;

    let mut flash = args.flash.open()?;
    flash.check_map(FINAL_LAYOUT.map);
    let mut platform = args.flash.platform(args.no_reboot);

    let stage2 = Stage2 {
        env_config: args.env_config,
        miner_config: args.miner_config,
        payload_dir: args.payload_dir,
        work_dir: args.work_dir,
        layout: &FINAL_LAYOUT,
    };
    let result = stage2.run(&mut flash, &mut platform);
    flash.close()?;

    let report = result?;
    info!(
        "stage2 complete: ethaddr={} miner_hwid={}{}",
        report.identity.ethaddr,
        report.identity.miner_hwid,
        match report.miner_cfg_prebuilt {
            Some(true) => "",
            Some(false) => " (fresh miner configuration)",
            None => " (resumed)",
        }
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
