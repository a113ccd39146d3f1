//! Read and modify a U-Boot environment on NAND, in the manner of `fw_printenv`/`fw_setenv`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use nand_migrate::{
    cli::{self, FlashOptions, LogOptions, DEFAULT_ENV_CONFIG},
    env::{self, EnvStore},
};

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the named variables, or all of them
    Print {
        /// Print only the value (requires exactly one name)
        #[clap(short = 'n', long)]
        value_only: bool,

        names: Vec<String>,
    },

    /// Set a variable, or delete it if no value is given
    Set { name: String, value: Option<String> },

    /// Rewrite every copy of the environment, repairing any that are damaged
    Repair,
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    #[clap(flatten)]
    flash: FlashOptions,

    #[clap(flatten)]
    log: LogOptions,

    /// The `fw_env.config` describing the environment
    #[clap(short, long, default_value = DEFAULT_ENV_CONFIG)]
    config: PathBuf,

    #[clap(subcommand)]
    cmd: Command,
}

impl Command {
    fn execute<F: nand_migrate::flash::Flash>(
        self,
        flash: &mut F,
        config: &std::path::Path,
    ) -> anyhow::Result<()> {
        match self {
            Command::Print { value_only, names } => {
                let store = EnvStore::open(config)?;
                if names.is_empty() {
                    anyhow::ensure!(!value_only, "--value-only needs exactly one name");
                    for (key, value) in store.list(flash)? {
                        println!("{key}={value}");
                    }
                } else {
                    anyhow::ensure!(
                        !value_only || names.len() == 1,
                        "--value-only needs exactly one name"
                    );
                    let snapshot = store.load(flash)?;
                    for name in &names {
                        let value = snapshot.record.get(name).ok_or_else(|| {
                            nand_migrate::error::MigrateError::NotFound(name.clone())
                        })?;
                        match value_only {
                            true => println!("{value}"),
                            false => println!("{name}={value}"),
                        }
                    }
                }
            }

            Command::Set {
                name,
                value: Some(value),
            } => env::write_with_config(flash, config, &name, &value)?,

            Command::Set { name, value: None } => {
                if !EnvStore::open(config)?.remove(flash, &name)? {
                    tracing::info!("{name} was not set");
                }
            }

            Command::Repair => {
                let store = EnvStore::open(config)?;
                let snapshot = store.load(flash)?;
                store.write(flash, &snapshot.record, snapshot.flags.wrapping_add(1))?;
            }
        }

        Ok(())
    }
}

fn run(args: Cli) -> anyhow::Result<()> {
    args.log.init()?;

    let mut flash = args.flash.open()?;
    let result = args.cmd.execute(&mut flash, &args.config);
    flash.close()?;
    result
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
