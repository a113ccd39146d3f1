//! Parsing and generating `fw_env.config` files.
//!
//! Each non-comment line describes one copy of the environment:
//!
//! ```text
//! # device      offset   env size   sector size   sectors
//! /dev/mtd4     0x0      0x20000    0x20000       1
//! ```

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::MigrateError;
use crate::layout::EnvPlacement;
use crate::util::{format_hex, parse_number};

/// The location of one environment copy
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EnvCopy {
    pub device: u32,
    pub offset: u64,
    pub env_size: u64,

    /// The erase unit containing the copy; defaults to `env_size`
    pub sector_size: u64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EnvConfig {
    pub copies: Vec<EnvCopy>,
}

impl EnvConfig {
    /// Read and parse an `fw_env.config` file
    pub fn load(path: &Path) -> Result<Self, MigrateError> {
        let reason = |reason: String| MigrateError::EnvConfig {
            path: path.to_owned(),
            reason,
        };

        let text = fs::read_to_string(path).map_err(|e| reason(e.to_string()))?;
        Self::parse(&text).map_err(reason)
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let mut copies = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            let [device, offset, env_size, rest @ ..] = fields.as_slice() else {
                return Err(format!("line {}: expected device, offset and size", lineno + 1));
            };

            let number = |s: &str| {
                parse_number(s).ok_or_else(|| format!("line {}: bad number `{s}`", lineno + 1))
            };

            let device = device
                .strip_prefix("/dev/mtd")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| format!("line {}: `{device}` is not an MTD device", lineno + 1))?;
            let offset = number(*offset)?;
            let env_size = number(*env_size)?;
            let sector_size = match rest.first() {
                Some(s) => number(*s)?,
                None => env_size,
            };

            if env_size == 0 || sector_size < env_size {
                return Err(format!(
                    "line {}: environment does not fit its sector",
                    lineno + 1
                ));
            }

            copies.push(EnvCopy {
                device,
                offset,
                env_size,
                sector_size,
            });
        }

        let problem = match copies.as_slice() {
            [] => Some("no environment copies defined"),
            [first, rest @ ..] if rest.iter().any(|c| c.env_size != first.env_size) => {
                Some("redundant copies differ in size")
            }
            _ => None,
        };

        match problem {
            Some(problem) => Err(problem.into()),
            None => Ok(Self { copies }),
        }
    }

    /// The config describing an environment at a known placement
    pub fn from_placement(placement: &EnvPlacement) -> Self {
        let copies = placement
            .copies
            .iter()
            .map(|&offset| EnvCopy {
                device: placement.mtd,
                offset,
                env_size: placement.size,
                sector_size: placement.size,
            })
            .collect();

        Self { copies }
    }

    pub fn is_redundant(&self) -> bool {
        self.copies.len() > 1
    }

    pub fn env_size(&self) -> u64 {
        self.copies.first().map_or(0, |c| c.env_size)
    }

    /// Render in `fw_env.config` syntax
    pub fn render(&self) -> String {
        let mut text =
            String::from("# MTD device name\tDevice offset\tEnv. size\tFlash sector size\n");
        for copy in &self.copies {
            let _ = writeln!(
                text,
                "/dev/mtd{}\t\t{}\t\t{}\t\t{}",
                copy.device,
                format_hex(copy.offset),
                format_hex(copy.env_size),
                format_hex(copy.sector_size)
            );
        }
        text
    }
}

#[test]
fn test_parse() {
    let config = EnvConfig::parse(
        "# MTD device name\tDevice offset\tEnv. size\tFlash sector size\n\
         /dev/mtd1 0x000000 0x20000 0x20000 # primary\n\
         \n\
         /dev/mtd1\t131072\t0x20000\t0x20000\t1\n",
    )
    .unwrap();

    assert!(config.is_redundant());
    assert_eq!(config.env_size(), 0x20000);
    assert_eq!(
        config.copies[1],
        EnvCopy {
            device: 1,
            offset: 0x20000,
            env_size: 0x20000,
            sector_size: 0x20000,
        }
    );
}

#[test]
fn test_parse_defaults_sector_size() {
    let config = EnvConfig::parse("/dev/mtd5 0 0x4000").unwrap();
    assert!(!config.is_redundant());
    assert_eq!(config.copies[0].sector_size, 0x4000);
}

#[test]
fn test_parse_errors() {
    for bad in [
        "",
        "# only comments\n",
        "/dev/sda1 0 0x20000",
        "/dev/mtd1 0",
        "/dev/mtd1 zero 0x20000",
        "/dev/mtd1 0 0x20000 0x1000",
        "/dev/mtd1 0 0x20000\n/dev/mtd1 0x20000 0x10000 0x20000",
        "/dev/mtd1 0 0x100\n/dev/mtd1 0x100 0x100\n/dev/mtd1 0x200 0x80",
    ] {
        assert!(EnvConfig::parse(bad).is_err(), "{bad:?}");
    }
}

#[test]
fn test_parse_three_copies() {
    let config =
        EnvConfig::parse("/dev/mtd1 0 0x100\n/dev/mtd1 0x100 0x100\n/dev/mtd2 0x200 0x100").unwrap();
    assert!(config.is_redundant());
    assert_eq!(config.copies.len(), 3);
    assert_eq!(config.copies[2].device, 2);
    assert_eq!(EnvConfig::parse(&config.render()).unwrap(), config);
}

#[test]
fn test_render_round_trip() {
    let config = EnvConfig::from_placement(&crate::layout::FINAL_LAYOUT.miner_cfg);
    let text = config.render();
    assert!(text.contains("/dev/mtd5\t\t0x20000\t\t0x20000\t\t0x20000"));
    assert_eq!(EnvConfig::parse(&text).unwrap(), config);
}

#[test]
fn test_load_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fw_env.config");

    let err = EnvConfig::load(&path).unwrap_err();
    assert!(matches!(err, MigrateError::EnvConfig { ref path, .. } if path.ends_with("fw_env.config")));

    fs::write(&path, "/dev/mtd3 0x0 0x20000 0x20000\n").unwrap();
    assert_eq!(EnvConfig::load(&path).unwrap().copies[0].device, 3);
}
