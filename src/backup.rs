//! Raw dumps of every MTD partition, taken before Stage1 and written back by `restore`.
//!
//! A backup directory holds one `mtdN.bin` per partition and a `uEnv.txt` recording the partition
//! table as `recovery_mtdparts`, in the form the recovery firmware passes to the kernel. A dump is
//! the partition's good blocks, concatenated; bad blocks are skipped both ways, as `nanddump` and
//! `mtd write` do.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::error::MigrateError;
use crate::flash::Flash;
use crate::layout::NandMap;

pub const UENV: &str = "uEnv.txt";

const RECOVERY_MTDPARTS: &str = "recovery_mtdparts";
const MTDPARTS_DEVICE: &str = "pl35x-nand";

/// One MTD device, as listed by `/proc/mtd`
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MtdPartition {
    pub mtd: u32,
    pub size: u64,
    pub name: String,
}

impl MtdPartition {
    pub fn dump_name(&self) -> String {
        format!("mtd{}.bin", self.mtd)
    }
}

fn invalid(reason: impl Into<String>) -> MigrateError {
    MigrateError::Backup(reason.into())
}

/// The partitions a simulated chip was carved into
pub fn partitions_of(map: &NandMap) -> Vec<MtdPartition> {
    let mut parts: Vec<_> = map
        .partitions
        .iter()
        .map(|p| MtdPartition {
            mtd: p.mtd,
            size: p.size,
            name: p.name.to_owned(),
        })
        .collect();
    parts.sort_by_key(|p| p.mtd);
    parts
}

/// Parse the kernel's partition list:
///
/// ```text
/// dev:    size   erasesize  name
/// mtd0: 00080000 00020000 "boot"
/// ```
pub fn parse_proc_mtd(text: &str) -> Result<Vec<MtdPartition>, MigrateError> {
    let mut parts = Vec::new();

    for line in text.lines().skip(1).filter(|l| !l.trim().is_empty()) {
        let bad = || invalid(format!("unexpected /proc/mtd line `{line}`"));

        let (dev, rest) = line.split_once(':').ok_or_else(bad)?;
        let mtd = dev
            .strip_prefix("mtd")
            .and_then(|n| n.parse().ok())
            .ok_or_else(bad)?;

        let size = rest
            .split_whitespace()
            .next()
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            .ok_or_else(bad)?;
        let name = rest
            .split_once('"')
            .and_then(|(_, name)| name.strip_suffix('"'))
            .ok_or_else(bad)?;

        parts.push(MtdPartition {
            mtd,
            size,
            name: name.to_owned(),
        });
    }

    Ok(parts)
}

/// Read `/proc/mtd` on the running system
#[cfg(target_os = "linux")]
pub fn system_partitions() -> Result<Vec<MtdPartition>, MigrateError> {
    parse_proc_mtd(&fs::read_to_string("/proc/mtd")?)
}

/// `512k`, `2m`, `1g`, or plain bytes when not a whole number of KiB
fn format_size(mut size: u64) -> String {
    for unit in ["", "k", "m"] {
        if size % 1024 != 0 {
            return format!("{size}{unit}");
        }
        size /= 1024;
    }
    format!("{size}g")
}

fn parse_size(text: &str) -> Option<u64> {
    let (digits, multiplier) = match text.char_indices().last()? {
        (i, 'k') => (&text[..i], 1 << 10),
        (i, 'm') => (&text[..i], 1 << 20),
        (i, 'g') => (&text[..i], 1 << 30),
        _ => (text, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

/// Render `parts` as a kernel `mtdparts=` argument
///
/// The kernel numbers the partitions in order, so `parts` must be mtd0, mtd1, ... with no gaps.
pub fn format_mtdparts(parts: &[MtdPartition]) -> Result<String, MigrateError> {
    let mut text = format!("mtdparts={MTDPARTS_DEVICE}:");
    for (index, part) in parts.iter().enumerate() {
        if part.mtd as usize != index {
            return Err(invalid(format!(
                "mtd{} ({}) is out of sequence; mtdparts cannot express gaps",
                part.mtd, part.name
            )));
        }
        if index > 0 {
            text.push(',');
        }
        let _ = write!(text, "{}({})", format_size(part.size), part.name);
    }
    Ok(text)
}

pub fn parse_mtdparts(value: &str) -> Result<Vec<MtdPartition>, MigrateError> {
    let value = value.trim();
    let list = value
        .strip_prefix("mtdparts=")
        .and_then(|v| v.split_once(':'))
        .map(|(_, list)| list)
        .ok_or_else(|| invalid(format!("`{value}` is not an mtdparts argument")))?;

    list.split(',')
        .enumerate()
        .map(|(index, entry)| {
            let bad = || invalid(format!("bad mtdparts entry `{entry}`"));
            let (size, name) = entry.split_once('(').ok_or_else(bad)?;
            let name = name.strip_suffix(')').ok_or_else(bad)?;
            Ok(MtdPartition {
                mtd: index as u32,
                size: parse_size(size).ok_or_else(bad)?,
                name: name.to_owned(),
            })
        })
        .collect()
}

/// Dump every partition in `parts` into `dir`, along with the `uEnv.txt` describing them
pub fn backup<F: Flash>(
    flash: &mut F,
    parts: &[MtdPartition],
    dir: &Path,
    ethaddr: Option<&str>,
) -> Result<(), MigrateError> {
    let mtdparts = format_mtdparts(parts)?;
    fs::create_dir_all(dir)?;

    let rpt = howudoin::new()
        .label("Backing up NAND")
        .set_len(u64::try_from(parts.len()).ok());

    for part in parts {
        rpt.desc(format!("mtd{} ({})", part.mtd, part.name));
        let good = flash.good_blocks(part.mtd)?;
        if good.size != part.size {
            return Err(invalid(format!(
                "mtd{} is {:#x} bytes, but the partition table says {:#x}",
                part.mtd, good.size, part.size
            )));
        }

        let path = dir.join(part.dump_name());
        let mut out = BufWriter::new(File::create(&path)?);
        let mut buf = vec![0u8; good.block_size as usize];
        for &offset in &good.offsets {
            flash.read_at(part.mtd, offset, &mut buf)?;
            out.write_all(&buf)?;
        }
        out.flush()?;

        debug!(
            "mtd{}: {:#x} bytes to {}",
            part.mtd,
            good.capacity(),
            path.display()
        );
        rpt.inc();
    }

    let mut uenv = format!("recovery=yes\n{RECOVERY_MTDPARTS}={mtdparts}\n");
    if let Some(mac) = ethaddr {
        let _ = writeln!(uenv, "ethaddr={mac}");
    }
    fs::write(dir.join(UENV), uenv)?;

    rpt.finish();
    info!("backed up {} partitions to {}", parts.len(), dir.display());
    Ok(())
}

/// The partition table a backup was taken with
pub fn read_uenv(dir: &Path) -> Result<Vec<MtdPartition>, MigrateError> {
    let path = dir.join(UENV);
    let text = fs::read_to_string(&path)?;
    let value = text
        .lines()
        .find_map(|line| line.strip_prefix(RECOVERY_MTDPARTS)?.strip_prefix('='))
        .ok_or_else(|| invalid(format!("{} has no {RECOVERY_MTDPARTS}", path.display())))?;
    parse_mtdparts(value)
}

/// Write every dump in `dir` back to the partition it came from
///
/// Everything is checked against the flash before the first erase. Returns the partitions that
/// were restored.
pub fn restore<F: Flash>(flash: &mut F, dir: &Path) -> Result<Vec<MtdPartition>, MigrateError> {
    let parts = read_uenv(dir)?;

    let mut plan = Vec::with_capacity(parts.len());
    for part in &parts {
        let good = flash.good_blocks(part.mtd)?;
        if good.size != part.size {
            return Err(invalid(format!(
                "mtd{} ({}) is {:#x} bytes, but the backup was taken from a {:#x}-byte partition",
                part.mtd, part.name, good.size, part.size
            )));
        }

        let path = dir.join(part.dump_name());
        let len = fs::metadata(&path)?.len();
        if len % good.block_size != 0 || len > good.capacity() {
            return Err(invalid(format!(
                "{} is {len:#x} bytes, which does not fit the good blocks of mtd{}",
                path.display(),
                part.mtd
            )));
        }
        let blocks = len / good.block_size;
        plan.push((part, path, good, blocks));
    }

    let rpt = howudoin::new()
        .label("Restoring NAND")
        .set_len(u64::try_from(plan.len()).ok());

    for (part, path, good, blocks) in plan {
        rpt.desc(format!("mtd{} ({})", part.mtd, part.name));
        flash.erase_partition(part.mtd)?;

        let mut dump = BufReader::new(File::open(&path)?);
        let mut buf = vec![0u8; good.block_size as usize];
        for &offset in good.offsets.iter().take(blocks as usize) {
            dump.read_exact(&mut buf)?;
            flash.write_at(part.mtd, offset, &buf)?;
        }

        debug!("mtd{}: restored {blocks} blocks", part.mtd);
        rpt.inc();
    }

    rpt.finish();
    info!("restored {} partitions from {}", parts.len(), dir.display());
    Ok(parts)
}

#[cfg(test)]
mod test_support {
    use crate::flash::FlashWriter;
    use crate::layout::{NandMap, PartitionSpec};
    use crate::nand::{NandLayout, SimMtdSet, SimNand};

    pub const LAYOUT: NandLayout = NandLayout {
        blocks: 16,
        pages_per_block: 4,
        bytes_per_page: 256,
    };

    pub static MAP: NandMap = NandMap {
        name: "backup-test",
        partitions: &[
            PartitionSpec::new("boot", 0, 0x0000, 0x1000),
            PartitionSpec::new("env", 1, 0x1000, 0x0800),
            PartitionSpec::new("rootfs", 2, 0x1800, 0x2800),
        ],
    };

    pub fn flash(chip: SimNand) -> FlashWriter<SimMtdSet> {
        FlashWriter::new(SimMtdSet::new(chip, &MAP).unwrap()).verify(true)
    }
}

#[test]
fn test_parse_proc_mtd() {
    let parts = parse_proc_mtd(
        "dev:    size   erasesize  name\n\
         mtd0: 00080000 00020000 \"boot\"\n\
         mtd1: 00280000 00020000 \"u-boot env\"\n",
    )
    .unwrap();

    assert_eq!(
        parts,
        [
            MtdPartition {
                mtd: 0,
                size: 0x80000,
                name: "boot".into(),
            },
            MtdPartition {
                mtd: 1,
                size: 0x280000,
                name: "u-boot env".into(),
            },
        ]
    );

    assert!(parse_proc_mtd("dev: size erasesize name\nmtdx: 1 1 \"x\"\n").is_err());
}

#[test]
fn test_mtdparts() {
    let parts = partitions_of(&crate::layout::FINAL_MAP);
    let text = format_mtdparts(&parts).unwrap();
    assert!(text.starts_with("mtdparts=pl35x-nand:512k(boot),2560k(uboot),2m(fpga1),"));
    assert!(text.ends_with(",94m(firmware2)"));
    assert_eq!(parse_mtdparts(&text).unwrap(), parts);

    assert_eq!(format_size(0x40000000), "1g");
    assert_eq!(format_size(1000), "1000");
    assert_eq!(parse_size("3g"), Some(3 << 30));
    assert_eq!(parse_size("k"), None);

    // Partition numbers must be contiguous
    assert!(format_mtdparts(&parts[1..]).is_err());
    assert!(parse_mtdparts("mtdparts=pl35x-nand:512k(boot),junk").is_err());
    assert!(parse_mtdparts("512k(boot)").is_err());
}

#[test]
fn test_backup_restore_round_trip() {
    use crate::nand::SimNand;

    let dir = tempfile::tempdir().unwrap();
    let parts = partitions_of(&test_support::MAP);
    let mut flash = test_support::flash(SimNand::new(test_support::LAYOUT));

    let boot: Vec<u8> = (0..0x1000).map(|i| (i % 251) as u8).collect();
    flash.write_at(0, 0, &boot).unwrap();
    flash.write_at(1, 0x400, b"bootdelay=3").unwrap();
    flash.write_at(2, 0x1000, &[0x77; 0x900]).unwrap();

    backup(&mut flash, &parts, dir.path(), Some("00:0A:35:DD:EE:FF")).unwrap();
    assert_eq!(fs::read(dir.path().join("mtd0.bin")).unwrap(), boot);
    assert_eq!(
        fs::read_to_string(dir.path().join(UENV)).unwrap(),
        "recovery=yes\n\
         recovery_mtdparts=mtdparts=pl35x-nand:4k(boot),2k(env),10k(rootfs)\n\
         ethaddr=00:0A:35:DD:EE:FF\n"
    );

    // Wreck everything, then put it back
    let original = flash.into_inner().into_chip();
    let mut flash = test_support::flash(original.clone());
    for part in &parts {
        flash.erase_partition(part.mtd).unwrap();
        flash.write_at(part.mtd, 0, &[0x00; 0x300]).unwrap();
    }

    assert_eq!(restore(&mut flash, dir.path()).unwrap(), parts);
    for part in &parts {
        let mut expected = vec![0u8; part.size as usize];
        let mut actual = vec![0u8; part.size as usize];
        test_support::flash(original.clone())
            .read_at(part.mtd, 0, &mut expected)
            .unwrap();
        flash.read_at(part.mtd, 0, &mut actual).unwrap();
        assert_eq!(actual, expected, "mtd{}", part.mtd);
    }
}

#[test]
fn test_backup_skips_bad_blocks() {
    use crate::nand::SimNand;

    let dir = tempfile::tempdir().unwrap();
    let mut chip = SimNand::new(test_support::LAYOUT);
    chip.mark_bad(7).unwrap();
    let mut flash = test_support::flash(chip);

    // Block 1 of rootfs is bad; the data lands on blocks 0 and 2
    flash.write_at(2, 0, &[0x42; 0x800]).unwrap();
    backup(&mut flash, &partitions_of(&test_support::MAP), dir.path(), None).unwrap();

    let dump = fs::read(dir.path().join("mtd2.bin")).unwrap();
    assert_eq!(dump.len(), 0x2400);
    assert!(dump[..0x800].iter().all(|&b| b == 0x42));
    assert!(!fs::read_to_string(dir.path().join(UENV))
        .unwrap()
        .contains("ethaddr"));

    // Restoring onto a chip without the bad block keeps the data contiguous
    let mut fresh = test_support::flash(SimNand::new(test_support::LAYOUT));
    restore(&mut fresh, dir.path()).unwrap();
    let mut buf = vec![0u8; 0x800];
    fresh.read_at(2, 0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0x42));
}

#[test]
fn test_restore_checks_before_erasing() {
    use crate::flash::{FlashOp, RecordingFlash};
    use crate::nand::SimNand;

    let dir = tempfile::tempdir().unwrap();
    let parts = partitions_of(&test_support::MAP);
    let mut flash = test_support::flash(SimNand::new(test_support::LAYOUT));
    backup(&mut flash, &parts, dir.path(), None).unwrap();

    // A dump that no longer fits its partition
    fs::write(dir.path().join("mtd2.bin"), vec![0u8; 0x2C00]).unwrap();
    let mut flash = RecordingFlash::new(flash);
    assert!(matches!(
        restore(&mut flash, dir.path()),
        Err(MigrateError::Backup(_))
    ));
    assert!(flash.ops.is_empty());

    // A backup taken with a different partition table
    fs::write(
        dir.path().join(UENV),
        "recovery_mtdparts=mtdparts=pl35x-nand:8k(boot)\n",
    )
    .unwrap();
    assert!(restore(&mut flash, dir.path()).is_err());
    assert!(!flash
        .ops
        .iter()
        .any(|op| matches!(op, FlashOp::ErasePartition { .. })));
}
