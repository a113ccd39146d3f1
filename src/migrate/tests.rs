//! Whole-stage scenarios on a simulated 256 MiB chip.

use std::fs;
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use tempfile::TempDir;

use super::payload::build_archive;
use super::*;
use crate::env::{EnvConfig, EnvImage, EnvRecord, EnvStore};
use crate::flash::{Flash, FlashOp, FlashWriter, RecordingFlash};
use crate::image::files;
use crate::layout::{EnvPlacement, HardwareVariant, NandMap, FINAL_LAYOUT, FINAL_MAP, VARIANTS};
use crate::nand::{NandLayout, SimFault, SimMtdSet, SimNand};
use crate::system::SimPlatform;
use crate::util::format_hex;

const GEOMETRY: &str = "2048x64x2048";
const MAC: &str = "00:0A:35:DD:EE:FF";

const SPL: &[u8] = &[0x11; 0x1000];
const UBOOT: &[u8] = &[0x22; 0x2345];
const BITSTREAM: &[u8] = &[0x33; 0x800];
const KERNEL: &[u8] = &[0x44; 0x3000];
const FACTORY: &[u8] = &[0x55; 0x1800];

fn layout() -> NandLayout {
    GEOMETRY.parse().unwrap()
}

fn rng() -> rand::rngs::StdRng {
    rand::rngs::StdRng::seed_from_u64(7)
}

fn carve(chip: SimNand, map: &NandMap) -> FlashWriter<SimMtdSet> {
    FlashWriter::new(SimMtdSet::new(chip, map).unwrap()).verify(true)
}

/// A chip as it leaves the factory: just an environment
fn factory_flash(map: &NandMap, env: &EnvPlacement, record: &EnvRecord) -> FlashWriter<SimMtdSet> {
    let mut flash = carve(SimNand::new(layout()), map);
    EnvStore::new(EnvConfig::from_placement(env))
        .write(&mut flash, record, 1)
        .unwrap();
    flash
}

fn factory_record(discriminant: (&str, &str)) -> EnvRecord {
    let mut record = EnvRecord::new();
    record.insert("bootdelay", "3").unwrap();
    record.insert("ethaddr", MAC).unwrap();
    record.insert(discriminant.0, discriminant.1).unwrap();
    record
}

fn write_config(dir: &Path, name: &str, env: &EnvPlacement) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, EnvConfig::from_placement(env).render()).unwrap();
    path
}

fn stage2_members(miner_cfg: Option<&[u8]>) -> Vec<(&'static str, &[u8])> {
    let mut members = vec![
        (files::KERNEL, KERNEL),
        (files::FACTORY, FACTORY),
        (files::BITSTREAM, BITSTREAM),
    ];
    if let Some(miner_cfg) = miner_cfg {
        members.push((files::MINER_CFG, miner_cfg));
    }
    members
}

/// Populate a firmware directory, returning the stage2 archive it contains
fn firmware_dir(dir: &Path) -> Vec<u8> {
    let mut new_env = EnvRecord::new();
    new_env.insert("bootcmd", "run nand_boot").unwrap();
    let uboot_env = EnvImage::new(0x20000, true).encode(&new_env, 0).unwrap();
    let stage2 = build_archive(&stage2_members(None));

    fs::create_dir_all(dir).unwrap();
    for (name, data) in [
        (files::SPL, SPL),
        (files::UBOOT, UBOOT),
        (files::BITSTREAM, BITSTREAM),
        (files::UBOOT_ENV, &uboot_env[..]),
        (files::KERNEL, KERNEL),
        (files::STAGE2, &stage2[..]),
    ] {
        fs::write(dir.join(name), data).unwrap();
    }
    stage2
}

fn stage1(dir: &TempDir, variant: &HardwareVariant) -> Stage1 {
    Stage1 {
        env: EnvStore::open(&write_config(dir.path(), "fw_env.config", &variant.env)).unwrap(),
        firmware_dir: dir.path().join("firmware"),
        hwid: None,
        variants: &VARIANTS,
    }
}

fn read<F: Flash>(flash: &mut F, device: u32, offset: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    flash.read_at(device, offset, &mut buf).unwrap();
    buf
}

fn chip_block(flash: &FlashWriter<SimMtdSet>, device: u32, offset: u64) -> u32 {
    let block = (offset / layout().block_size()) as u32;
    flash.mtds().chip_block(device, block).unwrap()
}

#[test]
fn test_stage1_unsupported_variant_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    firmware_dir(&dir.path().join("firmware"));
    let variant = VARIANTS.by_name("A").unwrap();

    let record = factory_record(("rootfs_flag", "c"));
    let mut flash = RecordingFlash::new(factory_flash(variant.factory, &variant.env, &record));
    let mut platform = SimPlatform::default();

    let err = stage1(&dir, variant)
        .run(&mut flash, &mut platform, &mut rng())
        .unwrap_err();

    assert!(matches!(err.source, MigrateError::UnsupportedVariant(_)));
    assert_eq!(err.completed, Checkpoint::Stage1(Stage1State::Start));
    assert_eq!(err.exit_code(), 2);
    assert!(flash.ops.is_empty());
    assert_eq!(platform.reboots, 0);
}

#[test]
fn test_stage1_oversized_image_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let firmware = dir.path().join("firmware");
    firmware_dir(&firmware);
    fs::write(firmware.join(files::SPL), vec![0u8; 0x80001]).unwrap();
    let variant = VARIANTS.by_name("B").unwrap();

    let record = factory_record(("rootfs_flag", "b"));
    let mut flash = RecordingFlash::new(factory_flash(variant.factory, &variant.env, &record));

    let err = stage1(&dir, variant)
        .run(&mut flash, &mut SimPlatform::default(), &mut rng())
        .unwrap_err();

    assert!(matches!(err.source, MigrateError::ImageTooLarge { .. }));
    assert!(flash.ops.is_empty());
}

#[test]
fn test_stage1_payload_fault_after_environment() {
    let dir = tempfile::tempdir().unwrap();
    firmware_dir(&dir.path().join("firmware"));
    let variant = VARIANTS.by_name("B").unwrap();

    let record = factory_record(("rootfs_flag", "b"));
    let mut flash = factory_flash(variant.factory, &variant.env, &record);
    let bad = chip_block(&flash, variant.kernel.mtd, variant.kernel.offset);
    flash
        .mtds_mut()
        .chip_mut()
        .inject_fault(bad, SimFault::Program)
        .unwrap();
    let mut flash = RecordingFlash::new(flash);
    let mut platform = SimPlatform::default();

    let err = stage1(&dir, variant)
        .run(&mut flash, &mut platform, &mut rng())
        .unwrap_err();

    assert_eq!(err.step, "Writing kernel and stage2 payload");
    assert_eq!(
        err.completed,
        Checkpoint::Stage1(Stage1State::EnvironmentWritten)
    );
    assert!(matches!(
        err.source,
        MigrateError::FlashWriteFailed { device: 5, .. }
    ));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(platform.reboots, 0);

    // Both environment copies were written before the payload partition was touched
    let env_writes: Vec<usize> = variant
        .env
        .copies
        .iter()
        .map(|&offset| {
            flash
                .position(|op| {
                    matches!(op, FlashOp::Write { device, offset: o, .. }
                        if *device == variant.env.mtd && *o == offset)
                })
                .unwrap()
        })
        .collect();
    let payload_erase = flash
        .position(|op| *op == FlashOp::ErasePartition { device: 5 })
        .unwrap();
    assert!(env_writes.iter().all(|&w| w < payload_erase));

    // The new environment is in place, without metadata
    let store = EnvStore::new(EnvConfig::from_placement(&variant.env));
    let snapshot = store.load(&mut flash).unwrap();
    assert!(snapshot.healthy);
    assert_eq!(snapshot.record.get("bootcmd"), Some("run nand_boot"));
    assert_eq!(snapshot.record.get(metadata::KERNEL_OFF), None);
}

#[test]
fn test_stage2_restores_config_when_miner_cfg_fails() {
    let dir = tempfile::tempdir().unwrap();
    let payload_dir = dir.path().join("payload");
    fs::create_dir_all(&payload_dir).unwrap();
    for (name, data) in stage2_members(None) {
        fs::write(payload_dir.join(name), data).unwrap();
    }

    // The environment Stage1 would have left
    let mut record = EnvRecord::new();
    MigrationMetadata::new(VARIANTS.by_name("A").unwrap(), 1, 1, 1)
        .apply_to(&mut record)
        .unwrap();
    record.insert("ethaddr", MAC).unwrap();
    record.insert("miner_hwid", "abcdefghijklmnop").unwrap();
    let mut flash = factory_flash(&FINAL_MAP, &FINAL_LAYOUT.uboot_env, &record);

    let bad = chip_block(&flash, FINAL_LAYOUT.miner_cfg.mtd, 0);
    flash
        .mtds_mut()
        .chip_mut()
        .inject_fault(bad, SimFault::Program)
        .unwrap();

    let live = write_config(dir.path(), "fw_env.config", &FINAL_LAYOUT.uboot_env);
    let original = fs::read_to_string(&live).unwrap();

    let mut platform = SimPlatform::default();
    let err = Stage2 {
        env_config: live.clone(),
        miner_config: None,
        payload_dir: Some(payload_dir),
        work_dir: dir.path().join("work"),
        layout: &FINAL_LAYOUT,
    }
    .run(&mut flash, &mut platform)
    .unwrap_err();

    assert_eq!(err.step, "Writing miner configuration");
    assert_eq!(
        err.completed,
        Checkpoint::Stage2(Stage2State::RecoveryWritten)
    );
    assert!(matches!(
        err.source,
        MigrateError::FlashWriteFailed { device: 5, .. }
    ));

    assert_eq!(fs::read_to_string(&live).unwrap(), original);
    assert!(!dir.path().join("fw_env.config.orig").exists());
    assert_eq!(platform.reboots, 0);

    // Retired partitions are untouched, so the old environment still reads
    let store = EnvStore::new(EnvConfig::from_placement(&FINAL_LAYOUT.uboot_env));
    assert_eq!(store.require(&mut flash, "ethaddr").unwrap(), MAC);
}

#[test]
fn test_end_to_end_variant_a() {
    let dir = tempfile::tempdir().unwrap();
    let stage2_archive = firmware_dir(&dir.path().join("firmware"));
    let variant = VARIANTS.by_name("A").unwrap();

    // Stage1, under the factory layout
    let record = factory_record(("rootfs_flag", "a"));
    let mut flash = factory_flash(variant.factory, &variant.env, &record);
    let mut platform = SimPlatform::default();
    let report = stage1(&dir, variant)
        .run(&mut flash, &mut platform, &mut rng())
        .unwrap();

    assert_eq!(report.variant, "A");
    assert_eq!(report.reached, Stage1State::Done);
    assert_eq!(report.metadata.kernel_off, 0x7D00000);
    assert_eq!(report.metadata.stage2_mtd, 8);
    assert_eq!(report.identity.ethaddr, MAC);
    assert_eq!((platform.syncs, platform.reboots), (1, 1));

    // "Reboot" into the new firmware, which sees the final layout
    let mut flash = carve(flash.into_inner().into_chip(), &FINAL_MAP);

    let uboot_env = EnvStore::new(EnvConfig::from_placement(&FINAL_LAYOUT.uboot_env));
    let env = uboot_env.load(&mut flash).unwrap();
    assert!(env.healthy);
    assert_eq!(env.record.get("kernel_off"), Some("0x7D00000"));
    assert_eq!(env.record.get("kernel_size"), Some("0x3000"));
    assert_eq!(env.record.get("bitstream_off"), Some("0x300000"));
    assert_eq!(env.record.get("stage2_off"), Some("0xD00000"));
    assert_eq!(
        env.record.get("stage2_size"),
        Some(format_hex(stage2_archive.len() as u64).as_str())
    );
    assert_eq!(env.record.get("stage2_mtd"), Some("8"));
    assert_eq!(env.record.get("ethaddr"), Some(MAC));
    assert_eq!(env.record.get("bootcmd"), Some("run nand_boot"));

    // U-Boot finds what it needs at the absolute offsets it was given
    assert_eq!(read(&mut flash, 0, 0, SPL.len()), SPL);
    assert_eq!(read(&mut flash, 1, 0, UBOOT.len()), UBOOT);
    assert_eq!(read(&mut flash, 2, 0, BITSTREAM.len()), BITSTREAM);
    assert_eq!(read(&mut flash, 8, 0x7D00000 - 0x7C00000, KERNEL.len()), KERNEL);

    // Stage2, under the final layout
    let live = write_config(dir.path(), "fw_env.config.final", &FINAL_LAYOUT.uboot_env);
    let original = fs::read_to_string(&live).unwrap();
    let mut platform = SimPlatform::default();
    let report2 = Stage2 {
        env_config: live.clone(),
        miner_config: None,
        payload_dir: None,
        work_dir: dir.path().join("work"),
        layout: &FINAL_LAYOUT,
    }
    .run(&mut flash, &mut platform)
    .unwrap();

    assert_eq!(report2.reached, Stage2State::Done);
    assert_eq!(report2.identity, report.identity);
    assert_eq!(report2.miner_cfg_prebuilt, Some(false));
    assert_eq!((platform.syncs, platform.reboots), (1, 1));
    assert_eq!(fs::read_to_string(&live).unwrap(), original);

    // Identity lands in miner_cfg, MAC byte-for-byte
    let miner_cfg = EnvStore::new(EnvConfig::from_placement(&FINAL_LAYOUT.miner_cfg));
    assert_eq!(miner_cfg.require(&mut flash, "ethaddr").unwrap(), MAC);
    assert_eq!(
        miner_cfg.require(&mut flash, "miner_hwid").unwrap(),
        report.identity.miner_hwid
    );

    // Recovery bundle
    assert_eq!(read(&mut flash, 6, 0x0000000, KERNEL.len()), KERNEL);
    assert_eq!(read(&mut flash, 6, 0x0800000, FACTORY.len()), FACTORY);
    assert_eq!(read(&mut flash, 6, 0x1400000, BITSTREAM.len()), BITSTREAM);

    // Retired partitions are gone
    assert!(matches!(
        uboot_env.load(&mut flash),
        Err(MigrateError::EnvironmentCorrupt { .. })
    ));
    for (device, offset) in [(2, 0), (8, 0x100000), (8, 0xD00000)] {
        assert!(read(&mut flash, device, offset, 0x800)
            .iter()
            .all(|&b| b == 0xFF));
    }

    // The bootloader survived
    assert_eq!(read(&mut flash, 1, 0, UBOOT.len()), UBOOT);
}

#[test]
fn test_stage1_dm_image1() {
    let dir = tempfile::tempdir().unwrap();
    firmware_dir(&dir.path().join("firmware"));
    let variant = VARIANTS.by_name("dm-image1").unwrap();

    let record = factory_record(("image_flag", "1"));
    let mut flash = RecordingFlash::new(factory_flash(variant.factory, &variant.env, &record));
    let report = stage1(&dir, variant)
        .run(&mut flash, &mut SimPlatform::default(), &mut rng())
        .unwrap();

    assert_eq!(report.variant, "dm-image1");
    assert_eq!(report.metadata.kernel_off, 0x2100000);
    assert_eq!(report.metadata.stage2_mtd, 7);

    // One combined boot partition, and the image1 slot for the payload
    let erased: Vec<u32> = flash
        .ops
        .iter()
        .filter_map(|op| match op {
            FlashOp::ErasePartition { device } => Some(*device),
            _ => None,
        })
        .collect();
    assert_eq!(erased, [0, 1, 3]);

    // The kernel went to image0, where U-Boot will look for it
    let mut flash = carve(flash.inner.into_inner().into_chip(), &FINAL_MAP);
    assert_eq!(read(&mut flash, 7, 0x2100000 - 0x1E00000, KERNEL.len()), KERNEL);
    assert_eq!(read(&mut flash, 0, 0, SPL.len()), SPL);
    assert_eq!(read(&mut flash, 1, 0, UBOOT.len()), UBOOT);
    assert_eq!(read(&mut flash, 2, 0, BITSTREAM.len()), BITSTREAM);
}

/// Run Stage1 for variant A, then "reboot" into the final layout
fn migrated_flash(dir: &TempDir) -> (FlashWriter<SimMtdSet>, Stage1Report) {
    firmware_dir(&dir.path().join("firmware"));
    let variant = VARIANTS.by_name("A").unwrap();

    let record = factory_record(("rootfs_flag", "a"));
    let mut flash = factory_flash(variant.factory, &variant.env, &record);
    let report = stage1(dir, variant)
        .run(&mut flash, &mut SimPlatform::default(), &mut rng())
        .unwrap();
    (carve(flash.into_inner().into_chip(), &FINAL_MAP), report)
}

fn stage2(dir: &TempDir, live: &Path) -> Stage2 {
    Stage2 {
        env_config: live.to_owned(),
        miner_config: None,
        payload_dir: None,
        work_dir: dir.path().join("work"),
        layout: &FINAL_LAYOUT,
    }
}

#[test]
fn test_stage2_rerun_after_retire_fault() {
    let dir = tempfile::tempdir().unwrap();
    let (mut flash, report) = migrated_flash(&dir);
    let live = write_config(dir.path(), "fw_env.config", &FINAL_LAYOUT.uboot_env);
    let original = fs::read_to_string(&live).unwrap();

    let bad = chip_block(&flash, 2, 0);
    flash
        .mtds_mut()
        .chip_mut()
        .inject_fault(bad, SimFault::Erase)
        .unwrap();

    let mut platform = SimPlatform::default();
    let err = stage2(&dir, &live)
        .run(&mut flash, &mut platform)
        .unwrap_err();
    assert_eq!(err.step, "Erasing retired partitions");
    assert_eq!(
        err.completed,
        Checkpoint::Stage2(Stage2State::MinerConfigWritten)
    );
    assert!(matches!(
        err.source,
        MigrateError::FlashEraseFailed { device: 2, .. }
    ));
    assert_eq!(platform.reboots, 0);

    // The live environment was not reached, and still holds the identity
    let uboot_env = EnvStore::new(EnvConfig::from_placement(&FINAL_LAYOUT.uboot_env));
    assert_eq!(uboot_env.require(&mut flash, "ethaddr").unwrap(), MAC);

    // Pretend the miner configuration swap was cut short, too
    fs::write(dir.path().join("fw_env.config.orig"), &original).unwrap();
    fs::write(
        &live,
        EnvConfig::from_placement(&FINAL_LAYOUT.miner_cfg).render(),
    )
    .unwrap();

    flash.mtds_mut().chip_mut().clear_fault(bad).unwrap();
    let mut flash = RecordingFlash::new(flash);
    let mut platform = SimPlatform::default();
    let report2 = stage2(&dir, &live).run(&mut flash, &mut platform).unwrap();

    assert_eq!(report2.reached, Stage2State::Done);
    assert_eq!(report2.identity, report.identity);
    assert_eq!(report2.miner_cfg_prebuilt, None);
    assert_eq!(platform.reboots, 1);
    assert_eq!(fs::read_to_string(&live).unwrap(), original);
    assert!(!dir.path().join("fw_env.config.orig").exists());

    // Only the retired partitions were touched, the live environment last
    let erased: Vec<u32> = flash
        .ops
        .iter()
        .map(|op| match op {
            FlashOp::ErasePartition { device } => *device,
            op => panic!("unexpected {op:?}"),
        })
        .collect();
    assert_eq!(erased, FINAL_LAYOUT.retired);

    assert!(matches!(
        uboot_env.load(&mut flash),
        Err(MigrateError::EnvironmentCorrupt { .. })
    ));
    assert!(read(&mut flash, 2, 0, 0x800).iter().all(|&b| b == 0xFF));

    // A third run has only the miner configuration to go on, and still gets through
    let report3 = stage2(&dir, &live)
        .run(&mut flash, &mut SimPlatform::default())
        .unwrap();
    assert_eq!(report3.identity, report.identity);
    assert_eq!(report3.reached, Stage2State::Done);
}

#[test]
fn test_stage2_rejects_payload_past_partition_end() {
    let dir = tempfile::tempdir().unwrap();
    let (mut flash, _) = migrated_flash(&dir);
    let live = write_config(dir.path(), "fw_env.config", &FINAL_LAYOUT.uboot_env);

    let uboot_env = EnvStore::new(EnvConfig::from_placement(&FINAL_LAYOUT.uboot_env));
    uboot_env
        .set(&mut flash, metadata::STAGE2_SIZE, "0xFFFFFFFFFFFF")
        .unwrap();

    let mut flash = RecordingFlash::new(flash);
    let err = stage2(&dir, &live)
        .run(&mut flash, &mut SimPlatform::default())
        .unwrap_err();

    assert_eq!(err.step, "Unpacking stage2 payload");
    assert!(matches!(
        err.source,
        MigrateError::InvalidValue { ref key, .. } if key == metadata::STAGE2_SIZE
    ));
    assert!(flash.ops.is_empty());
}
