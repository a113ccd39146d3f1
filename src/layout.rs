//! Static NAND partition maps and the hardware variant table.
//!
//! All of this is bit-exact: U-Boot reads the bitstream and kernel from fixed raw NAND offsets that
//! it is told about through its environment, and it never negotiates them. Offsets in a
//! `PartitionSpec` are absolute on the chip; offsets in a `Placement` are relative to the MTD
//! device it names.
//!
//! Stage1 runs under the factory firmware and therefore sees the chip through a factory map.
//! Stage2 runs under the new firmware, which sees the same chip through `FINAL_MAP`.

use crate::env::EnvRecord;
use crate::error::MigrateError;

/// One MTD partition of a NAND chip
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PartitionSpec {
    pub name: &'static str,

    /// The N in `/dev/mtdN`
    pub mtd: u32,

    /// The physical chip this partition lives on
    pub device: u32,

    /// Absolute byte offset on the chip
    pub offset: u64,

    pub size: u64,
}

impl PartitionSpec {
    /// A partition of chip 0
    pub const fn new(name: &'static str, mtd: u32, offset: u64, size: u64) -> Self {
        Self {
            name,
            mtd,
            device: 0,
            offset,
            size,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    fn overlaps(&self, other: &PartitionSpec) -> bool {
        self.device == other.device && self.offset < other.end() && other.offset < self.end()
    }
}

/// A named MTD numbering of the chip
#[derive(Debug)]
pub struct NandMap {
    pub name: &'static str,
    pub partitions: &'static [PartitionSpec],
}

impl NandMap {
    pub fn by_mtd(&self, mtd: u32) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.mtd == mtd)
    }

    pub fn by_name(&self, name: &str) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// Convert a position inside MTD device `mtd` to an absolute chip offset
    pub fn absolute(&self, mtd: u32, offset: u64) -> Option<u64> {
        let part = self.by_mtd(mtd)?;
        (offset < part.size).then_some(part.offset + offset)
    }

    /// Check that no two partitions of the same device overlap, and that MTD indices are unique
    pub fn validate(&self) -> Result<(), String> {
        for (i, a) in self.partitions.iter().enumerate() {
            for b in &self.partitions[i + 1..] {
                if a.mtd == b.mtd {
                    return Err(format!("{}: mtd{} is defined twice", self.name, a.mtd));
                }
                if a.overlaps(b) {
                    return Err(format!("{}: {} overlaps {}", self.name, a.name, b.name));
                }
            }
        }
        Ok(())
    }
}

/// Where one artifact goes: an MTD device, an offset within it, and how much room there is
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Placement {
    pub mtd: u32,
    pub offset: u64,
    pub max_size: u64,
}

impl Placement {
    pub const fn new(mtd: u32, offset: u64, max_size: u64) -> Self {
        Self {
            mtd,
            offset,
            max_size,
        }
    }
}

/// Where the copies of a redundant U-Boot environment live
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EnvPlacement {
    pub mtd: u32,
    pub copies: &'static [u64],
    pub size: u64,
}

impl EnvPlacement {
    /// The placement of each copy, for writing a prebuilt environment image
    pub fn copy_placements(&self) -> impl Iterator<Item = Placement> + '_ {
        self.copies
            .iter()
            .map(|&offset| Placement::new(self.mtd, offset, self.size))
    }
}

/// An exact `key=value` requirement on the factory environment
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Condition {
    pub key: &'static str,
    pub value: &'static str,
}

/// Everything that differs between the supported factory firmwares
#[derive(Debug)]
pub struct HardwareVariant {
    pub name: &'static str,

    /// All of these must hold for the variant to be selected
    pub discriminant: &'static [Condition],

    /// How the factory firmware numbers the MTD devices
    pub factory: &'static NandMap,

    pub spl: Placement,
    pub uboot: Placement,
    pub bitstream: Placement,
    pub env: EnvPlacement,

    /// Where Stage1 writes the kernel and the stage2 payload (factory numbering)
    pub kernel: Placement,
    pub stage2: Placement,

    /// Absolute NAND offsets handed to U-Boot
    pub bitstream_off: u64,
    pub kernel_off: u64,

    /// Where the new firmware finds the stage2 payload (final numbering)
    pub stage2_mtd: u32,
    pub stage2_off: u64,
}

impl HardwareVariant {
    /// The MTD devices holding bootloader artifacts, in the order they must be erased
    pub fn boot_devices(&self) -> Vec<u32> {
        let mut devices = Vec::with_capacity(3);
        for mtd in [self.spl.mtd, self.uboot.mtd, self.bitstream.mtd] {
            if !devices.contains(&mtd) {
                devices.push(mtd);
            }
        }
        devices
    }

    fn matches(&self, env: &EnvRecord) -> bool {
        self.discriminant
            .iter()
            .all(|cond| env.get(cond.key) == Some(cond.value))
    }
}

/// The set of variants a migration may encounter
#[derive(Debug)]
pub struct VariantTable {
    pub variants: &'static [HardwareVariant],
}

impl VariantTable {
    /// Select the single variant whose discriminant matches the factory environment
    pub fn resolve(&self, env: &EnvRecord) -> Result<&'static HardwareVariant, MigrateError> {
        let matching: Vec<_> = self.variants.iter().filter(|v| v.matches(env)).collect();

        match matching.as_slice() {
            [variant] => Ok(variant),
            [] => Err(MigrateError::UnsupportedVariant(format!(
                "no variant matches ({})",
                self.describe_discriminants(env)
            ))),
            several => Err(MigrateError::UnsupportedVariant(format!(
                "ambiguous, matches {}",
                several
                    .iter()
                    .map(|v| v.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&'static HardwareVariant> {
        self.variants.iter().find(|v| v.name == name)
    }

    /// Summarize the values of every discriminant key, for error messages
    fn describe_discriminants(&self, env: &EnvRecord) -> String {
        let mut keys: Vec<&str> = self
            .variants
            .iter()
            .flat_map(|v| v.discriminant.iter().map(|c| c.key))
            .collect();
        keys.sort_unstable();
        keys.dedup();

        keys.iter()
            .map(|key| format!("{key}={}", env.get(key).unwrap_or("<unset>")))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// The recovery partition contents, as the bootloader expects them
#[derive(Debug)]
pub struct RecoveryLayout {
    pub kernel: Placement,
    pub factory: Placement,
    pub bitstream: Placement,
}

/// The layout of the new firmware
#[derive(Debug)]
pub struct FinalLayout {
    pub map: &'static NandMap,
    pub uboot_env: EnvPlacement,
    pub miner_cfg: EnvPlacement,
    pub recovery: RecoveryLayout,

    /// Erased at the very end of Stage2, in this order; the live environment must be last
    pub retired: &'static [u32],
}

pub const ENV_SIZE: u64 = 0x20000;

pub const RECOVERY_KERNEL_OFF: u64 = 0x0000000;
pub const RECOVERY_FACTORY_OFF: u64 = 0x0800000;
pub const RECOVERY_BITSTREAM_OFF: u64 = 0x1400000;

pub static FINAL_MAP: NandMap = NandMap {
    name: "final",
    partitions: &[
        PartitionSpec::new("boot", 0, 0x0000000, 0x0080000),
        PartitionSpec::new("uboot", 1, 0x0080000, 0x0280000),
        PartitionSpec::new("fpga1", 2, 0x0300000, 0x0200000),
        PartitionSpec::new("fpga2", 3, 0x0500000, 0x0200000),
        PartitionSpec::new("uboot_env", 4, 0x0700000, 0x0080000),
        PartitionSpec::new("miner_cfg", 5, 0x0780000, 0x0080000),
        PartitionSpec::new("recovery", 6, 0x0800000, 0x1600000),
        PartitionSpec::new("firmware1", 7, 0x1E00000, 0x5E00000),
        PartitionSpec::new("firmware2", 8, 0x7C00000, 0x5E00000),
    ],
};

pub static FINAL_LAYOUT: FinalLayout = FinalLayout {
    map: &FINAL_MAP,
    uboot_env: EnvPlacement {
        mtd: 4,
        copies: &[0x0, 0x20000],
        size: ENV_SIZE,
    },
    miner_cfg: EnvPlacement {
        mtd: 5,
        copies: &[0x0, 0x20000],
        size: ENV_SIZE,
    },
    recovery: RecoveryLayout {
        kernel: Placement::new(6, RECOVERY_KERNEL_OFF, RECOVERY_FACTORY_OFF - RECOVERY_KERNEL_OFF),
        factory: Placement::new(
            6,
            RECOVERY_FACTORY_OFF,
            RECOVERY_BITSTREAM_OFF - RECOVERY_FACTORY_OFF,
        ),
        bitstream: Placement::new(6, RECOVERY_BITSTREAM_OFF, 0x1600000 - RECOVERY_BITSTREAM_OFF),
    },
    retired: &[2, 3, 7, 8, 4],
};

/// DragonMint factory firmware: two full images, selected by `image_flag`
pub static DM_FACTORY_MAP: NandMap = NandMap {
    name: "dm-factory",
    partitions: &[
        PartitionSpec::new("boot", 0, 0x0000000, 0x0700000),
        PartitionSpec::new("env", 1, 0x0700000, 0x0100000),
        PartitionSpec::new("sysinfo", 2, 0x0800000, 0x0800000),
        PartitionSpec::new("image0", 3, 0x1000000, 0x6000000),
        PartitionSpec::new("image1", 4, 0x7000000, 0x6000000),
        PartitionSpec::new("data", 5, 0xD000000, 0x3000000),
    ],
};

/// A/B factory firmware: split bootloader partitions and `rootfs_flag` slot selection
pub static AB_FACTORY_MAP: NandMap = NandMap {
    name: "ab-factory",
    partitions: &[
        PartitionSpec::new("spl", 0, 0x0000000, 0x0080000),
        PartitionSpec::new("uboot", 1, 0x0080000, 0x0280000),
        PartitionSpec::new("fpga", 2, 0x0300000, 0x0400000),
        PartitionSpec::new("env", 3, 0x0700000, 0x0100000),
        PartitionSpec::new("recovery", 4, 0x0800000, 0x1800000),
        PartitionSpec::new("rootfs_a", 5, 0x2000000, 0x5800000),
        PartitionSpec::new("rootfs_b", 6, 0x7800000, 0x5800000),
        PartitionSpec::new("data", 7, 0xD000000, 0x3000000),
    ],
};

pub static NAND_MAPS: [&NandMap; 3] = [&FINAL_MAP, &DM_FACTORY_MAP, &AB_FACTORY_MAP];

/// Look up a map by name (used by the simulator front-ends)
pub fn nand_map(name: &str) -> Option<&'static NandMap> {
    NAND_MAPS.iter().copied().find(|m| m.name == name)
}

const KERNEL_MAX: u64 = 0x0C00000;
const STAGE2_MAX: u64 = 0x2000000;
const BITSTREAM_OFF: u64 = 0x0300000;

const FACTORY_ENV: EnvPlacement = EnvPlacement {
    mtd: 1,
    copies: &[0x0, 0x20000],
    size: ENV_SIZE,
};

pub static VARIANTS: VariantTable = VariantTable {
    variants: &[
        HardwareVariant {
            name: "dm-image0",
            discriminant: &[Condition {
                key: "image_flag",
                value: "0",
            }],
            factory: &DM_FACTORY_MAP,
            spl: Placement::new(0, 0x0000000, 0x0080000),
            uboot: Placement::new(0, 0x0080000, 0x0280000),
            bitstream: Placement::new(0, BITSTREAM_OFF, 0x0200000),
            env: FACTORY_ENV,
            kernel: Placement::new(4, 0x0D00000, KERNEL_MAX),
            stage2: Placement::new(4, 0x1900000, STAGE2_MAX),
            bitstream_off: BITSTREAM_OFF,
            kernel_off: 0x7D00000,
            stage2_mtd: 8,
            stage2_off: 0x0D00000,
        },
        HardwareVariant {
            name: "dm-image1",
            discriminant: &[Condition {
                key: "image_flag",
                value: "1",
            }],
            factory: &DM_FACTORY_MAP,
            spl: Placement::new(0, 0x0000000, 0x0080000),
            uboot: Placement::new(0, 0x0080000, 0x0280000),
            bitstream: Placement::new(0, BITSTREAM_OFF, 0x0200000),
            env: FACTORY_ENV,
            kernel: Placement::new(3, 0x1100000, KERNEL_MAX),
            stage2: Placement::new(3, 0x1D00000, STAGE2_MAX),
            bitstream_off: BITSTREAM_OFF,
            kernel_off: 0x2100000,
            stage2_mtd: 7,
            stage2_off: 0x0F00000,
        },
        HardwareVariant {
            name: "A",
            discriminant: &[Condition {
                key: "rootfs_flag",
                value: "a",
            }],
            factory: &AB_FACTORY_MAP,
            spl: Placement::new(0, 0x0, 0x0080000),
            uboot: Placement::new(1, 0x0, 0x0280000),
            bitstream: Placement::new(2, 0x0, 0x0200000),
            env: EnvPlacement {
                mtd: 3,
                ..FACTORY_ENV
            },
            kernel: Placement::new(6, 0x0500000, KERNEL_MAX),
            stage2: Placement::new(6, 0x1100000, STAGE2_MAX),
            bitstream_off: BITSTREAM_OFF,
            kernel_off: 0x7D00000,
            stage2_mtd: 8,
            stage2_off: 0x0D00000,
        },
        HardwareVariant {
            name: "B",
            discriminant: &[Condition {
                key: "rootfs_flag",
                value: "b",
            }],
            factory: &AB_FACTORY_MAP,
            spl: Placement::new(0, 0x0, 0x0080000),
            uboot: Placement::new(1, 0x0, 0x0280000),
            bitstream: Placement::new(2, 0x0, 0x0200000),
            env: EnvPlacement {
                mtd: 3,
                ..FACTORY_ENV
            },
            kernel: Placement::new(5, 0x0100000, KERNEL_MAX),
            stage2: Placement::new(5, 0x0D00000, STAGE2_MAX),
            bitstream_off: BITSTREAM_OFF,
            kernel_off: 0x2100000,
            stage2_mtd: 7,
            stage2_off: 0x0F00000,
        },
    ],
};

#[cfg(test)]
fn env_with(pairs: &[(&str, &str)]) -> EnvRecord {
    let mut env = EnvRecord::new();
    for (k, v) in pairs {
        env.insert(k, v).unwrap();
    }
    env
}

#[test]
fn test_maps_do_not_overlap() {
    for map in NAND_MAPS {
        map.validate().unwrap();
    }
    for variant in VARIANTS.variants {
        variant.factory.validate().unwrap();
    }
}

#[test]
fn test_overlap_detected() {
    static BAD: NandMap = NandMap {
        name: "bad",
        partitions: &[
            PartitionSpec::new("a", 0, 0x0, 0x20000),
            PartitionSpec::new("b", 1, 0x10000, 0x20000),
        ],
    };
    assert!(BAD.validate().is_err());
}

#[test]
fn test_placements_fit_their_partitions() {
    let fits = |map: &NandMap, p: &Placement| {
        let part = map.by_mtd(p.mtd).expect("placement names a missing mtd");
        assert!(p.offset + p.max_size <= part.size, "{p:?} overflows {}", part.name);
    };

    for v in VARIANTS.variants {
        for p in [&v.spl, &v.uboot, &v.bitstream, &v.kernel, &v.stage2] {
            fits(v.factory, p);
        }
        for p in v.env.copy_placements() {
            fits(v.factory, &p);
        }
    }

    let recovery = &FINAL_LAYOUT.recovery;
    for p in [&recovery.kernel, &recovery.factory, &recovery.bitstream] {
        fits(FINAL_LAYOUT.map, p);
    }
}

#[test]
fn test_live_environment_retired_last() {
    let retired = FINAL_LAYOUT.retired;
    assert_eq!(retired.last(), Some(&FINAL_LAYOUT.uboot_env.mtd));
    assert!(!retired.contains(&FINAL_LAYOUT.miner_cfg.mtd));
    assert!(!retired.contains(&FINAL_LAYOUT.recovery.kernel.mtd));
}

#[test]
fn test_factory_and_final_agree_on_physical_locations() {
    for v in VARIANTS.variants {
        let factory_abs = |p: &Placement| v.factory.absolute(p.mtd, p.offset).unwrap();

        // U-Boot reads the kernel and bitstream from where Stage1 put them
        assert_eq!(factory_abs(&v.kernel), v.kernel_off, "{}", v.name);
        assert_eq!(factory_abs(&v.bitstream), v.bitstream_off, "{}", v.name);
        assert_eq!(
            FINAL_MAP.by_name("fpga1").map(|p| p.offset),
            Some(v.bitstream_off)
        );

        // The new firmware finds the stage2 payload where Stage1 put it
        assert_eq!(
            FINAL_MAP.absolute(v.stage2_mtd, v.stage2_off),
            Some(factory_abs(&v.stage2)),
            "{}",
            v.name
        );

        // ...and the whole payload stays within that partition
        let dst = FINAL_MAP.by_mtd(v.stage2_mtd).unwrap();
        assert!(v.stage2_off + v.stage2.max_size <= dst.size);

        // The transitional environment is the final uboot_env
        assert_eq!(v.env.copies.len(), FINAL_LAYOUT.uboot_env.copies.len());
        for (copy, final_copy) in v.env.copies.iter().zip(FINAL_LAYOUT.uboot_env.copies) {
            assert_eq!(
                v.factory.absolute(v.env.mtd, *copy),
                FINAL_MAP.absolute(FINAL_LAYOUT.uboot_env.mtd, *final_copy)
            );
        }
    }
}

#[test]
fn test_resolve_exact_match() {
    let env = env_with(&[("rootfs_flag", "a"), ("bootdelay", "3")]);
    let variant = VARIANTS.resolve(&env).unwrap();
    assert_eq!(variant.name, "A");
    assert_eq!(variant.kernel.offset, 0x0500000);
    assert_eq!(variant.kernel.mtd, 6);
    assert_eq!(variant.kernel_off, 0x7D00000);
    assert_eq!(variant.stage2_mtd, 8);

    let env = env_with(&[("image_flag", "1")]);
    assert_eq!(VARIANTS.resolve(&env).unwrap().name, "dm-image1");
}

#[test]
fn test_resolve_rejects_unknown_and_fuzzy() {
    for env in [
        env_with(&[]),
        env_with(&[("rootfs_flag", "A")]),
        env_with(&[("rootfs_flag", "a ")]),
        env_with(&[("image_flag", "2")]),
    ] {
        assert!(matches!(
            VARIANTS.resolve(&env),
            Err(MigrateError::UnsupportedVariant(_))
        ));
    }
}

#[test]
fn test_resolve_rejects_ambiguous() {
    let env = env_with(&[("rootfs_flag", "a"), ("image_flag", "0")]);
    let err = VARIANTS.resolve(&env).unwrap_err();
    assert!(err.to_string().contains("ambiguous"));
}

#[test]
fn test_boot_devices() {
    assert_eq!(VARIANTS.by_name("dm-image0").unwrap().boot_devices(), [0]);
    assert_eq!(VARIANTS.by_name("A").unwrap().boot_devices(), [0, 1, 2]);
}
