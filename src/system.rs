//! The parts of the running system a migration touches besides flash: flushing, rebooting, and
//! reading the network MAC.

use std::fs;

use nix::sys::reboot::{reboot, RebootMode};
use tracing::{info, warn};

use crate::error::MigrateError;

const ETH0_ADDRESS: &str = "/sys/class/net/eth0/address";

pub trait Platform {
    /// Flush all filesystem and block buffers
    fn sync(&mut self);

    /// Restart the device; only returns if rebooting is disabled or fails
    fn reboot(&mut self) -> Result<(), MigrateError>;

    /// The MAC address of eth0, as the kernel formats it
    fn mac_address(&self) -> Option<String>;
}

/// The real device
#[derive(Debug)]
pub struct LinuxPlatform {
    allow_reboot: bool,
}

impl LinuxPlatform {
    pub fn new(allow_reboot: bool) -> Self {
        Self { allow_reboot }
    }
}

impl Platform for LinuxPlatform {
    fn sync(&mut self) {
        nix::unistd::sync();
    }

    fn reboot(&mut self) -> Result<(), MigrateError> {
        if !self.allow_reboot {
            info!("reboot disabled; leaving the device running");
            return Ok(());
        }

        info!("rebooting");
        match reboot(RebootMode::RB_AUTOBOOT) {
            Ok(never) => match never {},
            Err(errno) => Err(MigrateError::Reboot(errno)),
        }
    }

    fn mac_address(&self) -> Option<String> {
        match fs::read_to_string(ETH0_ADDRESS) {
            Ok(mac) => Some(mac.trim().to_owned()).filter(|m| !m.is_empty()),
            Err(e) => {
                warn!("could not read {ETH0_ADDRESS}: {e}");
                None
            }
        }
    }
}

/// A platform that only counts what was asked of it, for simulated runs
#[derive(Debug, Default)]
pub struct SimPlatform {
    pub mac: Option<String>,
    pub syncs: u32,
    pub reboots: u32,
}

impl SimPlatform {
    pub fn with_mac(mac: &str) -> Self {
        Self {
            mac: Some(mac.to_owned()),
            ..Default::default()
        }
    }
}

impl Platform for SimPlatform {
    fn sync(&mut self) {
        self.syncs += 1;
    }

    fn reboot(&mut self) -> Result<(), MigrateError> {
        info!("simulated reboot");
        self.reboots += 1;
        Ok(())
    }

    fn mac_address(&self) -> Option<String> {
        self.mac.clone()
    }
}

#[test]
fn test_sim_platform() {
    let mut platform = SimPlatform::with_mac("00:0a:35:00:00:01");
    platform.sync();
    platform.reboot().unwrap();
    assert_eq!((platform.syncs, platform.reboots), (1, 1));
    assert_eq!(platform.mac_address().as_deref(), Some("00:0a:35:00:00:01"));
}
