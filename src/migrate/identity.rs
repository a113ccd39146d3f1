//! The device identity carried across the migration: its MAC address and hardware ID.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use tracing::{info, warn};

use crate::env::EnvRecord;
use crate::error::MigrateError;

pub const ETHADDR: &str = "ethaddr";
pub const MINER_HWID: &str = "miner_hwid";

/// Random bytes behind a generated hardware ID
const HWID_BYTES: usize = 12;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Identity {
    /// Exactly as found (or generated); never reformatted
    pub ethaddr: String,
    pub miner_hwid: String,
}

impl Identity {
    /// Work out the identity to give the new firmware
    ///
    /// The MAC comes from the factory environment, else from eth0, else is made up. The hardware
    /// ID is the operator's, else the one already in the environment, else is made up.
    pub fn determine<R: Rng>(
        factory: &EnvRecord,
        hwid: Option<&str>,
        eth0_mac: Option<String>,
        rng: &mut R,
    ) -> Result<Self, MigrateError> {
        let ethaddr = match (factory.get(ETHADDR), eth0_mac) {
            (Some(mac), _) => mac.to_owned(),
            (None, Some(mac)) => {
                info!("no {ETHADDR} in the factory environment; using eth0's {mac}");
                mac
            }
            (None, None) => {
                let mac = random_mac(rng);
                warn!("no MAC address found; generated {mac}");
                mac
            }
        };
        validate_mac(&ethaddr)?;

        let miner_hwid = match hwid.or(factory.get(MINER_HWID)) {
            Some(hwid) => {
                validate_hwid(hwid)?;
                hwid.to_owned()
            }
            None => generate_hwid(rng),
        };

        Ok(Self {
            ethaddr,
            miner_hwid,
        })
    }

    /// Read back an identity published into an environment
    pub fn from_record(record: &EnvRecord) -> Result<Self, MigrateError> {
        let get = |key: &str| {
            record
                .get(key)
                .map(str::to_owned)
                .ok_or_else(|| MigrateError::NotFound(key.to_owned()))
        };

        let identity = Self {
            ethaddr: get(ETHADDR)?,
            miner_hwid: get(MINER_HWID)?,
        };
        validate_mac(&identity.ethaddr)?;
        validate_hwid(&identity.miner_hwid)?;
        Ok(identity)
    }

    pub fn apply_to(&self, record: &mut EnvRecord) -> Result<(), MigrateError> {
        record.insert(ETHADDR, &self.ethaddr)?;
        record.insert(MINER_HWID, &self.miner_hwid)
    }
}

/// Six colon-separated pairs of hex digits
pub fn validate_mac(mac: &str) -> Result<(), MigrateError> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));

    if valid {
        Ok(())
    } else {
        Err(MigrateError::InvalidValue {
            key: ETHADDR.into(),
            reason: format!("`{mac}` is not a MAC address"),
        })
    }
}

fn validate_hwid(hwid: &str) -> Result<(), MigrateError> {
    let valid = !hwid.is_empty() && hwid.chars().all(|c| c.is_ascii_graphic());
    if valid {
        Ok(())
    } else {
        Err(MigrateError::InvalidValue {
            key: MINER_HWID.into(),
            reason: format!("`{hwid}` is not a hardware ID"),
        })
    }
}

/// A random locally administered unicast MAC
pub fn random_mac<R: Rng>(rng: &mut R) -> String {
    let mut octets: [u8; 6] = rng.gen();
    octets[0] = (octets[0] & 0xFE) | 0x02;

    octets
        .iter()
        .map(|o| format!("{o:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// A random 16-character ID using only letters and digits
pub fn generate_hwid<R: Rng>(rng: &mut R) -> String {
    let bytes: [u8; HWID_BYTES] = rng.gen();
    STANDARD.encode(bytes).replace('+', "a").replace('/', "b")
}

#[cfg(test)]
fn rng() -> rand::rngs::StdRng {
    use rand::SeedableRng;
    rand::rngs::StdRng::seed_from_u64(0x5EED)
}

#[test]
fn test_validate_mac() {
    for good in ["00:0A:35:DD:EE:FF", "00:0a:35:dd:ee:ff"] {
        validate_mac(good).unwrap();
    }
    for bad in [
        "",
        "00:0A:35:DD:EE",
        "00:0A:35:DD:EE:FF:00",
        "000A35DDEEFF",
        "00:0A:35:DD:EE:FG",
        "0:0A:35:DD:EE:FF0",
    ] {
        assert!(validate_mac(bad).is_err(), "{bad}");
    }
}

#[test]
fn test_random_mac() {
    let mut rng = rng();
    for _ in 0..32 {
        let mac = random_mac(&mut rng);
        validate_mac(&mac).unwrap();
        assert_eq!(mac, mac.to_uppercase());

        let first = u8::from_str_radix(&mac[..2], 16).unwrap();
        assert_eq!(first & 0x03, 0x02, "{mac} must be local and unicast");
    }
}

#[test]
fn test_generate_hwid() {
    let mut rng = rng();
    let hwid = generate_hwid(&mut rng);
    assert_eq!(hwid.len(), 16);
    assert!(hwid.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_ne!(hwid, generate_hwid(&mut rng));
}

#[test]
fn test_mac_sources() {
    let mut rng = rng();
    let mut factory = EnvRecord::new();

    // Random as a last resort
    let id = Identity::determine(&factory, None, None, &mut rng).unwrap();
    validate_mac(&id.ethaddr).unwrap();

    // eth0 beats random
    let eth0 = Some("00:0a:35:00:00:01".to_owned());
    let id = Identity::determine(&factory, None, eth0.clone(), &mut rng).unwrap();
    assert_eq!(id.ethaddr, "00:0a:35:00:00:01");

    // The factory environment beats eth0, and is kept verbatim
    factory.insert(ETHADDR, "00:0a:35:DD:ee:FF").unwrap();
    let id = Identity::determine(&factory, None, eth0, &mut rng).unwrap();
    assert_eq!(id.ethaddr, "00:0a:35:DD:ee:FF");

    factory.insert(ETHADDR, "bogus").unwrap();
    assert!(Identity::determine(&factory, None, None, &mut rng).is_err());
}

#[test]
fn test_hwid_sources() {
    let mut rng = rng();
    let mut factory = EnvRecord::new();
    factory.insert(ETHADDR, "00:0A:35:DD:EE:FF").unwrap();

    let id = Identity::determine(&factory, None, None, &mut rng).unwrap();
    assert_eq!(id.miner_hwid.len(), 16);

    factory.insert(MINER_HWID, "existingHwId0001").unwrap();
    let id = Identity::determine(&factory, None, None, &mut rng).unwrap();
    assert_eq!(id.miner_hwid, "existingHwId0001");

    let id = Identity::determine(&factory, Some("operatorHwId0002"), None, &mut rng).unwrap();
    assert_eq!(id.miner_hwid, "operatorHwId0002");

    assert!(Identity::determine(&factory, Some("has space"), None, &mut rng).is_err());
}

#[test]
fn test_record_round_trip() {
    let id = Identity {
        ethaddr: "00:0A:35:DD:EE:FF".into(),
        miner_hwid: "abcdEFGH1234abcd".into(),
    };
    let mut record = EnvRecord::new();
    id.apply_to(&mut record).unwrap();
    assert_eq!(Identity::from_record(&record).unwrap(), id);

    record.remove(MINER_HWID);
    assert!(matches!(
        Identity::from_record(&record),
        Err(MigrateError::NotFound(ref key)) if key == MINER_HWID
    ));
}
