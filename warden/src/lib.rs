#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Trust-and-ordering backbone for a small cluster: device admission, leader
//! election with fencing tokens, an authority write-ahead log and a
//! mutually exclusive mode gate.

pub mod access;
pub mod config;
pub mod crypto;
pub mod election;
pub mod error;
pub mod identity;
pub mod message;
pub mod mode;
pub mod node;
pub mod pairing;
pub mod registry;
pub mod storage;
pub mod time;
pub mod wal;

pub mod test_utils;

pub use access::{Operation, RoleEnforcer};
pub use config::ClusterConfig;
pub use election::{FencingToken, LeaderElection};
pub use error::{Error, Result};
pub use identity::DeviceIdentity;
pub use mode::{Mode, ModeGate, ModeState};
pub use node::AuthorityNode;
pub use pairing::{DeviceCertificate, PairingAuthority, PairingToken};
pub use registry::{DeviceRegistry, DeviceStatus, RegistryEntry, Role};
pub use wal::{AuthorityWal, WalEntry};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// 256-bit device fingerprint: the blake3 hash of the device's public key.
///
/// Ordering is byte-wise, which is also the numeric order used to break
/// election ties.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub [u8; 32]);

impl DeviceId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({self})")
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::Crypto(format!("Invalid device id {s:?}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
