use thiserror::Error;

use crate::{access::Operation, registry::Role, time::Timestamp, DeviceId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Identity corrupt: {reason}")]
    IdentityCorrupt { reason: String },

    #[error("Pairing token expired at {expired_at}")]
    TokenExpired { expired_at: Timestamp },

    #[error("Pairing token already consumed")]
    TokenConsumed,

    #[error("Pairing token unknown")]
    TokenUnknown,

    #[error("Registry full: capacity {capacity}")]
    RegistryFull { capacity: usize },

    #[error("Duplicate device {device:?}")]
    DuplicateDevice { device: DeviceId },

    #[error("Device {device:?} is revoked")]
    DeviceRevoked { device: DeviceId },

    #[error("Unknown device {device:?}")]
    UnknownDevice { device: DeviceId },

    #[error("Device id does not match the fingerprint of the presented key")]
    IdentityMismatch,

    #[error("Certificate signature does not verify")]
    InvalidCertificate,

    #[error("Stale fencing token: presented term {presented}, current term {current}")]
    StaleFencingToken { presented: u64, current: u64 },

    #[error("Device {device:?} does not hold the fencing token led by {leader:?}")]
    NotTokenHolder { device: DeviceId, leader: DeviceId },

    #[error("Role {role:?} may not perform {operation:?}")]
    RoleDenied { role: Role, operation: Operation },

    #[error("Log corrupt at sequence {sequence}")]
    LogCorrupt { sequence: u64 },

    #[error("No quorum: no ONLINE authority-eligible node")]
    NoQuorum,

    #[error("Mode conflict: cannot enter {requested} from {current}")]
    ModeConflict {
        current: crate::mode::Mode,
        requested: crate::mode::Mode,
    },

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Durable-state corruption. The node stays write-disabled until an operator steps in.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::LogCorrupt { .. } | Self::IdentityCorrupt { .. })
    }

    /// Conditions that clear by waiting (a leader appears, a role is granted).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RoleDenied { .. } | Self::NoQuorum)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
