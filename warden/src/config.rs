use serde::{Deserialize, Serialize};
use std::{env, net::SocketAddr, path::PathBuf};
use tracing::debug;

use crate::{
    pairing::{DEFAULT_TOKEN_TTL_SECS, MAX_TOKEN_TTL_SECS},
    registry::DEFAULT_CAPACITY,
    Error, Result,
};

/// Per-node settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub data_dir: PathBuf,
    pub max_devices: usize,
    pub pairing_token_ttl_secs: u64,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_ms: u64,
    /// Election priority of this node when it holds AUTHORITY. Higher wins.
    pub priority: u32,
    /// Lets the elected AUTHORITY persist directly when no STORAGE nodes exist.
    pub authority_persists: bool,
    pub bind_addr: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./warden-data"),
            max_devices: DEFAULT_CAPACITY,
            pairing_token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            heartbeat_interval_ms: 500,
            election_timeout_ms: 3000,
            priority: 0,
            authority_persists: true,
            bind_addr: "127.0.0.1:7400".to_string(),
        }
    }
}

impl ClusterConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reads `path` if given (defaults otherwise), then applies environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| Error::Config(format!("Cannot read {}: {e}", path.display())))?;
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = env::var("WARDEN_DATA_DIR") {
            debug!("WARDEN_DATA_DIR={}", dir);
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = env::var("WARDEN_BIND_ADDR") {
            debug!("WARDEN_BIND_ADDR={}", addr);
            self.bind_addr = addr;
        }
        if let Ok(priority) = env::var("WARDEN_PRIORITY") {
            self.priority = priority
                .parse()
                .map_err(|e| Error::Config(format!("WARDEN_PRIORITY {priority:?}: {e}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 || self.max_devices > DEFAULT_CAPACITY {
            return Err(Error::Config(format!(
                "max_devices must be between 1 and {DEFAULT_CAPACITY}, got {}",
                self.max_devices
            )));
        }
        if self.pairing_token_ttl_secs == 0 || self.pairing_token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(Error::Config(format!(
                "pairing_token_ttl_secs must be between 1 and {MAX_TOKEN_TTL_SECS}, got {}",
                self.pairing_token_ttl_secs
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.election_timeout_ms == 0 {
            return Err(Error::Config("Timer intervals must be positive".to_string()));
        }
        if self.heartbeat_interval_ms >= self.election_timeout_ms {
            return Err(Error::Config(format!(
                "heartbeat_interval_ms ({}) must be shorter than election_timeout_ms ({})",
                self.heartbeat_interval_ms, self.election_timeout_ms
            )));
        }
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .map_err(|e| Error::Config(format!("Invalid bind_addr {:?}: {e}", self.bind_addr)))
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        let secs = self.pairing_token_ttl_secs.min(MAX_TOKEN_TTL_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or_default())
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.data_dir.join("identity")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }
}
