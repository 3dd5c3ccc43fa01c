//! Zero-trust admission: one-time pairing tokens, the file-based request and
//! approval artifacts, and the certificates that bind a device to a role.

use chrono::Duration;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    crypto::{self, hex_serde, Ed25519KeyPair, EntropySource, PublicKey, Signature},
    identity::{fingerprint, DeviceIdentity},
    registry::Role,
    storage::Storage,
    time::{Clock, Timestamp},
    DeviceId, Error, Result,
};

pub const TOKENS_FILE: &str = "pairing/tokens.json";
pub const REQUESTS_DIR: &str = "pairing/requests/";
pub const APPROVALS_DIR: &str = "pairing/approvals/";
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 300;
/// Longest pairing window an operator may configure.
pub const MAX_TOKEN_TTL_SECS: u64 = 86_400;

const CERTIFICATE_DOMAIN: &[u8] = b"warden/device-certificate/v1";

/// 128 random bits handed to a device out of band.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenValue(#[serde(with = "hex_serde")] pub [u8; 16]);

impl fmt::Display for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenValue({}…)", hex::encode(&self.0[..2]))
    }
}

impl FromStr for TokenValue {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::TokenUnknown)?;
        Ok(Self(bytes))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingToken {
    pub token: TokenValue,
    pub issued_at: Timestamp,
    pub expires_at: Timestamp,
    pub consumed: bool,
}

impl PairingToken {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Signed binding of a device id and public key to a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCertificate {
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub role: Role,
    pub issued_at: Timestamp,
    pub signature: Signature,
}

impl DeviceCertificate {
    fn signing_bytes(
        device_id: &DeviceId,
        public_key: &PublicKey,
        role: Role,
        issued_at: Timestamp,
    ) -> [u8; 32] {
        let role_tag: &[u8] = match role {
            Role::Authority => b"AUTHORITY",
            Role::Storage => b"STORAGE",
            Role::Worker => b"WORKER",
        };
        crypto::hash_parts(&[
            CERTIFICATE_DOMAIN,
            device_id.0.as_slice(),
            public_key.0.as_slice(),
            role_tag,
            issued_at.timestamp_micros().to_le_bytes().as_slice(),
        ])
    }

    pub fn issue(
        issuer: &Ed25519KeyPair,
        device_id: DeviceId,
        public_key: PublicKey,
        role: Role,
        issued_at: Timestamp,
    ) -> Self {
        let body = Self::signing_bytes(&device_id, &public_key, role, issued_at);
        Self {
            device_id,
            public_key,
            role,
            issued_at,
            signature: issuer.sign(&body),
        }
    }

    pub fn verify(&self, issuer: &PublicKey) -> Result<()> {
        let body = Self::signing_bytes(&self.device_id, &self.public_key, self.role, self.issued_at);
        issuer
            .verify(&body, &self.signature)
            .map_err(|_| Error::InvalidCertificate)
    }
}

/// Written by a device asking to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRequest {
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub hardware_fingerprint: String,
    pub requested_role: Role,
    pub timestamp: Timestamp,
}

impl PairingRequest {
    pub fn new(
        identity: &DeviceIdentity,
        hardware_fingerprint: impl Into<String>,
        requested_role: Role,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            device_id: identity.device_id(),
            public_key: identity.public_key(),
            hardware_fingerprint: hardware_fingerprint.into(),
            requested_role,
            timestamp,
        }
    }

    pub fn artifact_name(device_id: &DeviceId) -> String {
        format!("{REQUESTS_DIR}{}.json", device_id.to_hex())
    }

    pub async fn submit(&self, storage: &dyn Storage) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        storage
            .write_atomic(&Self::artifact_name(&self.device_id), &bytes)
            .await
    }

    pub async fn fetch(storage: &dyn Storage, device_id: &DeviceId) -> Result<Option<Self>> {
        match storage.read(&Self::artifact_name(device_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Written by the pairing authority once a request is approved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingApproval {
    pub device_id: DeviceId,
    pub certificate: DeviceCertificate,
    pub approved_at: Timestamp,
}

impl PairingApproval {
    pub fn artifact_name(device_id: &DeviceId) -> String {
        format!("{APPROVALS_DIR}{}.json", device_id.to_hex())
    }

    pub async fn fetch(storage: &dyn Storage, device_id: &DeviceId) -> Result<Option<Self>> {
        match storage.read(&Self::artifact_name(device_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Issues pairing tokens and turns redeemed tokens into signed certificates.
#[derive(Debug)]
pub struct PairingAuthority {
    identity: DeviceIdentity,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn EntropySource>,
    ttl: Duration,
    // Held across the persist so a redemption commits before the next one is examined.
    tokens: Mutex<HashMap<TokenValue, PairingToken>>,
    elevations: SyncMutex<HashMap<DeviceId, Role>>,
}

impl PairingAuthority {
    pub async fn open(
        identity: DeviceIdentity,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn EntropySource>,
        ttl: Duration,
    ) -> Result<Self> {
        let tokens = match storage.read(TOKENS_FILE).await? {
            Some(bytes) => serde_json::from_slice::<Vec<PairingToken>>(&bytes)?
                .into_iter()
                .map(|t| (t.token, t))
                .collect(),
            None => HashMap::new(),
        };
        Ok(Self {
            identity,
            storage,
            clock,
            entropy,
            ttl,
            tokens: Mutex::new(tokens),
            elevations: SyncMutex::new(HashMap::new()),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    pub fn device_id(&self) -> DeviceId {
        self.identity.device_id()
    }

    /// Certificate for the authority's own identity, used once at bootstrap.
    pub(crate) fn certify_self(&self, role: Role) -> DeviceCertificate {
        DeviceCertificate::issue(
            self.identity.keypair(),
            self.identity.device_id(),
            self.identity.public_key(),
            role,
            self.clock.now(),
        )
    }

    async fn persist(&self, tokens: &HashMap<TokenValue, PairingToken>) -> Result<()> {
        let mut list: Vec<&PairingToken> = tokens.values().collect();
        list.sort_by_key(|t| t.issued_at);
        let bytes = serde_json::to_vec_pretty(&list)?;
        self.storage.write_atomic(TOKENS_FILE, &bytes).await
    }

    pub async fn issue_token(&self) -> Result<PairingToken> {
        let mut bytes = [0u8; 16];
        self.entropy.fill(&mut bytes)?;
        let now = self.clock.now();
        let token = PairingToken {
            token: TokenValue(bytes),
            issued_at: now,
            expires_at: now + self.ttl,
            consumed: false,
        };

        let mut tokens = self.tokens.lock().await;
        let mut next = tokens.clone();
        next.insert(token.token, token.clone());
        self.persist(&next).await?;
        *tokens = next;

        info!("Issued pairing token {:?}, expires {}", token.token, token.expires_at);
        Ok(token)
    }

    /// Pre-approves a role other than WORKER for a device that has yet to pair.
    pub fn elevate(&self, device_id: DeviceId, role: Role) {
        info!("Pre-approved {} for {:?}", device_id, role);
        self.elevations.lock().insert(device_id, role);
    }

    /// Consumes `token` and certifies `device_id`.
    ///
    /// The consume is a compare-and-set under the token lock and commits once
    /// the token file is persisted; among concurrent redemptions of one token
    /// exactly one returns a certificate.
    pub async fn redeem(
        &self,
        token: TokenValue,
        device_id: DeviceId,
        public_key: PublicKey,
    ) -> Result<DeviceCertificate> {
        if fingerprint(&public_key) != device_id {
            warn!("Pairing attempt with a device id that is not its key fingerprint");
            return Err(Error::IdentityMismatch);
        }

        let now = self.clock.now();
        {
            let mut tokens = self.tokens.lock().await;
            let pending = tokens.get(&token).ok_or(Error::TokenUnknown)?;
            if pending.consumed {
                return Err(Error::TokenConsumed);
            }
            if pending.is_expired(now) {
                return Err(Error::TokenExpired {
                    expired_at: pending.expires_at,
                });
            }

            let mut next = tokens.clone();
            if let Some(t) = next.get_mut(&token) {
                t.consumed = true;
            }
            self.persist(&next).await?;
            *tokens = next;
        }

        let role = self
            .elevations
            .lock()
            .remove(&device_id)
            .unwrap_or(Role::Worker);
        let certificate = DeviceCertificate::issue(self.identity.keypair(), device_id, public_key, role, now);
        info!("Token {:?} redeemed by {} as {:?}", token, device_id, role);
        Ok(certificate)
    }

    /// Redeems `token` for a submitted request. Nothing is visible to the
    /// device until [`PairingAuthority::publish`] runs.
    pub async fn certify(&self, request: &PairingRequest, token: TokenValue) -> Result<DeviceCertificate> {
        let certificate = self
            .redeem(token, request.device_id, request.public_key)
            .await?;
        if certificate.role != request.requested_role {
            debug!(
                "{} requested {:?}, granted {:?}",
                request.device_id, request.requested_role, certificate.role
            );
        }
        Ok(certificate)
    }

    /// Writes the approval artifact for an admitted device and drops its request.
    pub async fn publish(
        &self,
        request: &PairingRequest,
        certificate: DeviceCertificate,
    ) -> Result<PairingApproval> {
        let approval = PairingApproval {
            device_id: request.device_id,
            certificate,
            approved_at: self.clock.now(),
        };
        let bytes = serde_json::to_vec_pretty(&approval)?;
        self.storage
            .write_atomic(&PairingApproval::artifact_name(&request.device_id), &bytes)
            .await?;
        self.storage
            .remove(&PairingRequest::artifact_name(&request.device_id))
            .await?;
        Ok(approval)
    }

    /// Requests waiting for an operator decision.
    pub async fn pending_requests(&self) -> Result<Vec<PairingRequest>> {
        let mut requests = Vec::new();
        for name in self.storage.list(REQUESTS_DIR).await? {
            if let Some(bytes) = self.storage.read(&name).await? {
                match serde_json::from_slice::<PairingRequest>(&bytes) {
                    Ok(request) => requests.push(request),
                    Err(e) => warn!("Ignoring unreadable pairing request {}: {}", name, e),
                }
            }
        }
        Ok(requests)
    }

    /// Drops expired tokens from the pending set. Returns how many were dropped.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut tokens = self.tokens.lock().await;
        let mut next = tokens.clone();
        next.retain(|_, t| !t.is_expired(now));
        let purged = tokens.len() - next.len();
        if purged > 0 {
            self.persist(&next).await?;
            *tokens = next;
            debug!("Purged {} expired pairing tokens", purged);
        }
        Ok(purged)
    }

    pub async fn pending_tokens(&self) -> Vec<PairingToken> {
        self.tokens
            .lock()
            .await
            .values()
            .filter(|t| !t.consumed)
            .cloned()
            .collect()
    }
}
