use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::{
    crypto::PublicKey,
    identity::fingerprint,
    pairing::DeviceCertificate,
    storage::Storage,
    time::{Clock, Timestamp},
    DeviceId, Error, Result,
};

pub const REGISTRY_FILE: &str = "registry.json";
pub const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Authority,
    Storage,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Online,
    Offline,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub device_id: DeviceId,
    pub role: Role,
    pub status: DeviceStatus,
    pub enrolled_at: Timestamp,
    pub public_key: PublicKey,
    /// Election priority, higher wins.
    #[serde(default)]
    pub priority: u32,
}

impl RegistryEntry {
    pub fn is_revoked(&self) -> bool {
        self.status == DeviceStatus::Revoked
    }
}

type Entries = BTreeMap<DeviceId, RegistryEntry>;

/// Durable membership list.
///
/// Every mutation builds the next map, persists it atomically, and only then
/// replaces the in-memory copy, so a failed write leaves both untouched.
#[derive(Debug)]
pub struct DeviceRegistry {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    issuer: PublicKey,
    capacity: usize,
    entries: RwLock<Entries>,
    version: watch::Sender<u64>,
}

impl DeviceRegistry {
    pub async fn open(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        issuer: PublicKey,
        capacity: usize,
    ) -> Result<Self> {
        let entries = Self::load(storage.as_ref(), capacity).await?;
        info!("Registry opened with {} devices", entries.len());
        let (version, _) = watch::channel(0);
        Ok(Self {
            storage,
            clock,
            issuer,
            capacity,
            entries: RwLock::new(entries),
            version,
        })
    }

    async fn load(storage: &dyn Storage, capacity: usize) -> Result<Entries> {
        let Some(bytes) = storage.read(REGISTRY_FILE).await? else {
            return Ok(Entries::new());
        };
        let list: Vec<RegistryEntry> = serde_json::from_slice(&bytes)?;
        if list.len() > capacity {
            return Err(Error::Config(format!(
                "Registry holds {} devices, capacity is {}",
                list.len(),
                capacity
            )));
        }

        let mut entries = Entries::new();
        for entry in list {
            let device = entry.device_id;
            if entries.insert(device, entry).is_some() {
                return Err(Error::DuplicateDevice { device });
            }
        }
        Ok(entries)
    }

    async fn persist(&self, entries: &Entries) -> Result<()> {
        let list: Vec<&RegistryEntry> = entries.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;
        self.storage.write_atomic(REGISTRY_FILE, &bytes).await?;
        self.version.send_modify(|v| *v += 1);
        Ok(())
    }

    /// Re-reads the registry file, for views that follow another writer.
    pub async fn reload(&self) -> Result<()> {
        let fresh = Self::load(self.storage.as_ref(), self.capacity).await?;
        *self.entries.write().await = fresh;
        self.version.send_modify(|v| *v += 1);
        Ok(())
    }

    fn admits(&self, entries: &Entries, device: DeviceId) -> Result<()> {
        if let Some(existing) = entries.get(&device) {
            return Err(if existing.is_revoked() {
                Error::DeviceRevoked { device }
            } else {
                Error::DuplicateDevice { device }
            });
        }
        if entries.len() >= self.capacity {
            warn!("Registry full, refusing {}", device);
            return Err(Error::RegistryFull {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Whether `device` could be enrolled right now: not present, not revoked
    /// and room left.
    pub async fn check_enrollable(&self, device: DeviceId) -> Result<()> {
        let entries = self.entries.read().await;
        self.admits(&entries, device)
    }

    /// Adds the device named by a certificate from the trusted pairing authority.
    pub async fn enroll(&self, certificate: &DeviceCertificate) -> Result<RegistryEntry> {
        certificate.verify(&self.issuer)?;
        if fingerprint(&certificate.public_key) != certificate.device_id {
            return Err(Error::IdentityMismatch);
        }

        let mut entries = self.entries.write().await;
        let device = certificate.device_id;
        self.admits(&entries, device)?;

        let entry = RegistryEntry {
            device_id: device,
            role: certificate.role,
            status: DeviceStatus::Online,
            enrolled_at: self.clock.now(),
            public_key: certificate.public_key,
            priority: 0,
        };
        let mut next = entries.clone();
        next.insert(device, entry.clone());
        self.persist(&next).await?;
        *entries = next;

        info!("Enrolled {} as {:?}", device, entry.role);
        Ok(entry)
    }

    async fn update<F>(&self, device: DeviceId, change: F) -> Result<RegistryEntry>
    where
        F: FnOnce(&mut RegistryEntry),
    {
        let mut entries = self.entries.write().await;
        let current = entries
            .get(&device)
            .ok_or(Error::UnknownDevice { device })?;
        if current.is_revoked() {
            return Err(Error::DeviceRevoked { device });
        }

        let mut updated = current.clone();
        change(&mut updated);
        if &updated == current {
            return Ok(updated);
        }

        let mut next = entries.clone();
        next.insert(device, updated.clone());
        self.persist(&next).await?;
        *entries = next;
        Ok(updated)
    }

    pub async fn set_status(&self, device: DeviceId, status: DeviceStatus) -> Result<RegistryEntry> {
        let entry = self.update(device, |e| e.status = status).await?;
        info!("{} is now {:?}", device, status);
        Ok(entry)
    }

    /// Terminal. A revoked id can never be enrolled or reactivated again.
    pub async fn revoke(&self, device: DeviceId) -> Result<()> {
        match self.set_status(device, DeviceStatus::Revoked).await {
            Ok(_) | Err(Error::DeviceRevoked { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn set_role(&self, device: DeviceId, role: Role) -> Result<RegistryEntry> {
        let entry = self.update(device, |e| e.role = role).await?;
        info!("{} role changed to {:?}", device, role);
        Ok(entry)
    }

    pub async fn set_priority(&self, device: DeviceId, priority: u32) -> Result<RegistryEntry> {
        self.update(device, |e| e.priority = priority).await
    }

    /// ONLINE devices holding `role`.
    pub async fn candidates_for_role(&self, role: Role) -> BTreeSet<DeviceId> {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.role == role && e.status == DeviceStatus::Online)
            .map(|e| e.device_id)
            .collect()
    }

    pub async fn get(&self, device: &DeviceId) -> Option<RegistryEntry> {
        self.entries.read().await.get(device).cloned()
    }

    pub async fn entries(&self) -> Vec<RegistryEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Change notifications. The value is a counter bumped on every persisted change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{Ed25519KeyPair, SeededEntropy},
        storage::InMemoryStorage,
        time::ManualClock,
    };

    struct Fixture {
        issuer: Ed25519KeyPair,
        storage: Arc<InMemoryStorage>,
        clock: Arc<ManualClock>,
        entropy: SeededEntropy,
    }

    impl Fixture {
        fn new() -> Self {
            let entropy = SeededEntropy::new(99);
            Self {
                issuer: Ed25519KeyPair::generate(&entropy).unwrap(),
                storage: Arc::new(InMemoryStorage::new()),
                clock: Arc::new(ManualClock::default()),
                entropy,
            }
        }

        async fn registry(&self, capacity: usize) -> DeviceRegistry {
            DeviceRegistry::open(
                self.storage.clone(),
                self.clock.clone(),
                self.issuer.public_key(),
                capacity,
            )
            .await
            .unwrap()
        }

        fn certificate(&self, role: Role) -> DeviceCertificate {
            let device_key = Ed25519KeyPair::generate(&self.entropy).unwrap();
            DeviceCertificate::issue(
                &self.issuer,
                fingerprint(&device_key.public_key()),
                device_key.public_key(),
                role,
                self.clock.now(),
            )
        }
    }

    #[tokio::test]
    async fn test_enroll_and_reload() {
        let fx = Fixture::new();
        let registry = fx.registry(DEFAULT_CAPACITY).await;
        let cert = fx.certificate(Role::Storage);

        let entry = registry.enroll(&cert).await.unwrap();
        assert_eq!(entry.status, DeviceStatus::Online);

        let reopened = fx.registry(DEFAULT_CAPACITY).await;
        assert_eq!(reopened.get(&cert.device_id).await, Some(entry));
    }

    #[tokio::test]
    async fn test_duplicate_and_revoked_enrollment() {
        let fx = Fixture::new();
        let registry = fx.registry(DEFAULT_CAPACITY).await;
        let cert = fx.certificate(Role::Worker);
        registry.enroll(&cert).await.unwrap();

        assert!(matches!(
            registry.enroll(&cert).await,
            Err(Error::DuplicateDevice { .. })
        ));

        registry.revoke(cert.device_id).await.unwrap();
        assert!(matches!(
            registry.enroll(&cert).await,
            Err(Error::DeviceRevoked { .. })
        ));
        assert!(matches!(
            registry.set_status(cert.device_id, DeviceStatus::Online).await,
            Err(Error::DeviceRevoked { .. })
        ));
        // Revoking twice is a no-op.
        registry.revoke(cert.device_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let fx = Fixture::new();
        let registry = fx.registry(3).await;
        for _ in 0..3 {
            registry.enroll(&fx.certificate(Role::Worker)).await.unwrap();
        }
        assert!(matches!(
            registry.enroll(&fx.certificate(Role::Worker)).await,
            Err(Error::RegistryFull { capacity: 3 })
        ));
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn test_foreign_certificate_is_rejected() {
        let fx = Fixture::new();
        let registry = fx.registry(DEFAULT_CAPACITY).await;

        let rogue = Ed25519KeyPair::generate(&fx.entropy).unwrap();
        let device_key = Ed25519KeyPair::generate(&fx.entropy).unwrap();
        let cert = DeviceCertificate::issue(
            &rogue,
            fingerprint(&device_key.public_key()),
            device_key.public_key(),
            Role::Authority,
            fx.clock.now(),
        );
        assert!(matches!(
            registry.enroll(&cert).await,
            Err(Error::InvalidCertificate)
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_candidates_only_include_online_role_holders() {
        let fx = Fixture::new();
        let registry = fx.registry(DEFAULT_CAPACITY).await;
        let a = fx.certificate(Role::Authority);
        let b = fx.certificate(Role::Authority);
        let s = fx.certificate(Role::Storage);
        for cert in [&a, &b, &s] {
            registry.enroll(cert).await.unwrap();
        }
        registry
            .set_status(b.device_id, DeviceStatus::Offline)
            .await
            .unwrap();

        let candidates = registry.candidates_for_role(Role::Authority).await;
        assert_eq!(candidates.into_iter().collect::<Vec<_>>(), vec![a.device_id]);
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_registry_unchanged() {
        let fx = Fixture::new();
        let registry = fx.registry(DEFAULT_CAPACITY).await;
        let mut changes = registry.subscribe();

        fx.storage.fail_writes(true);
        assert!(registry.enroll(&fx.certificate(Role::Worker)).await.is_err());
        assert!(registry.is_empty().await);
        assert!(!changes.has_changed().unwrap());

        fx.storage.fail_writes(false);
        registry.enroll(&fx.certificate(Role::Worker)).await.unwrap();
        assert!(changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_role_change_is_persisted() {
        let fx = Fixture::new();
        let registry = fx.registry(DEFAULT_CAPACITY).await;
        let cert = fx.certificate(Role::Worker);
        registry.enroll(&cert).await.unwrap();

        let entry = registry.set_role(cert.device_id, Role::Storage).await.unwrap();
        assert_eq!(entry.role, Role::Storage);
        let reopened = fx.registry(DEFAULT_CAPACITY).await;
        assert_eq!(reopened.get(&cert.device_id).await.map(|e| e.role), Some(Role::Storage));

        registry.revoke(cert.device_id).await.unwrap();
        assert!(matches!(
            registry.set_role(cert.device_id, Role::Authority).await,
            Err(Error::DeviceRevoked { .. })
        ));
    }
}
