use std::sync::Arc;
use tempfile::TempDir;
use warden::{
    crypto::{Ed25519KeyPair, SeededEntropy},
    identity::fingerprint,
    registry::{DeviceRegistry, REGISTRY_FILE},
    storage::{FsStorage, InMemoryStorage, Storage},
    time::{Clock, ManualClock},
    DeviceCertificate, DeviceStatus, Error, Role,
};

struct Issuer {
    key: Ed25519KeyPair,
    entropy: SeededEntropy,
    clock: Arc<ManualClock>,
}

impl Issuer {
    fn new() -> Self {
        let entropy = SeededEntropy::new(77);
        Self {
            key: Ed25519KeyPair::generate(&entropy).unwrap(),
            entropy,
            clock: Arc::new(ManualClock::default()),
        }
    }

    fn certificate(&self, role: Role) -> DeviceCertificate {
        let device = Ed25519KeyPair::generate(&self.entropy).unwrap();
        DeviceCertificate::issue(
            &self.key,
            fingerprint(&device.public_key()),
            device.public_key(),
            role,
            self.clock.now(),
        )
    }

    async fn open(&self, storage: Arc<dyn Storage>) -> warden::Result<DeviceRegistry> {
        DeviceRegistry::open(storage, self.clock.clone(), self.key.public_key(), 128).await
    }
}

#[tokio::test]
async fn test_interrupted_registry_write_leaves_previous_contents() {
    let tmp = TempDir::new().unwrap();
    let issuer = Issuer::new();

    let storage = Arc::new(FsStorage::open(tmp.path()).await.unwrap());
    let registry = issuer.open(storage).await.unwrap();
    let first = registry.enroll(&issuer.certificate(Role::Authority)).await.unwrap();
    let committed = std::fs::read(tmp.path().join(REGISTRY_FILE)).unwrap();
    drop(registry);

    // A crash mid-write leaves a partial temp file beside the real one.
    let leftover = tmp.path().join(format!(".{REGISTRY_FILE}.4242.0.tmp"));
    std::fs::write(&leftover, &committed[..committed.len() / 2]).unwrap();

    let storage = Arc::new(FsStorage::open(tmp.path()).await.unwrap());
    assert!(!leftover.exists(), "temp file was not swept");
    let registry = issuer.open(storage).await.unwrap();
    assert_eq!(registry.entries().await, vec![first]);
    assert_eq!(std::fs::read(tmp.path().join(REGISTRY_FILE)).unwrap(), committed);
}

#[tokio::test]
async fn test_failed_persist_leaves_registry_untouched() {
    let issuer = Issuer::new();
    let storage = Arc::new(InMemoryStorage::new());
    let registry = issuer.open(storage.clone()).await.unwrap();
    let kept = registry.enroll(&issuer.certificate(Role::Storage)).await.unwrap();
    let on_disk = storage.read(REGISTRY_FILE).await.unwrap();
    let changes = registry.subscribe();

    storage.fail_writes(true);
    assert!(matches!(
        registry.enroll(&issuer.certificate(Role::Worker)).await,
        Err(Error::Storage(_))
    ));
    assert!(registry
        .set_status(kept.device_id, DeviceStatus::Offline)
        .await
        .is_err());
    assert!(registry.revoke(kept.device_id).await.is_err());
    storage.fail_writes(false);

    assert_eq!(registry.entries().await, vec![kept.clone()]);
    assert_eq!(storage.read(REGISTRY_FILE).await.unwrap(), on_disk);
    assert!(!changes.has_changed().unwrap());

    // A reopened view agrees with memory.
    let reopened = issuer.open(storage.clone()).await.unwrap();
    assert_eq!(reopened.entries().await, vec![kept]);
}

#[tokio::test]
async fn test_registry_changes_are_visible_after_reload() {
    let issuer = Issuer::new();
    let storage = Arc::new(InMemoryStorage::new());
    let writer = issuer.open(storage.clone()).await.unwrap();
    let reader = issuer.open(storage.clone()).await.unwrap();
    let changes = reader.subscribe();

    let entry = writer.enroll(&issuer.certificate(Role::Authority)).await.unwrap();
    writer.revoke(entry.device_id).await.unwrap();
    assert!(reader.get(&entry.device_id).await.is_none());

    reader.reload().await.unwrap();
    assert!(changes.has_changed().unwrap());
    let seen = reader.get(&entry.device_id).await.unwrap();
    assert_eq!(seen.status, DeviceStatus::Revoked);
    assert!(reader.candidates_for_role(Role::Authority).await.is_empty());
}

#[tokio::test]
async fn test_unreadable_registry_file_fails_open() {
    let issuer = Issuer::new();
    let storage = Arc::new(InMemoryStorage::new());
    storage.overwrite_raw(REGISTRY_FILE, b"[{\"device_id\":".to_vec());

    let err = issuer.open(storage).await.unwrap_err();
    assert!(matches!(err, Error::Json(_)), "{err:?}");
}
