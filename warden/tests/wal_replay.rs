use std::sync::Arc;
use tempfile::TempDir;
use warden::{
    crypto::SeededEntropy,
    node::ControlPlane,
    storage::{FsStorage, Storage},
    test_utils::{LatencyMeasurement, TestCluster},
    time::SystemClock,
    wal::{decode_log, AppendRequest, AuthorityState, WAL_FILE},
    ClusterConfig, DeviceIdentity, Error, Mode, Role,
};

/// Byte offsets where each frame ends.
fn frame_ends(raw: &[u8]) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut offset = 0;
    while offset < raw.len() {
        let len = u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4 + len;
        ends.push(offset);
    }
    ends
}

async fn populated_cluster() -> TestCluster {
    let mut cluster = TestCluster::new().await.unwrap();
    let token = cluster.genesis.elect().await.unwrap();
    let storage_node = cluster.pair(Role::Storage).await.unwrap();
    cluster
        .genesis
        .request_mode(Mode::WriteMode, token)
        .await
        .unwrap();

    let wal = cluster.plane.wal();
    let me = storage_node.device_id();
    wal.append(AppendRequest::put(me, token, "a", b"1".to_vec())).await.unwrap();
    wal.append(AppendRequest::put(me, token, "b", b"2".to_vec())).await.unwrap();
    wal.append(AppendRequest::put(me, token, "a", b"3".to_vec())).await.unwrap();
    wal.append(AppendRequest::delete(me, token, "b")).await.unwrap();
    wal.append(AppendRequest::compensation(me, token, "a", Some(b"1".to_vec())).unwrap())
        .await
        .unwrap();
    cluster.genesis.request_mode(Mode::Idle, token).await.unwrap();
    cluster
}

#[tokio::test]
async fn test_replay_of_any_prefix_matches_incremental_application() {
    let cluster = populated_cluster().await;
    let raw = cluster.storage.read(WAL_FILE).await.unwrap().unwrap();
    let entries = cluster.plane.wal().replay().await.unwrap();
    let ends = frame_ends(&raw);
    assert_eq!(ends.len(), entries.len());

    let mut incremental = AuthorityState::default();
    for (i, entry) in entries.iter().enumerate() {
        incremental.apply(entry).unwrap();

        let prefix = decode_log(&raw[..ends[i]]).unwrap();
        assert_eq!(prefix.len(), i + 1);
        assert_eq!(AuthorityState::rebuild(&prefix).unwrap(), incremental);
        // Replaying twice changes nothing.
        assert_eq!(AuthorityState::rebuild(&prefix).unwrap(), incremental);
    }

    let state = cluster.plane.wal().replay_state().await.unwrap();
    assert_eq!(state, incremental);
    assert_eq!(state.data.get("a"), Some(&b"1".to_vec()));
    assert!(!state.data.contains_key("b"));
    assert_eq!(state.mode.map(|m| m.mode), Some(Mode::Idle));
    assert_eq!(state.roles.len(), 1);
}

#[tokio::test]
async fn test_single_bit_flip_in_checksum_halts_replay_at_that_sequence() {
    let cluster = populated_cluster().await;
    let mut raw = cluster.storage.read(WAL_FILE).await.unwrap().unwrap();
    let ends = frame_ends(&raw);

    // The checksum is the last field of each frame.
    raw[ends[2] - 1] ^= 0x01;
    cluster.storage.overwrite_raw(WAL_FILE, raw);

    let err = cluster.plane.wal().replay().await.unwrap_err();
    assert!(matches!(err, Error::LogCorrupt { sequence: 3 }), "{err:?}");
    assert!(err.is_corruption());

    // The log is now write-disabled.
    assert!(cluster.plane.wal().is_halted());
    let token = cluster.plane.election().current().unwrap();
    assert!(matches!(
        cluster
            .plane
            .wal()
            .append(AppendRequest::term_start(cluster.genesis.device_id(), token))
            .await,
        Err(Error::LogCorrupt { sequence: 3 })
    ));
}

#[tokio::test]
async fn test_reopen_on_corrupt_log_is_write_disabled() {
    let cluster = populated_cluster().await;
    let mut raw = cluster.storage.read(WAL_FILE).await.unwrap().unwrap();
    let ends = frame_ends(&raw);
    let middle = (ends[3] + ends[4]) / 2;
    raw[middle] ^= 0xff;
    cluster.storage.overwrite_raw(WAL_FILE, raw);

    let reopened = ControlPlane::open(
        ClusterConfig::default(),
        cluster.genesis.identity().clone(),
        cluster.storage.clone(),
        cluster.clock.clone(),
        Arc::new(SeededEntropy::new(0)),
    )
    .await
    .unwrap();
    assert!(reopened.wal().is_halted());
    assert_eq!(reopened.wal().last_sequence(), 4);

    let device = cluster.genesis.device_id();
    assert!(matches!(
        reopened.check_operation(device, warden::Operation::Write).await,
        Err(Error::LogCorrupt { sequence: 5 })
    ));
    assert!(!reopened.is_write_permitted(device, "write").await);
    // Reads do not depend on the log.
    assert!(reopened.is_write_permitted(device, "read").await);
}

#[tokio::test]
async fn test_rejected_appends_leave_no_trace() {
    let mut cluster = TestCluster::new().await.unwrap();
    let worker = cluster.pair(Role::Worker).await.unwrap();
    let token = cluster.genesis.elect().await.unwrap();
    let wal = cluster.plane.wal();
    let before = cluster.storage.read(WAL_FILE).await.unwrap();

    assert!(wal
        .append(AppendRequest::put(worker.device_id(), token, "k", Vec::new()))
        .await
        .is_err());
    let forged = warden::FencingToken::issue(token.term, worker.device_id());
    assert!(wal
        .append(AppendRequest::put(cluster.genesis.device_id(), forged, "k", Vec::new()))
        .await
        .is_err());

    assert_eq!(cluster.storage.read(WAL_FILE).await.unwrap(), before);
    assert_eq!(wal.last_sequence(), 1);
}

#[tokio::test]
async fn test_fs_log_survives_restart_and_reports_torn_tail() {
    let tmp = TempDir::new().unwrap();
    let identity_storage = FsStorage::open(tmp.path().join("identity")).await.unwrap();
    let identity = DeviceIdentity::generate_or_load(&identity_storage, &SeededEntropy::new(9))
        .await
        .unwrap();

    let open = |bootstrap: bool| {
        let identity = identity.clone();
        let root = tmp.path().join("state");
        async move {
            let storage = Arc::new(FsStorage::open(root).await.unwrap());
            let args = (
                ClusterConfig::default(),
                identity,
                storage as Arc<dyn Storage>,
                Arc::new(SystemClock) as Arc<dyn warden::time::Clock>,
                Arc::new(SeededEntropy::new(3)) as Arc<dyn warden::crypto::EntropySource>,
            );
            if bootstrap {
                ControlPlane::bootstrap(args.0, args.1, args.2, args.3, args.4).await
            } else {
                ControlPlane::open(args.0, args.1, args.2, args.3, args.4).await
            }
        }
    };

    let plane = open(true).await.unwrap();
    let me = identity.device_id();
    let token = plane.election().elect().await.unwrap();
    let mut timer = LatencyMeasurement::start("three durable appends");
    for key in ["x", "y", "z"] {
        plane
            .wal()
            .append(AppendRequest::put(me, token, key, key.as_bytes().to_vec()))
            .await
            .unwrap();
    }
    timer.stop();
    timer.assert_milliseconds(5_000);
    drop(plane);

    let plane = open(false).await.unwrap();
    assert_eq!(plane.wal().last_sequence(), 3);
    assert_eq!(plane.election().term(), 1);
    assert!(!plane.wal().is_halted());
    drop(plane);

    let wal_path = tmp.path().join("state").join(WAL_FILE);
    let mut raw = std::fs::read(&wal_path).unwrap();
    raw.truncate(raw.len() - 7);
    std::fs::write(&wal_path, raw).unwrap();

    let plane = open(false).await.unwrap();
    assert!(plane.wal().is_halted());
    assert!(matches!(
        plane.wal().replay().await,
        Err(Error::LogCorrupt { sequence: 3 })
    ));
}
