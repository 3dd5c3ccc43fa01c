use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    access::{Operation, RoleEnforcer},
    crypto::{self, hex_serde},
    registry::{DeviceRegistry, DeviceStatus, Role},
    storage::Storage,
    time::{elapsed_ms, Timestamp},
    DeviceId, Error, Result,
};

pub const ELECTION_FILE: &str = "election.json";

const FENCE_DOMAIN: &[u8] = b"warden/fence/v1";
const ANNOUNCE_CAPACITY: usize = 64;

/// Proof of leadership for one term. The digest binds the token to its
/// `(term, leader_id)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FencingToken {
    pub term: u64,
    pub leader_id: DeviceId,
    #[serde(with = "hex_serde")]
    pub digest: [u8; 32],
}

impl FencingToken {
    fn digest_for(term: u64, leader_id: &DeviceId) -> [u8; 32] {
        crypto::hash_parts(&[
            FENCE_DOMAIN,
            term.to_le_bytes().as_slice(),
            leader_id.0.as_slice(),
        ])
    }

    pub fn issue(term: u64, leader_id: DeviceId) -> Self {
        Self {
            term,
            leader_id,
            digest: Self::digest_for(term, &leader_id),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.digest == Self::digest_for(self.term, &self.leader_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionRole {
    Candidate,
    Leader,
    Follower,
}

/// Highest priority wins; equal priorities go to the lowest device id.
pub fn select_leader(candidates: &[(DeviceId, u32)]) -> Option<DeviceId> {
    candidates
        .iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(id, _)| *id)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ElectionState {
    term: u64,
    current: Option<FencingToken>,
}

/// Term-based election among ONLINE AUTHORITY devices.
///
/// Holds the single recognized fencing token. Electing a new term replaces it,
/// and losing every candidate clears it, so at most one token validates at a
/// time.
#[derive(Debug)]
pub struct LeaderElection {
    registry: Arc<DeviceRegistry>,
    enforcer: RoleEnforcer,
    storage: Arc<dyn Storage>,
    state: RwLock<ElectionState>,
    election_lock: Mutex<()>,
    announcements: broadcast::Sender<FencingToken>,
}

impl LeaderElection {
    pub async fn open(
        registry: Arc<DeviceRegistry>,
        enforcer: RoleEnforcer,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let state = match storage.read(ELECTION_FILE).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => ElectionState::default(),
        };
        info!("Election state opened at term {}", state.term);
        let (announcements, _) = broadcast::channel(ANNOUNCE_CAPACITY);
        Ok(Self {
            registry,
            enforcer,
            storage,
            state: RwLock::new(state),
            election_lock: Mutex::new(()),
            announcements,
        })
    }

    async fn commit(&self, next: ElectionState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&next)?;
        self.storage.write_atomic(ELECTION_FILE, &bytes).await?;
        *self.state.write() = next;
        Ok(())
    }

    /// Raises the term floor to one found elsewhere (the WAL). Never lowers it.
    pub async fn recover_term(&self, term: u64) -> Result<()> {
        let _guard = self.election_lock.lock().await;
        let current = self.state.read().clone();
        if term <= current.term {
            return Ok(());
        }
        warn!(
            "Election file at term {}, log has seen term {}; advancing",
            current.term, term
        );
        let next = ElectionState {
            term,
            current: current.current.filter(|t| t.term >= term),
        };
        self.commit(next).await
    }

    pub async fn elect(&self) -> Result<FencingToken> {
        self.elect_excluding(&[]).await
    }

    /// Runs one election for the next term, skipping `excluded`.
    pub async fn elect_excluding(&self, excluded: &[DeviceId]) -> Result<FencingToken> {
        let _guard = self.election_lock.lock().await;

        let candidates: Vec<(DeviceId, u32)> = self
            .registry
            .entries()
            .await
            .into_iter()
            .filter(|e| e.role == Role::Authority && e.status == DeviceStatus::Online)
            .filter(|e| self.enforcer.permits(e.role, Operation::Elect))
            .filter(|e| !excluded.contains(&e.device_id))
            .map(|e| (e.device_id, e.priority))
            .collect();

        let previous = self.state.read().clone();
        let Some(winner) = select_leader(&candidates) else {
            if previous.current.is_some() {
                self.commit(ElectionState {
                    term: previous.term,
                    current: None,
                })
                .await?;
            }
            warn!("No ONLINE authority; cluster is leaderless at term {}", previous.term);
            return Err(Error::NoQuorum);
        };

        let token = FencingToken::issue(previous.term + 1, winner);
        self.commit(ElectionState {
            term: token.term,
            current: Some(token),
        })
        .await?;

        info!(
            "Term {} won by {} among {} candidates",
            token.term,
            winner,
            candidates.len()
        );
        // Nobody listening is fine.
        let _ = self.announcements.send(token);
        Ok(token)
    }

    /// Adopts a token announced by another node if it carries a higher term.
    ///
    /// Returns whether the local state changed.
    pub async fn observe(&self, token: FencingToken) -> Result<bool> {
        if !token.is_well_formed() {
            return Err(Error::Crypto(format!(
                "Fencing token for term {} is not bound to its leader",
                token.term
            )));
        }
        let _guard = self.election_lock.lock().await;
        let term = self.state.read().term;
        if token.term <= term {
            debug!("Ignoring announcement for term {} at term {}", token.term, term);
            return Ok(false);
        }
        self.commit(ElectionState {
            term: token.term,
            current: Some(token),
        })
        .await?;
        info!("Superseded by term {} led by {}", token.term, token.leader_id);
        Ok(true)
    }

    /// Checks that `token` is the one currently recognized.
    pub fn validate(&self, token: &FencingToken) -> Result<()> {
        let state = self.state.read();
        if token.term < state.term {
            return Err(Error::StaleFencingToken {
                presented: token.term,
                current: state.term,
            });
        }
        match &state.current {
            None => Err(Error::NoQuorum),
            Some(current) if current == token => Ok(()),
            Some(current) => Err(Error::StaleFencingToken {
                presented: token.term,
                current: current.term,
            }),
        }
    }

    pub fn current(&self) -> Option<FencingToken> {
        self.state.read().current
    }

    pub fn term(&self) -> u64 {
        self.state.read().term
    }

    pub fn role_of(&self, device: &DeviceId) -> ElectionRole {
        match &self.state.read().current {
            Some(token) if token.leader_id == *device => ElectionRole::Leader,
            Some(_) => ElectionRole::Follower,
            None => ElectionRole::Candidate,
        }
    }

    /// Steps `device` down and elects someone else.
    pub async fn demote(&self, device: DeviceId) -> Result<FencingToken> {
        info!("Demoting {}", device);
        self.elect_excluding(&[device]).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FencingToken> {
        self.announcements.subscribe()
    }

    /// Re-elects when the leader has been silent for longer than `timeout_ms`,
    /// or when there is no leader at all. Returns the new token if one was issued.
    pub async fn check_leader(
        &self,
        liveness: &LivenessTracker,
        now: Timestamp,
        timeout_ms: u64,
    ) -> Result<Option<FencingToken>> {
        match self.current() {
            Some(token) => {
                if !liveness.is_stale(&token.leader_id, now, timeout_ms) {
                    return Ok(None);
                }
                warn!(
                    "Leader {} silent for over {}ms, marking OFFLINE",
                    token.leader_id, timeout_ms
                );
                match self
                    .registry
                    .set_status(token.leader_id, DeviceStatus::Offline)
                    .await
                {
                    Ok(_) | Err(Error::DeviceRevoked { .. }) => {}
                    Err(e) => return Err(e),
                }
                self.elect().await.map(Some)
            }
            None => self.elect().await.map(Some),
        }
    }
}

/// Last heartbeat seen from each device.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    last_seen: DashMap<DeviceId, Timestamp>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, device: DeviceId, at: Timestamp) {
        self.last_seen
            .entry(device)
            .and_modify(|seen| {
                if at > *seen {
                    *seen = at;
                }
            })
            .or_insert(at);
    }

    pub fn last_seen(&self, device: &DeviceId) -> Option<Timestamp> {
        self.last_seen.get(device).map(|t| *t)
    }

    /// A device never heard from starts its grace period at the first check.
    pub fn is_stale(&self, device: &DeviceId, now: Timestamp, timeout_ms: u64) -> bool {
        let seen = *self.last_seen.entry(*device).or_insert(now);
        elapsed_ms(seen, now) > timeout_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{Ed25519KeyPair, SeededEntropy},
        identity::fingerprint,
        pairing::DeviceCertificate,
        registry::DEFAULT_CAPACITY,
        storage::InMemoryStorage,
        time::{Clock, ManualClock},
    };
    use chrono::Duration;

    struct Fixture {
        issuer: Ed25519KeyPair,
        entropy: SeededEntropy,
        storage: Arc<InMemoryStorage>,
        clock: Arc<ManualClock>,
        registry: Arc<DeviceRegistry>,
    }

    impl Fixture {
        async fn new() -> Self {
            let entropy = SeededEntropy::new(21);
            let issuer = Ed25519KeyPair::generate(&entropy).unwrap();
            let storage = Arc::new(InMemoryStorage::new());
            let clock = Arc::new(ManualClock::default());
            let registry = Arc::new(
                DeviceRegistry::open(
                    storage.clone(),
                    clock.clone(),
                    issuer.public_key(),
                    DEFAULT_CAPACITY,
                )
                .await
                .unwrap(),
            );
            Self {
                issuer,
                entropy,
                storage,
                clock,
                registry,
            }
        }

        async fn enroll(&self, role: Role) -> DeviceId {
            let key = Ed25519KeyPair::generate(&self.entropy).unwrap();
            let cert = DeviceCertificate::issue(
                &self.issuer,
                fingerprint(&key.public_key()),
                key.public_key(),
                role,
                self.clock.now(),
            );
            self.registry.enroll(&cert).await.unwrap().device_id
        }

        async fn election(&self) -> LeaderElection {
            LeaderElection::open(
                self.registry.clone(),
                RoleEnforcer::strict(),
                self.storage.clone(),
            )
            .await
            .unwrap()
        }
    }

    fn id(byte: u8) -> DeviceId {
        DeviceId([byte; 32])
    }

    #[test]
    fn test_select_leader_priority_then_lowest_id() {
        assert_eq!(select_leader(&[]), None);
        assert_eq!(select_leader(&[(id(9), 1), (id(3), 5), (id(1), 5)]), Some(id(1)));
        assert_eq!(select_leader(&[(id(9), 7), (id(1), 5)]), Some(id(9)));
    }

    #[test]
    fn test_token_digest_binds_term_and_leader() {
        let token = FencingToken::issue(4, id(2));
        assert!(token.is_well_formed());
        let forged = FencingToken { term: 5, ..token };
        assert!(!forged.is_well_formed());
    }

    #[tokio::test]
    async fn test_elect_advances_term_and_invalidates_old_token() {
        let fx = Fixture::new().await;
        let a = fx.enroll(Role::Authority).await;
        let election = fx.election().await;

        let first = election.elect().await.unwrap();
        assert_eq!(first.term, 1);
        assert_eq!(first.leader_id, a);
        election.validate(&first).unwrap();

        let second = election.elect().await.unwrap();
        assert_eq!(second.term, 2);
        assert!(matches!(
            election.validate(&first),
            Err(Error::StaleFencingToken {
                presented: 1,
                current: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_no_quorum_leaves_cluster_leaderless() {
        let fx = Fixture::new().await;
        let a = fx.enroll(Role::Authority).await;
        fx.enroll(Role::Storage).await;
        let election = fx.election().await;
        let token = election.elect().await.unwrap();

        fx.registry
            .set_status(a, DeviceStatus::Offline)
            .await
            .unwrap();
        assert!(matches!(election.elect().await, Err(Error::NoQuorum)));
        assert_eq!(election.current(), None);
        assert!(matches!(election.validate(&token), Err(Error::NoQuorum)));
        assert_eq!(election.role_of(&a), ElectionRole::Candidate);
    }

    #[tokio::test]
    async fn test_priority_decides_winner() {
        let fx = Fixture::new().await;
        let a = fx.enroll(Role::Authority).await;
        let b = fx.enroll(Role::Authority).await;
        fx.registry.set_priority(b, 10).await.unwrap();
        let election = fx.election().await;

        let token = election.elect().await.unwrap();
        assert_eq!(token.leader_id, b);
        assert_eq!(election.role_of(&b), ElectionRole::Leader);
        assert_eq!(election.role_of(&a), ElectionRole::Follower);
    }

    #[tokio::test]
    async fn test_demote_hands_over() {
        let fx = Fixture::new().await;
        let a = fx.enroll(Role::Authority).await;
        let b = fx.enroll(Role::Authority).await;
        let election = fx.election().await;
        let first = election.elect().await.unwrap();

        let second = election.demote(first.leader_id).await.unwrap();
        assert_ne!(second.leader_id, first.leader_id);
        assert!([a, b].contains(&second.leader_id));
    }

    #[tokio::test]
    async fn test_observe_adopts_only_higher_terms() {
        let fx = Fixture::new().await;
        fx.enroll(Role::Authority).await;
        let election = fx.election().await;
        let local = election.elect().await.unwrap();

        assert!(!election.observe(FencingToken::issue(1, id(7))).await.unwrap());
        assert_eq!(election.current(), Some(local));

        let remote = FencingToken::issue(5, id(7));
        assert!(election.observe(remote).await.unwrap());
        assert_eq!(election.term(), 5);
        assert!(election.validate(&local).is_err());

        let mut forged = FencingToken::issue(9, id(7));
        forged.leader_id = id(8);
        assert!(election.observe(forged).await.is_err());
        assert_eq!(election.term(), 5);
    }

    #[tokio::test]
    async fn test_term_survives_reopen_and_recovery() {
        let fx = Fixture::new().await;
        fx.enroll(Role::Authority).await;
        let token = fx.election().await.elect().await.unwrap();

        let reopened = fx.election().await;
        assert_eq!(reopened.current(), Some(token));

        reopened.recover_term(4).await.unwrap();
        assert_eq!(reopened.term(), 4);
        assert_eq!(reopened.current(), None);
        assert_eq!(reopened.elect().await.unwrap().term, 5);

        reopened.recover_term(2).await.unwrap();
        assert_eq!(reopened.term(), 5);
    }

    #[tokio::test]
    async fn test_silent_leader_is_replaced() {
        let fx = Fixture::new().await;
        let a = fx.enroll(Role::Authority).await;
        let b = fx.enroll(Role::Authority).await;
        let election = fx.election().await;
        let liveness = LivenessTracker::new();
        let first = election.elect().await.unwrap();
        let follower = if first.leader_id == a { b } else { a };

        liveness.record(first.leader_id, fx.clock.now());
        fx.clock.advance(Duration::milliseconds(1000));
        assert_eq!(
            election.check_leader(&liveness, fx.clock.now(), 3000).await.unwrap(),
            None
        );

        fx.clock.advance(Duration::milliseconds(5000));
        let next = election
            .check_leader(&liveness, fx.clock.now(), 3000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.leader_id, follower);
        assert_eq!(
            fx.registry.get(&first.leader_id).await.unwrap().status,
            DeviceStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_announcements_are_broadcast() {
        let fx = Fixture::new().await;
        fx.enroll(Role::Authority).await;
        let election = fx.election().await;
        let mut rx = election.subscribe();

        let token = election.elect().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), token);
    }
}
