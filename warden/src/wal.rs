//! Authority write-ahead log.
//!
//! On-disk format: a sequence of frames, each a little-endian `u32` length
//! followed by one bincode-encoded [`WalEntry`]. The file is only ever
//! appended to; rollback is a new [`OperationType::Compensation`] entry.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    access::{Operation, RoleEnforcer},
    crypto,
    election::{FencingToken, LeaderElection},
    mode::{ModeState, ModeTransition},
    registry::{DeviceRegistry, Role},
    storage::Storage,
    DeviceId, Error, Result,
};

pub const WAL_FILE: &str = "authority.wal";

const FRAME_HEADER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Put,
    Delete,
    TermStart,
    RoleAssignment,
    ModeTransition,
    Compensation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence: u64,
    pub term: u64,
    pub fencing_token: FencingToken,
    pub operation: OperationType,
    pub key: String,
    pub value: Vec<u8>,
    pub checksum: [u8; 32],
}

#[derive(Serialize)]
struct ChecksumBody<'a> {
    sequence: u64,
    term: u64,
    fencing_token: &'a FencingToken,
    operation: OperationType,
    key: &'a str,
    value: &'a [u8],
}

impl WalEntry {
    fn compute_checksum(&self) -> Result<[u8; 32]> {
        let body = ChecksumBody {
            sequence: self.sequence,
            term: self.term,
            fencing_token: &self.fencing_token,
            operation: self.operation,
            key: &self.key,
            value: &self.value,
        };
        Ok(crypto::hash(&bincode::serialize(&body)?))
    }

    fn seal(sequence: u64, request: AppendRequest) -> Result<Self> {
        let mut entry = Self {
            sequence,
            term: request.fencing_token.term,
            fencing_token: request.fencing_token,
            operation: request.operation,
            key: request.key,
            value: request.value,
            checksum: [0; 32],
        };
        entry.checksum = entry.compute_checksum()?;
        Ok(entry)
    }

    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum()
            .is_ok_and(|checksum| checksum == self.checksum)
    }

    fn encode_frame(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let len = u32::try_from(body.len())
            .map_err(|_| Error::Storage(format!("WAL entry of {} bytes is too large", body.len())))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

/// An entry as submitted, before the log assigns its sequence and checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub submitter: DeviceId,
    pub fencing_token: FencingToken,
    pub operation: OperationType,
    pub key: String,
    pub value: Vec<u8>,
}

impl AppendRequest {
    pub fn new(
        submitter: DeviceId,
        fencing_token: FencingToken,
        operation: OperationType,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> Self {
        Self {
            submitter,
            fencing_token,
            operation,
            key: key.into(),
            value,
        }
    }

    pub fn put(submitter: DeviceId, fencing_token: FencingToken, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(submitter, fencing_token, OperationType::Put, key, value)
    }

    pub fn delete(submitter: DeviceId, fencing_token: FencingToken, key: impl Into<String>) -> Self {
        Self::new(submitter, fencing_token, OperationType::Delete, key, Vec::new())
    }

    pub fn term_start(submitter: DeviceId, fencing_token: FencingToken) -> Self {
        Self::new(submitter, fencing_token, OperationType::TermStart, "term", Vec::new())
    }

    pub fn role_assignment(
        submitter: DeviceId,
        fencing_token: FencingToken,
        device: DeviceId,
        role: Role,
    ) -> Result<Self> {
        Ok(Self::new(
            submitter,
            fencing_token,
            OperationType::RoleAssignment,
            device.to_hex(),
            serde_json::to_vec(&role)?,
        ))
    }

    pub fn mode_transition(
        submitter: DeviceId,
        fencing_token: FencingToken,
        transition: &ModeTransition,
    ) -> Result<Self> {
        Ok(Self::new(
            submitter,
            fencing_token,
            OperationType::ModeTransition,
            "mode",
            serde_json::to_vec(transition)?,
        ))
    }

    /// Undoes an earlier write to `key` by restoring `previous` (`None` removes the key).
    pub fn compensation(
        submitter: DeviceId,
        fencing_token: FencingToken,
        key: impl Into<String>,
        previous: Option<Vec<u8>>,
    ) -> Result<Self> {
        Ok(Self::new(
            submitter,
            fencing_token,
            OperationType::Compensation,
            key,
            bincode::serialize(&previous)?,
        ))
    }
}

/// State rebuilt from the log. Applying entries one at a time and replaying
/// the same prefix at once always agree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorityState {
    pub last_sequence: u64,
    pub term: u64,
    pub leader: Option<DeviceId>,
    pub data: BTreeMap<String, Vec<u8>>,
    pub roles: BTreeMap<DeviceId, Role>,
    pub mode: Option<ModeState>,
}

impl AuthorityState {
    pub fn rebuild(entries: &[WalEntry]) -> Result<Self> {
        let mut state = Self::default();
        for entry in entries {
            state.apply(entry)?;
        }
        Ok(state)
    }

    pub fn apply(&mut self, entry: &WalEntry) -> Result<()> {
        let corrupt = || Error::LogCorrupt {
            sequence: entry.sequence,
        };
        match entry.operation {
            OperationType::Put => {
                self.data.insert(entry.key.clone(), entry.value.clone());
            }
            OperationType::Delete => {
                self.data.remove(&entry.key);
            }
            OperationType::TermStart => {
                self.leader = Some(entry.fencing_token.leader_id);
            }
            OperationType::RoleAssignment => {
                let device: DeviceId = entry.key.parse().map_err(|_| corrupt())?;
                let role: Role = serde_json::from_slice(&entry.value).map_err(|_| corrupt())?;
                self.roles.insert(device, role);
            }
            OperationType::ModeTransition => {
                let transition: ModeTransition =
                    serde_json::from_slice(&entry.value).map_err(|_| corrupt())?;
                self.mode = Some(ModeState {
                    mode: transition.to,
                    entered_at: transition.at,
                });
            }
            OperationType::Compensation => {
                let previous: Option<Vec<u8>> =
                    bincode::deserialize(&entry.value).map_err(|_| corrupt())?;
                match previous {
                    Some(value) => {
                        self.data.insert(entry.key.clone(), value);
                    }
                    None => {
                        self.data.remove(&entry.key);
                    }
                }
            }
        }
        self.last_sequence = entry.sequence;
        self.term = self.term.max(entry.term);
        Ok(())
    }
}

/// Decodes a whole log, stopping at the first bad frame.
///
/// A short frame, an undecodable frame, a bad checksum, a sequence gap or a
/// term that goes backwards all report `LogCorrupt` at the sequence the bad
/// frame should have carried.
pub fn decode_log(bytes: &[u8]) -> Result<Vec<WalEntry>> {
    match decode_prefix(bytes) {
        (entries, None) => Ok(entries),
        (_, Some(sequence)) => Err(Error::LogCorrupt { sequence }),
    }
}

/// The valid prefix of a log and, if decoding stopped early, the sequence it stopped at.
fn decode_prefix(bytes: &[u8]) -> (Vec<WalEntry>, Option<u64>) {
    let mut entries: Vec<WalEntry> = Vec::new();
    let mut offset = 0usize;
    let mut highest_term = 0u64;

    while offset < bytes.len() {
        let expected = entries.last().map_or(1, |e| e.sequence + 1);

        let Some(header) = bytes
            .get(offset..offset + FRAME_HEADER)
            .and_then(|h| <[u8; FRAME_HEADER]>::try_from(h).ok())
        else {
            return (entries, Some(expected));
        };
        let Ok(len) = usize::try_from(u32::from_le_bytes(header)) else {
            return (entries, Some(expected));
        };
        let start = offset + FRAME_HEADER;
        let Some(frame) = bytes.get(start..start + len) else {
            return (entries, Some(expected));
        };

        let Ok(entry) = bincode::deserialize::<WalEntry>(frame) else {
            return (entries, Some(expected));
        };
        if !entry.verify_checksum()
            || entry.sequence != expected
            || entry.term < highest_term
            || entry.fencing_token.term != entry.term
        {
            return (entries, Some(expected));
        }

        highest_term = entry.term;
        offset = start + len;
        entries.push(entry);
    }
    (entries, None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Corrupt { sequence: u64 },
    FailedAppend,
}

impl Halt {
    fn error(self) -> Error {
        match self {
            Halt::Corrupt { sequence } => Error::LogCorrupt { sequence },
            Halt::FailedAppend => {
                Error::Storage("WAL is write-disabled after a failed durable append".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WalStatus {
    last_sequence: u64,
    highest_term: u64,
    halted: Option<Halt>,
}

/// The append-only authority log.
///
/// Appends are serialized in-process; across nodes only the holder of the
/// current fencing token gets past [`LeaderElection::validate`].
#[derive(Debug)]
pub struct AuthorityWal {
    storage: Arc<dyn Storage>,
    election: Arc<LeaderElection>,
    registry: Arc<DeviceRegistry>,
    enforcer: RoleEnforcer,
    append_lock: Mutex<()>,
    status: RwLock<WalStatus>,
}

impl AuthorityWal {
    /// Replays the log to recover the next sequence and the term floor.
    ///
    /// A corrupt log does not fail the open; the WAL comes up halted and every
    /// append reports `LogCorrupt` until an operator repairs the file.
    pub async fn open(
        storage: Arc<dyn Storage>,
        election: Arc<LeaderElection>,
        registry: Arc<DeviceRegistry>,
        enforcer: RoleEnforcer,
    ) -> Result<Self> {
        let bytes = storage.read(WAL_FILE).await?.unwrap_or_default();
        let (entries, corrupt_at) = decode_prefix(&bytes);
        let status = WalStatus {
            last_sequence: entries.last().map_or(0, |e| e.sequence),
            highest_term: entries.last().map_or(0, |e| e.term),
            halted: corrupt_at.map(|sequence| Halt::Corrupt { sequence }),
        };
        if let Some(sequence) = corrupt_at {
            error!("WAL corrupt at sequence {}; log is write-disabled", sequence);
        }

        election.recover_term(status.highest_term).await?;
        info!(
            "WAL opened at sequence {} term {}",
            status.last_sequence, status.highest_term
        );
        Ok(Self {
            storage,
            election,
            registry,
            enforcer,
            append_lock: Mutex::new(()),
            status: RwLock::new(status),
        })
    }

    /// Validates and durably appends one entry, returning its sequence.
    ///
    /// Returns only after the storage layer reports the frame synced. Checks run
    /// in order: halted log, superseded term, recognized token, submitter
    /// membership, submitter write permission, token holder. An AUTHORITY
    /// submitter must be the leader the token names; other roles that may
    /// write act as delegates of that leader.
    ///
    /// Mode is not checked here. Data writes go through
    /// [`crate::node::AuthorityNode::write`], which requires WRITE_MODE.
    pub async fn append(&self, request: AppendRequest) -> Result<u64> {
        let _guard = self.append_lock.lock().await;
        let status = *self.status.read();

        if let Some(halt) = status.halted {
            return Err(halt.error());
        }
        if request.fencing_token.term < status.highest_term {
            return Err(Error::StaleFencingToken {
                presented: request.fencing_token.term,
                current: status.highest_term,
            });
        }
        self.election.validate(&request.fencing_token)?;

        let device = request.submitter;
        let submitter = self
            .registry
            .get(&device)
            .await
            .ok_or(Error::UnknownDevice { device })?;
        if submitter.is_revoked() {
            return Err(Error::DeviceRevoked { device });
        }
        self.enforcer.authorize(submitter.role, Operation::Write)?;
        let leader = request.fencing_token.leader_id;
        if submitter.role == Role::Authority && device != leader {
            warn!("Follower {} tried to append under {}'s token", device, leader);
            return Err(Error::NotTokenHolder { device, leader });
        }

        let sequence = status.last_sequence + 1;
        let entry = WalEntry::seal(sequence, request)?;
        let frame = entry.encode_frame()?;

        if let Err(e) = self.storage.append_durable(WAL_FILE, &frame).await {
            error!("Durable append of sequence {} failed: {}", sequence, e);
            self.status.write().halted = Some(Halt::FailedAppend);
            return Err(e);
        }

        {
            let mut status = self.status.write();
            status.last_sequence = sequence;
            status.highest_term = status.highest_term.max(entry.term);
        }
        debug!(
            "Appended sequence {} ({:?} {}) in term {}",
            sequence, entry.operation, entry.key, entry.term
        );
        Ok(sequence)
    }

    /// Every entry in sequence order. Stops at the first corrupt entry.
    pub async fn replay(&self) -> Result<Vec<WalEntry>> {
        let bytes = self.storage.read(WAL_FILE).await?.unwrap_or_default();
        decode_log(&bytes).map_err(|e| {
            if let Error::LogCorrupt { sequence } = e {
                error!("Replay hit corruption at sequence {}", sequence);
                let mut status = self.status.write();
                if status.halted.is_none() {
                    status.halted = Some(Halt::Corrupt { sequence });
                }
            }
            e
        })
    }

    pub async fn replay_state(&self) -> Result<AuthorityState> {
        AuthorityState::rebuild(&self.replay().await?)
    }

    /// Entries with a sequence above `sequence`, for replicas catching up.
    pub async fn entries_after(&self, sequence: u64) -> Result<Vec<WalEntry>> {
        Ok(self
            .replay()
            .await?
            .into_iter()
            .filter(|e| e.sequence > sequence)
            .collect())
    }

    pub fn last_sequence(&self) -> u64 {
        self.status.read().last_sequence
    }

    pub fn highest_term(&self) -> u64 {
        self.status.read().highest_term
    }

    pub fn is_halted(&self) -> bool {
        self.status.read().halted.is_some()
    }

    /// `Ok` unless the log is write-disabled.
    pub fn ensure_writable(&self) -> Result<()> {
        match self.status.read().halted {
            Some(halt) => Err(halt.error()),
            None => Ok(()),
        }
    }
}
