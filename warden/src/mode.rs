use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    election::FencingToken,
    storage::Storage,
    time::{Clock, Timestamp},
    wal::{AppendRequest, AuthorityWal},
    DeviceId, Error, Result,
};

pub const MODE_FILE: &str = "mode.json";

/// Cluster-wide operating mode. `WriteMode` and `ExecMode` never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Idle,
    WriteMode,
    ExecMode,
}

impl Mode {
    /// Only `Idle` leads anywhere, and everything leads back to `Idle`.
    pub fn can_transition_to(self, target: Mode) -> bool {
        matches!(
            (self, target),
            (Mode::Idle, Mode::WriteMode | Mode::ExecMode)
                | (Mode::WriteMode | Mode::ExecMode, Mode::Idle)
        )
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Idle => "IDLE",
            Mode::WriteMode => "WRITE_MODE",
            Mode::ExecMode => "EXEC_MODE",
        })
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IDLE" => Ok(Mode::Idle),
            "WRITE_MODE" => Ok(Mode::WriteMode),
            "EXEC_MODE" => Ok(Mode::ExecMode),
            other => Err(Error::Config(format!("Unknown mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeState {
    pub mode: Mode,
    pub entered_at: Timestamp,
}

/// Payload of a `ModeTransition` log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: Mode,
    pub to: Mode,
    pub at: Timestamp,
}

/// Reads the mode file without a gate, for collaborators that only look.
pub async fn read_mode_file(storage: &dyn Storage) -> Result<Option<ModeState>> {
    match storage.read(MODE_FILE).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

async fn write_mode_file(storage: &dyn Storage, state: &ModeState) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(state)?;
    storage.write_atomic(MODE_FILE, &bytes).await
}

/// Mode state machine committed through the authority log.
///
/// A transition is decided once its log entry is durable. The mode file is a
/// cache of the last committed state, repaired from the log on open.
#[derive(Debug)]
pub struct ModeGate {
    wal: Arc<AuthorityWal>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    transition_lock: Mutex<()>,
    state: RwLock<ModeState>,
}

impl ModeGate {
    pub async fn open(
        wal: Arc<AuthorityWal>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let from_file = read_mode_file(storage.as_ref()).await?;
        let from_log = match wal.replay_state().await {
            Ok(state) => state.mode,
            Err(e) if e.is_corruption() => {
                warn!("Cannot reconcile mode against a corrupt log: {}", e);
                from_file
            }
            Err(e) => return Err(e),
        };

        let state = match (from_log, from_file) {
            (Some(logged), _) => logged,
            (None, Some(cached)) if cached.mode == Mode::Idle => cached,
            (None, _) => ModeState {
                mode: Mode::Idle,
                entered_at: clock.now(),
            },
        };
        if from_file != Some(state) {
            warn!("Mode file disagrees with the log; rewriting as {}", state.mode);
            write_mode_file(storage.as_ref(), &state).await?;
        }
        info!("Mode gate opened in {}", state.mode);

        Ok(Self {
            wal,
            storage,
            clock,
            transition_lock: Mutex::new(()),
            state: RwLock::new(state),
        })
    }

    pub fn current_mode(&self) -> ModeState {
        *self.state.read()
    }

    /// Moves the cluster to `target`, logging the transition under `fencing_token`.
    ///
    /// Entering a mode requires `Idle`; anything else is a `ModeConflict`.
    /// Requesting `Idle` while idle succeeds without logging anything.
    pub async fn request_mode(
        &self,
        target: Mode,
        submitter: DeviceId,
        fencing_token: FencingToken,
    ) -> Result<ModeState> {
        let _guard = self.transition_lock.lock().await;
        let current = *self.state.read();

        if current.mode == Mode::Idle && target == Mode::Idle {
            return Ok(current);
        }
        if !current.mode.can_transition_to(target) {
            warn!("Refusing {} while in {}", target, current.mode);
            return Err(Error::ModeConflict {
                current: current.mode,
                requested: target,
            });
        }

        let transition = ModeTransition {
            from: current.mode,
            to: target,
            at: self.clock.now(),
        };
        let sequence = self
            .wal
            .append(AppendRequest::mode_transition(
                submitter,
                fencing_token,
                &transition,
            )?)
            .await?;

        let next = ModeState {
            mode: target,
            entered_at: transition.at,
        };
        *self.state.write() = next;
        if let Err(e) = write_mode_file(self.storage.as_ref(), &next).await {
            // Committed in the log already; the next open rewrites the file.
            error!("Mode file write failed after sequence {}: {}", sequence, e);
        }

        info!("Mode {} -> {} at sequence {}", current.mode, target, sequence);
        Ok(next)
    }

    /// Returns to `Idle` from whichever mode is active.
    pub async fn release(&self, submitter: DeviceId, fencing_token: FencingToken) -> Result<ModeState> {
        self.request_mode(Mode::Idle, submitter, fencing_token).await
    }
}
