use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration as StdDuration};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    access::{Operation, RoleEnforcer},
    config::ClusterConfig,
    crypto::EntropySource,
    election::{ElectionRole, FencingToken, LeaderElection, LivenessTracker},
    identity::DeviceIdentity,
    message::{Demotion, Heartbeat, Message},
    mode::{Mode, ModeGate, ModeState},
    pairing::{DeviceCertificate, PairingApproval, PairingAuthority, PairingRequest, PairingToken, TokenValue},
    registry::{DeviceRegistry, DeviceStatus, RegistryEntry, Role},
    storage::Storage,
    time::{Clock, Timestamp},
    wal::{AppendRequest, AuthorityWal},
    DeviceId, Error, Result,
};

const APPROVAL_POLL: StdDuration = StdDuration::from_millis(50);

/// The durable cluster state every node of one cluster agrees on: the
/// registry, the election, the authority log and the mode gate, plus the
/// pairing authority that admits devices.
///
/// Each instance is independent; tests run several clusters in one process.
#[derive(Debug)]
pub struct ControlPlane {
    config: ClusterConfig,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    enforcer: RoleEnforcer,
    pairing: PairingAuthority,
    registry: Arc<DeviceRegistry>,
    election: Arc<LeaderElection>,
    wal: Arc<AuthorityWal>,
    mode: ModeGate,
}

impl ControlPlane {
    /// Opens cluster state, creating it with `genesis` as the first AUTHORITY
    /// if it does not exist yet. Safe to call again on existing state.
    pub async fn bootstrap(
        config: ClusterConfig,
        genesis: DeviceIdentity,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn EntropySource>,
    ) -> Result<Arc<Self>> {
        let plane = Self::assemble(config, genesis, storage, clock, entropy).await?;
        let genesis_id = plane.pairing.device_id();
        if plane.registry.get(&genesis_id).await.is_none() {
            if !plane.registry.is_empty().await {
                return Err(Error::IdentityMismatch);
            }
            let certificate = plane.pairing.certify_self(Role::Authority);
            plane.registry.enroll(&certificate).await?;
            info!("Bootstrapped cluster with genesis authority {}", genesis_id);
        }
        plane
            .registry
            .set_priority(genesis_id, plane.config.priority)
            .await?;
        Ok(plane)
    }

    /// Opens existing cluster state. `genesis` must be the identity that bootstrapped it.
    pub async fn open(
        config: ClusterConfig,
        genesis: DeviceIdentity,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn EntropySource>,
    ) -> Result<Arc<Self>> {
        let plane = Self::assemble(config, genesis, storage, clock, entropy).await?;
        if plane.registry.is_empty().await {
            return Err(Error::Config(
                "Cluster state is not bootstrapped; start with --bootstrap".to_string(),
            ));
        }
        if plane.registry.get(&plane.pairing.device_id()).await.is_none() {
            return Err(Error::IdentityMismatch);
        }
        Ok(plane)
    }

    async fn assemble(
        config: ClusterConfig,
        genesis: DeviceIdentity,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn EntropySource>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let enforcer = RoleEnforcer::new(config.authority_persists);
        let issuer = genesis.public_key();

        let pairing = PairingAuthority::open(
            genesis,
            storage.clone(),
            clock.clone(),
            entropy,
            config.token_ttl(),
        )
        .await?;
        let registry = Arc::new(
            DeviceRegistry::open(storage.clone(), clock.clone(), issuer, config.max_devices).await?,
        );
        let election =
            Arc::new(LeaderElection::open(registry.clone(), enforcer, storage.clone()).await?);
        let wal = Arc::new(
            AuthorityWal::open(storage.clone(), election.clone(), registry.clone(), enforcer).await?,
        );
        let mode = ModeGate::open(wal.clone(), storage.clone(), clock.clone()).await?;

        Ok(Arc::new(Self {
            config,
            storage,
            clock,
            enforcer,
            pairing,
            registry,
            election,
            wal,
            mode,
        }))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn enforcer(&self) -> RoleEnforcer {
        self.enforcer
    }

    pub fn pairing(&self) -> &PairingAuthority {
        &self.pairing
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn election(&self) -> &Arc<LeaderElection> {
        &self.election
    }

    pub fn wal(&self) -> &Arc<AuthorityWal> {
        &self.wal
    }

    pub fn mode(&self) -> &ModeGate {
        &self.mode
    }

    pub fn current_mode(&self) -> ModeState {
        self.mode.current_mode()
    }

    /// Why `device` may not perform `operation` right now, if it may not.
    ///
    /// Read-class operations only need the role. Writes additionally need a
    /// writable log, an elected leader and `WRITE_MODE`.
    pub async fn check_operation(&self, device: DeviceId, operation: Operation) -> Result<()> {
        self.authorize(device, operation).await?;

        if operation.is_write_class() {
            self.wal.ensure_writable()?;
            if self.election.current().is_none() {
                return Err(Error::NoQuorum);
            }
            let mode = self.mode.current_mode().mode;
            if mode != Mode::WriteMode {
                return Err(Error::ModeConflict {
                    current: mode,
                    requested: Mode::WriteMode,
                });
            }
        }
        Ok(())
    }

    /// Collaborator entry point. Unknown operations, unknown devices and
    /// every failed check answer `false`.
    pub async fn is_write_permitted(&self, device: DeviceId, operation: &str) -> bool {
        let Ok(operation) = operation.parse::<Operation>() else {
            return false;
        };
        match self.check_operation(device, operation).await {
            Ok(()) => true,
            Err(e) => {
                debug!("{} denied {}: {}", device, operation, e);
                false
            }
        }
    }

    async fn authorize(&self, device: DeviceId, operation: Operation) -> Result<RegistryEntry> {
        let entry = self
            .registry
            .get(&device)
            .await
            .ok_or(Error::UnknownDevice { device })?;
        if entry.is_revoked() {
            return Err(Error::DeviceRevoked { device });
        }
        self.enforcer.authorize(entry.role, operation)?;
        Ok(entry)
    }
}

/// Snapshot served to operators and collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub device_id: DeviceId,
    pub role: Option<Role>,
    pub term: u64,
    pub leader: Option<DeviceId>,
    pub is_leader: bool,
    pub mode: ModeState,
    pub wal_sequence: u64,
    pub wal_halted: bool,
    pub devices: usize,
}

/// One node: its identity, the cluster state it participates in, and the
/// background tasks that keep it live.
#[derive(Debug, Clone)]
pub struct AuthorityNode {
    identity: DeviceIdentity,
    plane: Arc<ControlPlane>,
    liveness: Arc<LivenessTracker>,
    peers: Arc<DashMap<DeviceId, mpsc::UnboundedSender<Message>>>,
    message_tx: mpsc::UnboundedSender<Message>,
    pub message_rx: Arc<parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Message>>>>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
}

impl AuthorityNode {
    pub fn new(identity: DeviceIdentity, plane: Arc<ControlPlane>) -> Self {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            identity,
            plane,
            liveness: Arc::new(LivenessTracker::new()),
            peers: Arc::new(DashMap::new()),
            message_tx,
            message_rx: Arc::new(parking_lot::Mutex::new(Some(message_rx))),
            shutdown: Arc::new(shutdown),
            tasks: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.identity.device_id()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    /// Sender for this node's inbox.
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.message_tx.clone()
    }

    pub fn add_peer(&self, peer: DeviceId, sender: mpsc::UnboundedSender<Message>) {
        self.peers.insert(peer, sender);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn broadcast(&self, message: &Message) {
        self.peers
            .retain(|_, sender| sender.send(message.clone()).is_ok());
    }

    pub async fn role(&self) -> Option<Role> {
        self.plane
            .registry
            .get(&self.device_id())
            .await
            .map(|e| e.role)
    }

    pub fn current_mode(&self) -> ModeState {
        self.plane.current_mode()
    }

    pub async fn is_write_permitted(&self, device: DeviceId, operation: &str) -> bool {
        self.plane.is_write_permitted(device, operation).await
    }

    pub async fn status(&self) -> NodeStatus {
        let current = self.plane.election.current();
        NodeStatus {
            device_id: self.device_id(),
            role: self.role().await,
            term: self.plane.election.term(),
            leader: current.map(|t| t.leader_id),
            is_leader: current.is_some_and(|t| t.leader_id == self.device_id()),
            mode: self.plane.current_mode(),
            wal_sequence: self.plane.wal.last_sequence(),
            wal_halted: self.plane.wal.is_halted(),
            devices: self.plane.registry.len().await,
        }
    }

    // Pairing, device side.

    /// Writes a pairing request artifact for this node.
    pub async fn request_pairing(
        &self,
        hardware_fingerprint: &str,
        requested_role: Role,
    ) -> Result<PairingRequest> {
        let request = PairingRequest::new(
            &self.identity,
            hardware_fingerprint,
            requested_role,
            self.plane.clock.now(),
        );
        request.submit(self.plane.storage.as_ref()).await?;
        info!("Submitted pairing request for {}", self.device_id());
        Ok(request)
    }

    /// Waits for the approval artifact naming this node.
    pub async fn await_pairing(&self, timeout: StdDuration) -> Result<DeviceCertificate> {
        tokio::time::timeout(timeout, self.poll_approval())
            .await
            .map_err(|_| Error::Other(anyhow::anyhow!("No pairing approval within {timeout:?}")))?
    }

    async fn poll_approval(&self) -> Result<DeviceCertificate> {
        loop {
            let approval =
                PairingApproval::fetch(self.plane.storage.as_ref(), &self.device_id()).await?;
            if let Some(approval) = approval {
                approval.certificate.verify(&self.plane.pairing.public_key())?;
                return Ok(approval.certificate);
            }
            tokio::time::sleep(APPROVAL_POLL).await;
        }
    }

    // Pairing, operator side. The caller must hold admin-pairing.

    pub async fn issue_pairing_token(&self) -> Result<PairingToken> {
        self.plane
            .authorize(self.device_id(), Operation::AdminPairing)
            .await?;
        self.plane.pairing.purge_expired().await?;
        self.plane.pairing.issue_token().await
    }

    pub async fn elevate(&self, device: DeviceId, role: Role) -> Result<()> {
        self.plane
            .authorize(self.device_id(), Operation::AdminPairing)
            .await?;
        self.plane.pairing.elevate(device, role);
        Ok(())
    }

    pub async fn pending_pairing_requests(&self) -> Result<Vec<PairingRequest>> {
        self.plane
            .authorize(self.device_id(), Operation::AdminPairing)
            .await?;
        self.plane.pairing.pending_requests().await
    }

    /// Redeems `token` for `request`, enrolls the device and, when a leader
    /// may persist, records the role assignment in the log.
    ///
    /// The token is only spent once the registry would admit the device, and
    /// the approval artifact is only written after enrollment succeeds.
    pub async fn approve_pairing(
        &self,
        request: &PairingRequest,
        token: TokenValue,
    ) -> Result<RegistryEntry> {
        self.plane
            .authorize(self.device_id(), Operation::AdminPairing)
            .await?;
        self.plane.registry.check_enrollable(request.device_id).await?;
        let certificate = self.plane.pairing.certify(request, token).await?;
        let entry = self.plane.registry.enroll(&certificate).await?;
        self.plane.pairing.publish(request, certificate).await?;

        if let Some(leader) = self.plane.election.current() {
            if self.plane.enforcer.permits(Role::Authority, Operation::Write) {
                let record = AppendRequest::role_assignment(
                    leader.leader_id,
                    leader,
                    entry.device_id,
                    entry.role,
                )?;
                self.plane.wal.append(record).await?;
            }
        }
        Ok(entry)
    }

    // Election.

    /// Runs an election. When the winner may persist, its term is opened with
    /// a `TermStart` entry.
    pub async fn elect(&self) -> Result<FencingToken> {
        self.plane
            .authorize(self.device_id(), Operation::Elect)
            .await?;
        let token = self.plane.election.elect().await?;
        self.open_term(token).await?;
        Ok(token)
    }

    /// Steps `device` down. Elects a replacement and tells peers.
    pub async fn demote(&self, device: DeviceId) -> Result<FencingToken> {
        self.plane
            .authorize(self.device_id(), Operation::Elect)
            .await?;
        let term = self.plane.election.term();
        let token = self.plane.election.demote(device).await?;
        self.open_term(token).await?;
        self.broadcast(&Message::Demotion(Demotion {
            device_id: device,
            term,
            reason: format!("demoted by {}", self.device_id()),
        }));
        Ok(token)
    }

    async fn open_term(&self, token: FencingToken) -> Result<()> {
        if self.plane.enforcer.permits(Role::Authority, Operation::Write) {
            self.plane
                .wal
                .append(AppendRequest::term_start(token.leader_id, token))
                .await?;
        }
        Ok(())
    }

    /// This node's fencing token, if it is the current leader.
    pub fn fencing_token(&self) -> Option<FencingToken> {
        self.plane
            .election
            .current()
            .filter(|t| t.leader_id == self.device_id())
    }

    pub fn election_role(&self) -> ElectionRole {
        self.plane.election.role_of(&self.device_id())
    }

    // Writes.

    /// Appends a `Put` under `token`. Requires `WRITE_MODE`.
    pub async fn write(&self, key: &str, value: Vec<u8>, token: FencingToken) -> Result<u64> {
        let mode = self.plane.current_mode().mode;
        if mode != Mode::WriteMode {
            return Err(Error::ModeConflict {
                current: mode,
                requested: Mode::WriteMode,
            });
        }
        self.plane
            .wal
            .append(AppendRequest::put(self.device_id(), token, key, value))
            .await
    }

    pub async fn request_mode(&self, target: Mode, token: FencingToken) -> Result<ModeState> {
        self.plane
            .mode
            .request_mode(target, self.device_id(), token)
            .await
    }

    // Background tasks.

    pub async fn handle_message(&self, message: Message) -> Result<()> {
        match message {
            Message::Heartbeat(hb) => {
                self.note_heartbeat(hb.node_id, hb.timestamp).await?;
            }
            Message::TermAnnouncement(token) => {
                self.plane.election.observe(token).await?;
            }
            Message::Demotion(demotion) => {
                let leads = self
                    .plane
                    .election
                    .current()
                    .is_some_and(|t| t.leader_id == demotion.device_id);
                if leads {
                    let token = self.plane.election.demote(demotion.device_id).await?;
                    self.open_term(token).await?;
                }
            }
        }
        Ok(())
    }

    /// Records a heartbeat. A device marked OFFLINE for silence is ONLINE
    /// again once a fresh heartbeat arrives, so the next election tick can
    /// consider it. Revoked devices stay revoked.
    async fn note_heartbeat(&self, device: DeviceId, at: Timestamp) -> Result<()> {
        self.liveness.record(device, at);
        let now = self.plane.clock.now();
        if self
            .liveness
            .is_stale(&device, now, self.plane.config.election_timeout_ms)
        {
            return Ok(());
        }
        let offline = self
            .plane
            .registry
            .get(&device)
            .await
            .is_some_and(|e| e.status == DeviceStatus::Offline);
        if offline {
            self.plane
                .registry
                .set_status(device, DeviceStatus::Online)
                .await?;
            info!("{} is heartbeating again, marking ONLINE", device);
        }
        Ok(())
    }

    /// Replaces the leader as soon as the registry says it may no longer lead.
    async fn recheck_leader(&self) {
        let Some(token) = self.plane.election.current() else {
            return;
        };
        let eligible = self
            .plane
            .registry
            .get(&token.leader_id)
            .await
            .is_some_and(|e| e.role == Role::Authority && e.status == DeviceStatus::Online);
        if eligible {
            return;
        }

        info!("Leader {} is no longer eligible, re-electing", token.leader_id);
        match self.plane.election.demote(token.leader_id).await {
            Ok(next) => {
                if let Err(e) = self.open_term(next).await {
                    error!("Could not open term {}: {}", next.term, e);
                }
            }
            Err(Error::NoQuorum) => debug!("No eligible successor"),
            Err(e) => warn!("Re-election after registry change failed: {}", e),
        }
    }

    /// Spawns the inbox, heartbeat, election-timer, registry-watch and
    /// term-announcement tasks.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = Vec::new();

        let node = self.clone();
        let mut changes = self.plane.registry.subscribe();
        let mut stop = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        node.recheck_leader().await;
                    }
                    _ = stop.changed() => break,
                }
            }
        }));

        let inbox = self.message_rx.lock().take();
        if let Some(mut rx) = inbox {
            let node = self.clone();
            let mut stop = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        message = rx.recv() => {
                            let Some(message) = message else { break };
                            if let Err(e) = node.handle_message(message).await {
                                warn!("Error processing message: {}", e);
                            }
                        }
                        _ = stop.changed() => break,
                    }
                }
            }));
        }

        let heartbeat_every = StdDuration::from_millis(self.plane.config.heartbeat_interval_ms);
        let node = self.clone();
        let mut stop = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_every);
            loop {
                tokio::select! {
                    _ = interval.tick() => node.send_heartbeat().await,
                    _ = stop.changed() => break,
                }
            }
        }));

        let timeout_ms = self.plane.config.election_timeout_ms;
        let node = self.clone();
        let mut stop = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(StdDuration::from_millis(timeout_ms / 2));
            loop {
                tokio::select! {
                    _ = interval.tick() => node.election_tick(timeout_ms).await,
                    _ = stop.changed() => break,
                }
            }
        }));

        let node = self.clone();
        let mut announcements = self.plane.election.subscribe();
        let mut stop = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    token = announcements.recv() => match token {
                        Ok(token) => node.broadcast(&Message::TermAnnouncement(token)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("Skipped {} term announcements", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        }));

        self.tasks.lock().extend(tasks);
        info!("Node {} started with {} peers", self.device_id(), self.peer_count());
        Ok(())
    }

    async fn send_heartbeat(&self) {
        let now = self.plane.clock.now();
        if let Err(e) = self.note_heartbeat(self.device_id(), now).await {
            warn!("Could not record own heartbeat: {}", e);
        }
        self.broadcast(&Message::Heartbeat(Heartbeat {
            node_id: self.device_id(),
            term: self.plane.election.term(),
            timestamp: now,
        }));
    }

    async fn election_tick(&self, timeout_ms: u64) {
        let eligible = self
            .plane
            .registry
            .get(&self.device_id())
            .await
            .is_some_and(|e| {
                !e.is_revoked() && self.plane.enforcer.permits(e.role, Operation::Elect)
            });
        if !eligible {
            return;
        }

        let now = self.plane.clock.now();
        match self
            .plane
            .election
            .check_leader(&self.liveness, now, timeout_ms)
            .await
        {
            Ok(Some(token)) => {
                if let Err(e) = self.open_term(token).await {
                    error!("Could not open term {}: {}", token.term, e);
                }
            }
            Ok(None) => {}
            Err(Error::NoQuorum) => debug!("Still no quorum"),
            Err(e) => warn!("Election check failed: {}", e),
        }
    }

    /// Stops the background tasks and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Node task ended abnormally: {}", e);
            }
        }
        info!("Node {} stopped", self.device_id());
    }
}
