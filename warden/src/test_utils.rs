use crate::{
    config::ClusterConfig,
    crypto::SeededEntropy,
    identity::DeviceIdentity,
    node::{AuthorityNode, ControlPlane},
    registry::Role,
    storage::InMemoryStorage,
    time::ManualClock,
    Result,
};
use std::{sync::Arc, time::Duration};

const GENESIS_SEED: u64 = 1;
const FIRST_DEVICE_SEED: u64 = 100;

/// An in-process cluster on shared in-memory storage and a manual clock.
///
/// Every node other than the genesis authority joins through the full
/// pairing ceremony.
#[derive(Debug)]
pub struct TestCluster {
    pub storage: Arc<InMemoryStorage>,
    pub clock: Arc<ManualClock>,
    pub plane: Arc<ControlPlane>,
    pub genesis: AuthorityNode,
    pub nodes: Vec<AuthorityNode>,
    next_seed: u64,
}

impl TestCluster {
    pub async fn new() -> Result<Self> {
        Self::with_config(ClusterConfig::default()).await
    }

    pub async fn with_config(config: ClusterConfig) -> Result<Self> {
        let storage = Arc::new(InMemoryStorage::new());
        let clock = Arc::new(ManualClock::default());
        let identity =
            DeviceIdentity::generate_or_load(&InMemoryStorage::new(), &SeededEntropy::new(GENESIS_SEED))
                .await?;
        let plane = ControlPlane::bootstrap(
            config,
            identity.clone(),
            storage.clone(),
            clock.clone(),
            Arc::new(SeededEntropy::new(0)),
        )
        .await?;
        let genesis = AuthorityNode::new(identity, plane.clone());

        Ok(Self {
            storage,
            clock,
            plane,
            genesis,
            nodes: Vec::new(),
            next_seed: FIRST_DEVICE_SEED,
        })
    }

    /// Genesis plus one paired node per entry of `roles`, in order.
    pub async fn with_roles(roles: &[Role]) -> Result<Self> {
        let mut cluster = Self::new().await?;
        for role in roles {
            cluster.pair(*role).await?;
        }
        Ok(cluster)
    }

    /// A fresh identity, not yet paired.
    pub async fn fresh_identity(&mut self) -> Result<DeviceIdentity> {
        let seed = self.next_seed;
        self.next_seed += 1;
        DeviceIdentity::generate_or_load(&InMemoryStorage::new(), &SeededEntropy::new(seed)).await
    }

    /// Pairs a new device with `role` and connects it to every existing node.
    pub async fn pair(&mut self, role: Role) -> Result<AuthorityNode> {
        let identity = self.fresh_identity().await?;
        let node = AuthorityNode::new(identity, self.plane.clone());

        let request = node
            .request_pairing(&format!("test-hw-{}", self.next_seed), role)
            .await?;
        if role != Role::Worker {
            self.genesis.elevate(node.device_id(), role).await?;
        }
        let token = self.genesis.issue_pairing_token().await?;
        self.genesis.approve_pairing(&request, token.token).await?;
        node.await_pairing(Duration::from_secs(1)).await?;

        for other in self.all_nodes() {
            other.add_peer(node.device_id(), node.sender());
            node.add_peer(other.device_id(), other.sender());
        }
        self.nodes.push(node.clone());
        Ok(node)
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &AuthorityNode> {
        std::iter::once(&self.genesis).chain(self.nodes.iter())
    }

    pub async fn start_all(&self) -> Result<()> {
        for node in self.all_nodes() {
            node.start().await?;
        }
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        for node in self.all_nodes() {
            node.shutdown().await;
        }
    }
}

#[derive(Debug)]
pub struct LatencyMeasurement {
    pub operation: String,
    pub start_time: std::time::Instant,
    pub latency_us: u64,
}

impl LatencyMeasurement {
    pub fn start(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start_time: std::time::Instant::now(),
            latency_us: 0,
        }
    }

    pub fn stop(&mut self) {
        self.latency_us = u64::try_from(self.start_time.elapsed().as_micros()).unwrap_or(u64::MAX);
    }

    pub fn assert_milliseconds(&self, max_ms: u64) {
        let ms = self.latency_us / 1000;
        assert!(
            ms <= max_ms,
            "{} took {}ms, expected <= {}ms",
            self.operation,
            ms,
            max_ms
        );
    }
}
