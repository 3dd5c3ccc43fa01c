use serde::{Deserialize, Serialize};

use crate::{election::FencingToken, time::Timestamp, DeviceId};

/// Node-to-node traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Heartbeat(Heartbeat),
    TermAnnouncement(FencingToken),
    Demotion(Demotion),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: DeviceId,
    pub term: u64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demotion {
    pub device_id: DeviceId,
    pub term: u64,
    pub reason: String,
}
