// The tracker client is an outside collaborator: it hands us peer lists and
// receives our progress. Only the interface lives here.

use std::net::SocketAddr;

use peerswarm_core::hash_id::Id20;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// A peer as reported by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: Option<Id20>,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerEvent {
    Started,
    Completed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerUpdate {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub event: Option<TrackerEvent>,
}

pub trait TrackerSink: Send + Sync {
    fn on_update(&self, update: TrackerUpdate);
}

impl TrackerSink for UnboundedSender<TrackerUpdate> {
    fn on_update(&self, update: TrackerUpdate) {
        if self.send(update).is_err() {
            debug!("tracker update receiver is gone");
        }
    }
}

/// Sink that drops everything, for swarms without a tracker.
pub struct NoopTrackerSink;

impl TrackerSink for NoopTrackerSink {
    fn on_update(&self, _update: TrackerUpdate) {}
}
