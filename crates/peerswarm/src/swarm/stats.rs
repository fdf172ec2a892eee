use std::{collections::HashMap, time::Duration};

use serde::Serialize;
use serde_with::serde_as;

#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Verified bytes downloaded in this session.
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub left_bytes: u64,
    pub completed_pieces: u32,
    pub total_pieces: u32,
    pub progress_percent: f64,
    pub download_speed_bps: u64,
    pub upload_speed_bps: u64,
    /// At the current download speed. None when idle or done.
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub time_remaining: Option<Duration>,
    pub connected_peers: usize,
    pub endgame: bool,
}

/// Per-peer totals. Updated under the swarm lock.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PeerCounters {
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub pieces_downloaded: u32,
    pub pieces_sent: u32,
    pub hash_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub state: &'static str,
    pub peer_id: Option<String>,
    pub counters: PeerCounters,
    /// Bytes per second since the last choke pass.
    pub download_rate_bps: u64,
    pub upload_rate_bps: u64,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatsSnapshot {
    pub peers: HashMap<String, PeerStats>,
}
