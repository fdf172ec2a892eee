use std::time::Duration;

use peerswarm_core::constants::BLOCK_SIZE;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Timeouts of a single peer connection.
#[serde_as]
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConnectionOptions {
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub connect_timeout: Duration,

    /// Bounds the wait for the remote handshake.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub handshake_timeout: Duration,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub read_write_timeout: Duration,

    /// If nothing was queued for sending for this long, a keep-alive goes out.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub keep_alive_interval: Duration,

    /// A peer silent for this long at the moment we send a keep-alive is
    /// considered dead.
    #[serde_as(as = "serde_with::DurationSeconds")]
    pub peer_timeout: Duration,
}

impl Default for PeerConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            read_write_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(120),
            peer_timeout: Duration::from_secs(180),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmOptions {
    /// Size of the blocks we request. Must be a power of two.
    pub block_size: u32,

    /// Unanswered requests per connection.
    pub max_inflight_requests: usize,

    /// Peers unchoked by the regular scheduling pass.
    pub max_unchoked: usize,

    /// Every N-th scheduling pass also does an optimistic unchoke.
    pub optimistic_unchoke_every: u64,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub choke_interval: Duration,

    /// If set, end-game starts once the completed fraction exceeds this
    /// percentage. Otherwise it starts once every piece was requested at least
    /// once.
    pub endgame_threshold_percent: Option<f64>,

    /// Requests tolerated from a peer we are choking. The next one disconnects it.
    pub max_stray_requests: u32,

    /// Largest block a peer may request from us.
    pub max_request_length: u32,

    pub max_connections: usize,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub tracker_update_interval: Duration,

    #[serde_as(as = "serde_with::DurationSeconds")]
    pub speed_estimator_window: Duration,

    pub peer_opts: PeerConnectionOptions,
}

impl Default for SwarmOptions {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            max_inflight_requests: 5,
            max_unchoked: 5,
            optimistic_unchoke_every: 3,
            choke_interval: Duration::from_secs(10),
            endgame_threshold_percent: None,
            max_stray_requests: 3,
            max_request_length: 128 * 1024,
            max_connections: 50,
            tracker_update_interval: Duration::from_secs(60),
            speed_estimator_window: Duration::from_secs(5),
            peer_opts: PeerConnectionOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let opts: SwarmOptions =
            serde_json::from_str(r#"{"max_unchoked": 8, "peer_opts": {"handshake_timeout": 5}}"#)
                .unwrap();
        assert_eq!(opts.max_unchoked, 8);
        assert_eq!(opts.max_inflight_requests, 5);
        assert_eq!(opts.choke_interval, Duration::from_secs(10));
        assert_eq!(opts.peer_opts.handshake_timeout, Duration::from_secs(5));
        assert_eq!(opts.peer_opts.keep_alive_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_durations_serialize_as_seconds() {
        let s = serde_json::to_value(PeerConnectionOptions::default()).unwrap();
        assert_eq!(s["peer_timeout"], 180);
    }
}
