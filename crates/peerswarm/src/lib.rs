//!
//! The peer side of [BitTorrent](https://en.wikipedia.org/wiki/BitTorrent): talking the peer wire
//! protocol, verifying and storing pieces, and coordinating a swarm of connections.
//!
//! # Overview
//! Start with [`SwarmCoordinator`]. Give it the metainfo, a [`Storage`] and somewhere to
//! send [`TrackerUpdate`]s, then feed it peers with [`SwarmCoordinator::update_peer_list`]
//! and accept connections with [`SwarmCoordinator::listen`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerswarm::*;
//!
//! tokio_test::block_on(async {
//!     let content = b"hello world".repeat(10_000);
//!     let meta = Metainfo::from_content("", 32768, &[("hello.txt", &content[..])]).unwrap();
//!     let storage = FilesystemStorage::open("/tmp/peerswarm".as_ref(), &meta.files).unwrap();
//!     let swarm = SwarmCoordinator::new(
//!         &meta,
//!         Box::new(storage),
//!         generate_peer_id(b"-PS0001-"),
//!         Arc::new(NoopTrackerSink),
//!         SwarmOptions::default(),
//!     )
//!     .unwrap();
//!     swarm.run(None);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:6881").await.unwrap();
//!     swarm.listen(listener).unwrap();
//! })
//! ```

mod error;
pub mod options;
pub mod peer_connection;
pub mod piece_store;
mod read_buf;
pub mod storage;
pub mod swarm;
pub mod tracker;
mod type_aliases;

pub use error::{Error, Result, TerminationReason};
pub use options::{PeerConnectionOptions, SwarmOptions};
pub use piece_store::{PieceBitsets, PieceStore};
pub use storage::{FilesystemStorage, Storage};
pub use swarm::{
    Availability, PeerSource, SwarmCoordinator,
    stats::{PeerCounters, PeerStats, PeerStatsSnapshot, StatsSnapshot},
};
pub use tracker::{NoopTrackerSink, PeerInfo, TrackerEvent, TrackerSink, TrackerUpdate};
pub use type_aliases::{BF, PeerHandle};

pub use peerswarm_core::hash_id::Id20;
pub use peerswarm_core::lengths::{Lengths, ValidPieceIndex};
pub use peerswarm_core::metainfo::{FileEntry, Metainfo};
pub use peerswarm_core::peer_id::*;


/// The cargo version of peerswarm.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
