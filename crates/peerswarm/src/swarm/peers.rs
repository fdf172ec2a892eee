use std::{collections::HashMap, net::SocketAddr};

use peer_binary_protocol::Message;
use peerswarm_core::{hash_id::Id20, lengths::ValidPieceIndex};
use tracing::{debug, trace};

use crate::{
    Error,
    peer_connection::{Direction, PeerChannels, PeerEvent, WriterRequest},
    type_aliases::{BF, PeerHandle},
};

use super::stats::PeerCounters;

/// State of a connection that passed the handshake.
pub(crate) struct LivePeer {
    pub channels: PeerChannels,
    pub bitfield: BF,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    /// The piece this connection is downloading, as far as the swarm knows.
    pub assigned: Option<ValidPieceIndex>,

    // Reset on every choke cycle.
    pub downloaded_since_choke: u64,
    pub uploaded_since_choke: u64,

    sent_pieces: BF,
}

impl LivePeer {
    fn new(channels: PeerChannels, total_pieces: usize) -> Self {
        Self {
            channels,
            bitfield: BF::repeat(false, total_pieces),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            assigned: None,
            downloaded_since_choke: 0,
            uploaded_since_choke: 0,
            sent_pieces: BF::repeat(false, total_pieces),
        }
    }

    pub fn has(&self, index: ValidPieceIndex) -> bool {
        self.bitfield
            .get(index.get() as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    pub fn send(&self, msg: Message) {
        if self.channels.tx.send(WriterRequest::Message(msg)).is_err() {
            trace!("peer writer is gone");
        }
    }

    pub fn notify(&self, event: PeerEvent) {
        if self.channels.events.send(event).is_err() {
            trace!("peer control loop is gone");
        }
    }

    pub fn set_interested(&mut self, interested: bool) {
        if self.am_interested == interested {
            return;
        }
        self.am_interested = interested;
        self.send(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }

    /// We are interested as long as the peer has something we lack.
    pub fn update_interest(&mut self, complete: &BF) {
        let interesting = self
            .bitfield
            .iter_ones()
            .any(|i| !complete.get(i).map(|b| *b).unwrap_or(true));
        self.set_interested(interesting);
    }

    pub fn set_choking(&mut self, choking: bool) {
        if self.am_choking == choking {
            return;
        }
        self.am_choking = choking;
        self.send(if choking {
            Message::Choke
        } else {
            Message::Unchoke
        });
    }

    /// Returns true the first time a piece is sent to this peer.
    pub fn mark_sent(&mut self, index: ValidPieceIndex) -> bool {
        !self.sent_pieces.replace(index.get() as usize, true)
    }
}

pub(crate) struct PeerRecord {
    pub addr: SocketAddr,
    pub direction: Direction,
    /// Known from the tracker, or after the handshake.
    pub peer_id: Option<Id20>,
    /// Where the peer accepts connections. For inbound connections we
    /// don't know it.
    pub listen_addr: Option<SocketAddr>,
    pub live: Option<LivePeer>,
    pub counters: PeerCounters,
}

impl PeerRecord {
    fn is_same_identity(
        &self,
        peer_id: Option<Id20>,
        addr: SocketAddr,
        listen_addr: Option<SocketAddr>,
    ) -> bool {
        let same_id_and_ip =
            self.peer_id.is_some() && self.peer_id == peer_id && self.addr.ip() == addr.ip();
        let same_listen_addr = self.listen_addr.is_some() && self.listen_addr == listen_addr;
        same_id_and_ip || same_listen_addr
    }

    pub fn state_name(&self) -> &'static str {
        if self.live.is_some() {
            "live"
        } else {
            "connecting"
        }
    }
}

/// Every connection the swarm knows about, connecting or live.
#[derive(Default)]
pub(crate) struct PeerRegistry {
    peers: HashMap<PeerHandle, PeerRecord>,
}

impl PeerRegistry {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn live_count(&self) -> usize {
        self.peers.values().filter(|p| p.live.is_some()).count()
    }

    pub fn get(&self, addr: PeerHandle) -> Option<&PeerRecord> {
        self.peers.get(&addr)
    }

    pub fn get_mut(&mut self, addr: PeerHandle) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&addr)
    }

    pub fn live(&self, addr: PeerHandle) -> Option<&LivePeer> {
        self.peers.get(&addr).and_then(|p| p.live.as_ref())
    }

    pub fn live_mut(&mut self, addr: PeerHandle) -> Option<&mut LivePeer> {
        self.peers.get_mut(&addr).and_then(|p| p.live.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (PeerHandle, &LivePeer)> {
        self.peers
            .iter()
            .filter_map(|(a, p)| p.live.as_ref().map(|l| (*a, l)))
    }

    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = (PeerHandle, &mut LivePeer)> {
        self.peers
            .iter_mut()
            .filter_map(|(a, p)| p.live.as_mut().map(|l| (*a, l)))
    }

    /// Admission before any bytes are exchanged.
    pub fn admit(
        &self,
        addr: SocketAddr,
        peer_id: Option<Id20>,
        listen_addr: Option<SocketAddr>,
        own_peer_id: Id20,
        max_connections: usize,
    ) -> crate::Result<()> {
        if peer_id == Some(own_peer_id) {
            return Err(Error::ConnectingToOurselves);
        }
        if self.peers.contains_key(&addr)
            || self
                .peers
                .values()
                .any(|p| p.is_same_identity(peer_id, addr, listen_addr))
        {
            return Err(Error::DuplicateConnection);
        }
        if self.peers.len() >= max_connections {
            return Err(Error::TooManyConnections);
        }
        Ok(())
    }

    pub fn insert_connecting(
        &mut self,
        addr: SocketAddr,
        direction: Direction,
        peer_id: Option<Id20>,
    ) {
        let listen_addr = match direction {
            Direction::Outbound => Some(addr),
            Direction::Inbound => None,
        };
        self.peers.insert(
            addr,
            PeerRecord {
                addr,
                direction,
                peer_id,
                listen_addr,
                live: None,
                counters: Default::default(),
            },
        );
    }

    /// The connection at `addr` finished its handshake. Fails if another
    /// connection already talks to the same peer.
    pub fn set_live(
        &mut self,
        addr: SocketAddr,
        peer_id: Id20,
        channels: PeerChannels,
        total_pieces: usize,
    ) -> crate::Result<()> {
        let listen_addr = self
            .peers
            .get(&addr)
            .ok_or(Error::BugPeerNotFound)?
            .listen_addr;
        if let Some(other) = self
            .peers
            .values()
            .filter(|p| p.addr != addr)
            .find(|p| p.is_same_identity(Some(peer_id), addr, listen_addr))
        {
            debug!(existing = %other.addr, "already connected to this peer");
            return Err(Error::DuplicateConnection);
        }
        let record = self.peers.get_mut(&addr).ok_or(Error::BugPeerNotFound)?;
        record.peer_id = Some(peer_id);
        record.live = Some(LivePeer::new(channels, total_pieces));
        Ok(())
    }

    pub fn remove(&mut self, addr: PeerHandle) -> Option<PeerRecord> {
        self.peers.remove(&addr)
    }

    /// Is anyone except `except` still assigned this piece?
    pub fn is_assigned_elsewhere(&self, index: ValidPieceIndex, except: PeerHandle) -> bool {
        self.iter_live()
            .any(|(a, l)| a != except && l.assigned == Some(index))
    }

    /// Wake up connections that are idle, so they ask for a piece again.
    pub fn refresh_idle(&self, except: Option<PeerHandle>) {
        for (addr, live) in self.iter_live() {
            if Some(addr) != except && live.assigned.is_none() {
                live.notify(PeerEvent::RefreshEndgame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    const OURS: Id20 = Id20::new([1; 20]);
    const A: Id20 = Id20::new([2; 20]);

    fn channels() -> PeerChannels {
        PeerChannels {
            tx: unbounded_channel().0,
            events: unbounded_channel().0,
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_admit() {
        let mut r = PeerRegistry::default();
        r.insert_connecting(addr("10.0.0.1:6881"), Direction::Outbound, Some(A));

        assert!(matches!(
            r.admit(addr("10.0.0.2:1"), Some(OURS), None, OURS, 50),
            Err(Error::ConnectingToOurselves)
        ));
        // Same listening address.
        assert!(matches!(
            r.admit(addr("10.0.0.1:6881"), None, Some(addr("10.0.0.1:6881")), OURS, 50),
            Err(Error::DuplicateConnection)
        ));
        // Same id, same ip, other port.
        assert!(matches!(
            r.admit(addr("10.0.0.1:7000"), Some(A), Some(addr("10.0.0.1:7000")), OURS, 50),
            Err(Error::DuplicateConnection)
        ));
        // Same id from another host is someone else.
        assert!(r.admit(addr("10.0.0.9:6881"), Some(A), None, OURS, 50).is_ok());
        assert!(matches!(
            r.admit(addr("10.0.0.9:6881"), None, None, OURS, 1),
            Err(Error::TooManyConnections)
        ));
    }

    #[test]
    fn test_duplicate_identity_rejected_at_handshake() {
        let mut r = PeerRegistry::default();
        let first = addr("10.0.0.1:6881");
        let second = addr("10.0.0.1:51000");
        r.insert_connecting(first, Direction::Outbound, None);
        r.insert_connecting(second, Direction::Inbound, None);

        r.set_live(first, A, channels(), 10).unwrap();
        assert!(matches!(
            r.set_live(second, A, channels(), 10),
            Err(Error::DuplicateConnection)
        ));
        assert_eq!(r.live_count(), 1);

        let other_host = addr("10.0.0.2:51000");
        r.insert_connecting(other_host, Direction::Inbound, None);
        r.set_live(other_host, A, channels(), 10).unwrap();
        assert_eq!(r.live_count(), 2);
    }

    #[test]
    fn test_interest_messages_only_on_change() {
        let (tx, mut rx) = unbounded_channel();
        let mut live = LivePeer::new(
            PeerChannels {
                tx,
                events: unbounded_channel().0,
            },
            4,
        );
        let mut complete = BF::repeat(false, 4);
        complete.set(0, true);

        live.bitfield.set(0, true);
        live.update_interest(&complete);
        assert!(rx.try_recv().is_err());

        live.bitfield.set(2, true);
        live.update_interest(&complete);
        live.update_interest(&complete);
        assert!(matches!(
            rx.try_recv(),
            Ok(WriterRequest::Message(Message::Interested))
        ));
        assert!(rx.try_recv().is_err());

        complete.set(2, true);
        live.update_interest(&complete);
        assert!(matches!(
            rx.try_recv(),
            Ok(WriterRequest::Message(Message::NotInterested))
        ));
    }
}
