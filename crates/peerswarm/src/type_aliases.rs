use std::net::SocketAddr;

use tokio::sync::mpsc::UnboundedSender;

use crate::peer_connection::{PeerEvent, WriterRequest};

pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub type PeerHandle = SocketAddr;

/// Outgoing queue of a connection, drained by its writer.
pub type PeerTx = UnboundedSender<WriterRequest>;

/// Control mailbox of a connection.
pub type PeerEventTx = UnboundedSender<PeerEvent>;
