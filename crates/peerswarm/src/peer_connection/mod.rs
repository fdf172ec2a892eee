pub mod session;
pub mod wire;

use std::{net::SocketAddr, time::Duration};

use bytes::Bytes;
use peer_binary_protocol::{Handshake, Message, Request};
use peerswarm_core::{
    hash_id::Id20,
    lengths::ValidPieceIndex,
    peer_id::try_decode_azureus_style,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
    time::{Instant, timeout},
};
use tracing::{debug, trace};

use crate::{
    error::{Error, TerminationReason},
    options::PeerConnectionOptions,
    read_buf::ReadBuf,
    type_aliases::{PeerEventTx, PeerTx},
};

pub use session::{Direction, PeerSession, PeerState, SessionOptions};

/// A piece handed to a connection by the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub piece: ValidPieceIndex,
    pub length: u32,
    pub hash: Id20,
    /// The piece is also being downloaded by other connections.
    pub endgame: bool,
}

/// The channels through which the swarm talks to a live connection.
#[derive(Debug, Clone)]
pub struct PeerChannels {
    pub tx: PeerTx,
    pub events: PeerEventTx,
}

/// How a connection reaches the swarm. All methods are synchronous and return
/// quickly; anything the swarm wants to tell the connection goes through
/// [`PeerChannels`].
pub trait PeerConnectionHandler {
    fn on_connected(&self, _connection_time: Duration) {}
    /// Admission control. On success the connection is live and reachable
    /// through `channels`.
    fn on_handshake(&self, handshake: &Handshake, channels: PeerChannels) -> crate::Result<()>;
    fn serialize_bitfield_message_to_buf(&self, buf: &mut Vec<u8>) -> crate::Result<usize>;
    fn on_bitfield(&self, bitfield: Bytes) -> crate::Result<()>;
    fn on_have(&self, index: u32) -> crate::Result<()>;
    fn on_remote_choking(&self, choking: bool);
    fn on_remote_interested(&self, interested: bool);
    fn is_choking_remote(&self) -> bool;
    /// Queue a block upload. An error disconnects the peer.
    fn on_peer_request(&self, request: Request) -> crate::Result<()>;
    /// The connection is idle and unchoked: ask for something to download.
    fn on_ready(&self) -> Option<Assignment>;
    /// A piece finished downloading. `data` is None if it failed verification.
    fn on_piece_downloaded(&self, piece: ValidPieceIndex, data: Option<Vec<u8>>);
    fn on_downloaded_bytes(&self, bytes: u32);
    fn on_uploaded_bytes(&self, bytes: u32);
    fn read_block(&self, request: &Request, buf: &mut [u8]) -> anyhow::Result<()>;
    /// Called exactly once per connection.
    fn on_ended(&self, reason: TerminationReason);
}

#[derive(Debug)]
pub enum WriterRequest {
    Message(Message),
    UploadBlock(Request),
}

/// Everything the control loop of a connection reacts to. Only `Received`
/// comes off the wire; the rest are local signals and can't be serialized.
#[derive(Debug)]
pub enum PeerEvent {
    Received(Message),
    KeepAliveSent,
    RefreshEndgame,
    CancelPieceEndgame(ValidPieceIndex),
}

pub(crate) async fn with_timeout<T>(
    name: &'static str,
    timeout_value: Duration,
    fut: impl std::future::Future<Output = crate::Result<T>>,
) -> crate::Result<T> {
    match timeout(timeout_value, fut).await {
        Ok(v) => v,
        Err(_) => Err(Error::Timeout(name)),
    }
}

// Reports the end of the connection to the handler when dropped, so that every
// exit path, including the task being cancelled, produces exactly one report.
struct EndedGuard<'a, H: PeerConnectionHandler> {
    handler: &'a H,
    addr: SocketAddr,
    reason: TerminationReason,
}

impl<'a, H: PeerConnectionHandler> EndedGuard<'a, H> {
    fn new(handler: &'a H, addr: SocketAddr) -> Self {
        Self {
            handler,
            addr,
            reason: TerminationReason::Completed,
        }
    }

    fn finish(mut self, result: crate::Result<TerminationReason>) -> TerminationReason {
        self.reason = match result {
            Ok(reason) => reason,
            Err(e) => {
                debug!(addr = %self.addr, "connection error: {e:#}");
                e.termination_reason()
            }
        };
        self.reason
    }
}

impl<H: PeerConnectionHandler> Drop for EndedGuard<'_, H> {
    fn drop(&mut self) {
        debug!(addr = %self.addr, reason = %self.reason, "connection ended");
        self.handler.on_ended(self.reason);
    }
}

pub(crate) struct PeerConnection<H> {
    handler: H,
    addr: SocketAddr,
    info_hash: Id20,
    peer_id: Id20,
    options: PeerConnectionOptions,
    session_options: SessionOptions,
}

impl<H: PeerConnectionHandler> PeerConnection<H> {
    pub fn new(
        addr: SocketAddr,
        info_hash: Id20,
        peer_id: Id20,
        handler: H,
        options: PeerConnectionOptions,
        session_options: SessionOptions,
    ) -> Self {
        PeerConnection {
            handler,
            addr,
            info_hash,
            peer_id,
            options,
            session_options,
        }
    }

    /// Dial the peer and run the connection until it ends.
    pub async fn manage_outgoing(&self) -> TerminationReason {
        let guard = EndedGuard::new(&self.handler, self.addr);
        let result = async {
            let now = Instant::now();
            let conn = with_timeout("connecting", self.options.connect_timeout, async {
                tokio::net::TcpStream::connect(self.addr)
                    .await
                    .map_err(Error::Connect)
            })
            .await?;
            self.handler.on_connected(now.elapsed());
            self.outgoing(conn).await
        }
        .await;
        guard.finish(result)
    }

    /// Run an outbound connection over an already established stream.
    pub async fn manage_outgoing_stream(
        &self,
        conn: impl AsyncRead + AsyncWrite + Unpin,
    ) -> TerminationReason {
        let guard = EndedGuard::new(&self.handler, self.addr);
        guard.finish(self.outgoing(conn).await)
    }

    /// Run an accepted connection. The remote handshakes first.
    pub async fn manage_incoming(
        &self,
        conn: impl AsyncRead + AsyncWrite + Unpin,
    ) -> TerminationReason {
        let guard = EndedGuard::new(&self.handler, self.addr);
        guard.finish(self.incoming(conn).await)
    }

    fn new_session(&self, direction: Direction, tx: PeerTx) -> PeerSession {
        PeerSession::new(
            direction,
            self.info_hash,
            self.peer_id,
            self.session_options,
            tx,
        )
    }

    async fn write_handshake(&self, conn: &mut (impl AsyncWrite + Unpin)) -> crate::Result<()> {
        let mut write_buf = Vec::new();
        Handshake::new(self.info_hash, self.peer_id).serialize(&mut write_buf);
        with_timeout("writing handshake", self.options.read_write_timeout, async {
            conn.write_all(&write_buf)
                .await
                .map_err(Error::WriteHandshake)
        })
        .await
    }

    async fn outgoing(
        &self,
        mut conn: impl AsyncRead + AsyncWrite + Unpin,
    ) -> crate::Result<TerminationReason> {
        let (tx, rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();
        let mut session = self.new_session(Direction::Outbound, tx.clone());

        self.write_handshake(&mut conn).await?;
        session.on_init();

        let mut read_buf = ReadBuf::new();
        let h = read_buf
            .read_handshake(&mut conn, self.options.handshake_timeout)
            .await?;
        trace!(
            "connected: id={:?}",
            try_decode_azureus_style(&h.peer_id)
        );
        session.on_handshake(
            &h,
            &self.handler,
            PeerChannels {
                tx,
                events: events_tx.clone(),
            },
        )?;

        self.manage_peer(session, read_buf, conn, rx, events_tx, events_rx)
            .await
    }

    async fn incoming(
        &self,
        mut conn: impl AsyncRead + AsyncWrite + Unpin,
    ) -> crate::Result<TerminationReason> {
        let (tx, rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();
        let mut session = self.new_session(Direction::Inbound, tx.clone());
        session.on_init();

        let mut read_buf = ReadBuf::new();
        let h = read_buf
            .read_handshake(&mut conn, self.options.handshake_timeout)
            .await?;
        trace!(
            "incoming connection: id={:?}",
            try_decode_azureus_style(&h.peer_id)
        );
        session.on_handshake(
            &h,
            &self.handler,
            PeerChannels {
                tx,
                events: events_tx.clone(),
            },
        )?;
        self.write_handshake(&mut conn).await?;

        self.manage_peer(session, read_buf, conn, rx, events_tx, events_rx)
            .await
    }

    // Runs the reader, the writer and the control loop until one of them
    // finishes. Dropping the other two closes the socket.
    async fn manage_peer(
        &self,
        mut session: PeerSession,
        mut read_buf: ReadBuf,
        conn: impl AsyncRead + AsyncWrite + Unpin,
        rx: UnboundedReceiver<WriterRequest>,
        events_tx: PeerEventTx,
        mut events_rx: UnboundedReceiver<PeerEvent>,
    ) -> crate::Result<TerminationReason> {
        let (mut read_half, mut write_half) = tokio::io::split(conn);
        let cancelled = session.cancelled_uploads();

        let writer = wire::run_writer(
            &self.handler,
            &mut write_half,
            rx,
            &events_tx,
            &cancelled,
            &self.options,
            self.session_options.block_size,
        );
        let reader = wire::run_reader(&mut read_buf, &mut read_half, &events_tx);
        let control = async {
            while let Some(event) = events_rx.recv().await {
                if let Some(reason) = session.handle_event(event, &self.handler) {
                    return reason;
                }
            }
            TerminationReason::Completed
        };

        tokio::select! {
            r = reader => {
                trace!("reader is done, exiting");
                r.map(|_| TerminationReason::Completed)
            }
            r = writer => {
                trace!("writer is done, exiting");
                r.map(|_| TerminationReason::Completed)
            }
            reason = control => {
                trace!(%reason, "session ended");
                Ok(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use peer_binary_protocol::{HANDSHAKE_LEN, Message};
    use peerswarm_core::hash_id::Id20;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::{
        error::TerminationReason,
        peer_connection::{PeerConnection, SessionOptions},
        options::{PeerConnectionOptions, SwarmOptions},
        read_buf::ReadBuf,
        tests::test_util::MockHandler,
    };

    use super::*;

    const OUR_INFO_HASH: Id20 = Id20::new([1u8; 20]);
    const OUR_ID: Id20 = Id20::new([2u8; 20]);
    const THEIR_ID: Id20 = Id20::new([3u8; 20]);

    fn make_conn(handler: MockHandler) -> PeerConnection<MockHandler> {
        PeerConnection::new(
            "127.0.0.1:6881".parse().unwrap(),
            OUR_INFO_HASH,
            OUR_ID,
            handler,
            PeerConnectionOptions::default(),
            SessionOptions::from(&SwarmOptions::default()),
        )
    }

    #[tokio::test]
    async fn test_wrong_info_hash_is_bad_handshake_and_sends_no_bitfield() {
        let handler = MockHandler::new(4);
        let conn = make_conn(handler.clone());
        let (ours, mut theirs) = tokio::io::duplex(4096);

        let remote = tokio::spawn(async move {
            let mut hs = Vec::new();
            Handshake::new(Id20::new([9u8; 20]), THEIR_ID).serialize(&mut hs);
            theirs.write_all(&hs).await.unwrap();
            let mut received = Vec::new();
            theirs.read_to_end(&mut received).await.unwrap();
            received
        });

        let reason = conn.manage_outgoing_stream(ours).await;
        drop(conn);
        assert_eq!(reason, TerminationReason::BadHandshake);

        // Only our handshake went out, nothing after it.
        let received = remote.await.unwrap();
        assert_eq!(received.len(), HANDSHAKE_LEN);
        assert_eq!(*handler.ended.lock(), vec![TerminationReason::BadHandshake]);
        assert!(handler.registered.lock().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_connection_rejected_at_handshake() {
        let handler = MockHandler::new(4);
        handler.reject_handshake.store(true, std::sync::atomic::Ordering::SeqCst);
        let conn = make_conn(handler.clone());
        let (ours, mut theirs) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut hs = Vec::new();
            Handshake::new(OUR_INFO_HASH, THEIR_ID).serialize(&mut hs);
            theirs.write_all(&hs).await.unwrap();
            let mut sink = Vec::new();
            let _ = theirs.read_to_end(&mut sink).await;
        });

        let reason = conn.manage_incoming(ours).await;
        assert_eq!(reason, TerminationReason::DuplicateConnection);
        assert_eq!(handler.ended.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_bitfield_sent_first_even_when_empty() {
        let handler = MockHandler::new(12);
        let conn = make_conn(handler.clone());
        let (ours, theirs) = tokio::io::duplex(4096);
        let received: Arc<Mutex<Vec<Message>>> = Default::default();
        let received_2 = received.clone();

        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(theirs);
            let mut hs = Vec::new();
            Handshake::new(OUR_INFO_HASH, THEIR_ID).serialize(&mut hs);
            w.write_all(&hs).await.unwrap();
            let mut rb = ReadBuf::new();
            rb.read_handshake(&mut r, Duration::from_secs(5))
                .await
                .unwrap();
            let first = rb.read_message(&mut r).await.unwrap();
            received_2.lock().push(first);
            // Hang up between frames.
        });

        let reason = conn.manage_incoming(ours).await;
        assert_eq!(reason, TerminationReason::Completed);
        assert_eq!(
            *received.lock(),
            vec![Message::Bitfield(Bytes::from(vec![0u8, 0u8]))]
        );
        assert!(handler.registered.lock().is_some());
        assert_eq!(handler.ended.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_connection_still_reports_end() {
        let handler = MockHandler::new(4);
        let conn = make_conn(handler.clone());
        let (ours, _theirs) = tokio::io::duplex(4096);
        let fut = async move { conn.manage_incoming(ours).await };
        let r = tokio::time::timeout(Duration::from_millis(10), fut).await;
        assert!(r.is_err());
        assert_eq!(*handler.ended.lock(), vec![TerminationReason::Completed]);
    }
}
