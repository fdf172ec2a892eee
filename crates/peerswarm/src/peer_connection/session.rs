// The per-connection state machine. It owns everything that only this
// connection cares about (the piece being downloaded, outstanding requests,
// cancel bookkeeping) and talks to the swarm through the handler.
//
// No I/O happens here: outgoing messages are pushed onto the writer queue, and
// every input arrives as a PeerEvent.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use peer_binary_protocol::{Handshake, Message, Piece, Request};
use peerswarm_core::{hash_id::Id20, lengths::ValidPieceIndex};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    error::{Error, TerminationReason},
    options::SwarmOptions,
    piece_store::PieceBuffer,
    type_aliases::PeerTx,
};

use super::{Assignment, PeerChannels, PeerConnectionHandler, PeerEvent, WriterRequest};

/// Requests the remote cancelled before we served them. Shared with the writer,
/// which checks it right before uploading a block.
pub type CancelledUploads = Arc<Mutex<HashSet<Request>>>;

// A peer can't make us remember more cancels than this.
const MAX_PENDING_CANCELS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Idle,
    AwaitingHandshake,
    AwaitingBitfieldOrHave,
    AwaitingUnchoke,
    ReadyToDownload,
    Downloading,
    AwaitingBlockWindow,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub block_size: u32,
    pub max_inflight_requests: usize,
    pub max_stray_requests: u32,
    pub peer_timeout: Duration,
}

impl From<&SwarmOptions> for SessionOptions {
    fn from(o: &SwarmOptions) -> Self {
        Self {
            block_size: o.block_size,
            max_inflight_requests: o.max_inflight_requests,
            max_stray_requests: o.max_stray_requests,
            peer_timeout: o.peer_opts.peer_timeout,
        }
    }
}

struct Download {
    assignment: Assignment,
    buffer: PieceBuffer,
    offset: u32,
    // Offsets of requested blocks that haven't arrived yet.
    outstanding: VecDeque<u32>,
    // While downloading an end-game piece, every request we send is mirrored
    // here until its block arrives, so it can be cancelled.
    mirrored: Vec<Request>,
}

impl Download {
    fn new(assignment: Assignment) -> Self {
        Self {
            buffer: PieceBuffer::new(assignment.piece, assignment.length, assignment.hash),
            assignment,
            offset: 0,
            outstanding: VecDeque::new(),
            mirrored: Vec::new(),
        }
    }

    // Start the piece over, keeping the assignment.
    fn reset(&mut self) {
        let a = self.assignment;
        self.buffer = PieceBuffer::new(a.piece, a.length, a.hash);
        self.offset = 0;
        self.outstanding.clear();
        self.mirrored.clear();
    }

    fn block_len(&self, block_size: u32, offset: u32) -> u32 {
        std::cmp::min(block_size, self.assignment.length - offset)
    }
}

fn send(tx: &PeerTx, msg: Message) {
    if tx.send(WriterRequest::Message(msg)).is_err() {
        trace!("writer is gone, dropping message");
    }
}

pub struct PeerSession {
    direction: Direction,
    info_hash: Id20,
    own_peer_id: Id20,
    opts: SessionOptions,
    tx: PeerTx,

    state: PeerState,
    remote_choking: bool,
    // Requests received while we choke the remote, over the whole connection.
    stray_requests: u32,
    download: Option<Download>,
    cancelled_uploads: CancelledUploads,
    last_inbound: Instant,
    end_reason: Option<TerminationReason>,
}

impl PeerSession {
    pub fn new(
        direction: Direction,
        info_hash: Id20,
        own_peer_id: Id20,
        opts: SessionOptions,
        tx: PeerTx,
    ) -> Self {
        Self {
            direction,
            info_hash,
            own_peer_id,
            opts,
            tx,
            state: PeerState::Idle,
            remote_choking: true,
            stray_requests: 0,
            download: None,
            cancelled_uploads: Default::default(),
            last_inbound: Instant::now(),
            end_reason: None,
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn end_reason(&self) -> Option<TerminationReason> {
        self.end_reason
    }

    pub fn assigned_piece(&self) -> Option<ValidPieceIndex> {
        self.download.as_ref().map(|d| d.assignment.piece)
    }

    pub fn cancelled_uploads(&self) -> CancelledUploads {
        self.cancelled_uploads.clone()
    }

    /// The outbound side has sent its handshake and waits for the remote's.
    /// The inbound side waits for the remote to go first.
    pub fn on_init(&mut self) {
        self.state = match self.direction {
            Direction::Outbound => PeerState::AwaitingHandshake,
            Direction::Inbound => PeerState::AwaitingBitfieldOrHave,
        };
    }

    pub fn on_handshake<H: PeerConnectionHandler>(
        &mut self,
        h: &Handshake,
        handler: &H,
        channels: PeerChannels,
    ) -> crate::Result<()> {
        if h.info_hash != self.info_hash {
            return Err(Error::WrongInfoHash);
        }
        if h.peer_id == self.own_peer_id {
            return Err(Error::ConnectingToOurselves);
        }
        handler.on_handshake(h, channels)?;
        self.last_inbound = Instant::now();
        self.state = PeerState::AwaitingBitfieldOrHave;
        Ok(())
    }

    /// Process one event. Returns the reason once the session has ended.
    pub fn handle_event<H: PeerConnectionHandler>(
        &mut self,
        event: PeerEvent,
        handler: &H,
    ) -> Option<TerminationReason> {
        if self.state == PeerState::Ended {
            return self.end_reason;
        }
        match event {
            PeerEvent::Received(msg) => {
                self.last_inbound = Instant::now();
                if let Err(e) = self.on_message(msg, handler) {
                    debug!("error handling message: {e:#}");
                    self.end(e.termination_reason());
                }
            }
            PeerEvent::KeepAliveSent => self.on_keep_alive_sent(handler),
            PeerEvent::RefreshEndgame => self.on_refresh_endgame(handler),
            PeerEvent::CancelPieceEndgame(index) => self.on_cancel_piece_endgame(index, handler),
        }
        self.end_reason
    }

    pub fn on_message<H: PeerConnectionHandler>(
        &mut self,
        msg: Message,
        handler: &H,
    ) -> crate::Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.remote_choking = true;
                handler.on_remote_choking(true);
                if let Some(d) = self.download.as_mut() {
                    d.reset();
                }
                if self.is_past_unchoke() {
                    self.state = PeerState::ReadyToDownload;
                }
            }
            Message::Unchoke => {
                self.remote_choking = false;
                handler.on_remote_choking(false);
                if self.download.is_some() {
                    self.state = PeerState::Downloading;
                    self.request_blocks(handler);
                } else {
                    self.become_ready(handler);
                }
            }
            Message::Interested => handler.on_remote_interested(true),
            Message::NotInterested => handler.on_remote_interested(false),
            Message::Have(index) => {
                handler.on_have(index)?;
                self.on_availability_changed(handler);
            }
            Message::Bitfield(bits) => {
                handler.on_bitfield(bits)?;
                self.on_availability_changed(handler);
            }
            Message::Request(request) => self.on_request(request, handler)?,
            Message::Piece(piece) => self.on_piece(piece, handler)?,
            Message::Cancel(request) => {
                let mut g = self.cancelled_uploads.lock();
                if g.len() >= MAX_PENDING_CANCELS {
                    g.clear();
                }
                g.insert(request);
            }
            Message::Port(port) => trace!(port, "ignoring DHT port"),
        }
        Ok(())
    }

    fn is_past_unchoke(&self) -> bool {
        matches!(
            self.state,
            PeerState::ReadyToDownload | PeerState::Downloading | PeerState::AwaitingBlockWindow
        )
    }

    fn on_availability_changed<H: PeerConnectionHandler>(&mut self, handler: &H) {
        if self.state == PeerState::AwaitingBitfieldOrHave {
            self.state = PeerState::AwaitingUnchoke;
        }
        // The peer may have unchoked us before telling what it has.
        if !self.remote_choking && self.download.is_none() {
            self.become_ready(handler);
        }
    }

    fn on_request<H: PeerConnectionHandler>(
        &mut self,
        request: Request,
        handler: &H,
    ) -> crate::Result<()> {
        if self.cancelled_uploads.lock().remove(&request) {
            trace!(?request, "request was already cancelled");
            return Ok(());
        }
        if handler.is_choking_remote() {
            if self.stray_requests >= self.opts.max_stray_requests {
                return Err(Error::TooManyStrayRequests);
            }
            self.stray_requests += 1;
            debug!(
                ?request,
                count = self.stray_requests,
                "request while choked, choking again"
            );
            send(&self.tx, Message::Choke);
            return Ok(());
        }
        handler.on_peer_request(request)
    }

    fn on_piece<H: PeerConnectionHandler>(&mut self, piece: Piece, handler: &H) -> crate::Result<()> {
        let block_size = self.opts.block_size;
        let Some(d) = self.download.as_mut() else {
            debug!(index = piece.index, begin = piece.begin, "block for no piece, ignoring");
            return Ok(());
        };
        if piece.index != d.assignment.piece.get() {
            debug!(
                index = piece.index,
                begin = piece.begin,
                "block of a piece we are not downloading, ignoring"
            );
            return Ok(());
        }
        let Some(pos) = d.outstanding.iter().position(|o| *o == piece.begin) else {
            debug!(index = piece.index, begin = piece.begin, "unrequested block, ignoring");
            return Ok(());
        };
        let len = piece.block.len() as u32;
        if len != d.block_len(block_size, piece.begin) {
            return Err(Error::ProtocolViolation("block length doesn't match request"));
        }
        d.buffer
            .write_block(piece.begin, &piece.block)
            .map_err(Error::Anyhow)?;
        d.outstanding.remove(pos);
        d.mirrored.retain(|r| r.begin != piece.begin);
        handler.on_downloaded_bytes(len);

        self.request_blocks(handler);
        Ok(())
    }

    // Fill the request window. When every block has arrived, verify the piece.
    fn request_blocks<H: PeerConnectionHandler>(&mut self, handler: &H) {
        if self.remote_choking {
            return;
        }
        let block_size = self.opts.block_size;
        let max_inflight = self.opts.max_inflight_requests;
        let Some(d) = self.download.as_mut() else {
            return;
        };

        while d.offset < d.assignment.length && d.outstanding.len() < max_inflight {
            let request = Request::new(
                d.assignment.piece.get(),
                d.offset,
                d.block_len(block_size, d.offset),
            );
            send(&self.tx, Message::Request(request));
            if d.assignment.endgame {
                d.mirrored.push(request);
            }
            d.outstanding.push_back(d.offset);
            d.offset += block_size;
        }

        if d.offset >= d.assignment.length && d.outstanding.is_empty() {
            self.finish_piece(handler);
            return;
        }
        self.state = if d.outstanding.len() >= max_inflight {
            PeerState::AwaitingBlockWindow
        } else {
            PeerState::Downloading
        };
    }

    fn finish_piece<H: PeerConnectionHandler>(&mut self, handler: &H) {
        let Some(d) = self.download.take() else {
            return;
        };
        let index = d.assignment.piece;
        let data = d.buffer.verify_and_take();
        trace!(piece = %index, ok = data.is_some(), "piece downloaded");
        handler.on_piece_downloaded(index, data);
        self.become_ready(handler);
    }

    fn become_ready<H: PeerConnectionHandler>(&mut self, handler: &H) {
        self.state = PeerState::ReadyToDownload;
        if self.remote_choking || self.download.is_some() {
            return;
        }
        let assignment = handler.on_ready();
        self.on_assignment(assignment, handler);
    }

    /// Take the piece the swarm handed us, if any, and start requesting it.
    pub fn on_assignment<H: PeerConnectionHandler>(
        &mut self,
        assignment: Option<Assignment>,
        handler: &H,
    ) {
        match assignment {
            Some(a) => {
                trace!(piece = %a.piece, endgame = a.endgame, "assigned piece");
                self.download = Some(Download::new(a));
                self.state = PeerState::Downloading;
                self.request_blocks(handler);
            }
            None => {
                trace!("nothing to download from this peer");
                self.state = PeerState::ReadyToDownload;
            }
        }
    }

    /// Another connection finished `index` first. Cancel what we still wait
    /// for and move on to another piece.
    pub fn on_cancel_piece_endgame<H: PeerConnectionHandler>(
        &mut self,
        index: ValidPieceIndex,
        handler: &H,
    ) {
        if self.assigned_piece() != Some(index) {
            debug!(piece = %index, "asked to cancel a piece we aren't downloading, ignoring");
            return;
        }
        let Some(d) = self.download.take() else {
            return;
        };
        let block_size = self.opts.block_size;
        let to_cancel: Vec<Request> = if d.assignment.endgame {
            d.mirrored
        } else {
            d.outstanding
                .iter()
                .map(|o| Request::new(index.get(), *o, d.block_len(block_size, *o)))
                .collect()
        };
        trace!(piece = %index, cancels = to_cancel.len(), "piece completed elsewhere");
        for r in to_cancel {
            send(&self.tx, Message::Cancel(r));
        }
        self.become_ready(handler);
    }

    /// End-game state changed: an idle connection may now get a piece.
    pub fn on_refresh_endgame<H: PeerConnectionHandler>(&mut self, handler: &H) {
        if self.download.is_none()
            && !self.remote_choking
            && matches!(
                self.state,
                PeerState::AwaitingUnchoke | PeerState::ReadyToDownload
            )
        {
            self.become_ready(handler);
        }
    }

    pub fn on_keep_alive_sent<H: PeerConnectionHandler>(&mut self, handler: &H) {
        let silent_for = self.last_inbound.elapsed();
        if silent_for >= self.opts.peer_timeout {
            debug!("{:#}", Error::PeerSilent(silent_for));
            self.end(TerminationReason::Timeout);
            return;
        }
        if self.state == PeerState::ReadyToDownload {
            self.become_ready(handler);
        }
    }

    /// Returns false if the session had already ended.
    pub fn end(&mut self, reason: TerminationReason) -> bool {
        if self.state == PeerState::Ended {
            return false;
        }
        self.state = PeerState::Ended;
        self.end_reason = Some(reason);
        self.download = None;
        true
    }
}
