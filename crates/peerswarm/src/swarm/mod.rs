// The swarm: all connections for one content item, the shared piece state,
// and the policies deciding what to download from whom, and whom to upload to.
//
// ## Locking
// Everything shared between connections lives in SwarmLocked, behind a single
// mutex. Connections call in through PeerHandler. The swarm never calls into a
// connection; it only queues messages and events onto its channels, so a
// connection reporting a piece can't deadlock with the swarm broadcasting
// Have back to it.
//
// Storage I/O happens with the lock released.

pub mod choker;
mod peers;
pub mod piece_selection;
pub mod stats;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use peer_binary_protocol::{Handshake, Message, Request};
use peerswarm_core::{
    hash_id::Id20,
    lengths::{Lengths, ValidPieceIndex},
    metainfo::Metainfo,
    peer_id::try_decode_azureus_style,
    spawn_utils::spawn_with_cancel,
    speed_estimator::SpeedEstimator,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::mpsc::UnboundedReceiver,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, info, trace, warn};

use crate::{
    Error,
    error::TerminationReason,
    options::SwarmOptions,
    peer_connection::{
        Assignment, Direction, PeerChannels, PeerConnection, PeerConnectionHandler, PeerEvent,
        SessionOptions, WriterRequest,
    },
    piece_store::{PieceBitsets, PieceStore},
    storage::Storage,
    tracker::{PeerInfo, TrackerEvent, TrackerSink, TrackerUpdate},
    type_aliases::{BF, PeerHandle},
};

use self::{
    choker::{ChokeCandidate, Choker},
    peers::{LivePeer, PeerRecord, PeerRegistry},
    piece_selection::{PieceAvailability, select_piece},
    stats::{PeerStats, PeerStatsSnapshot, StatsSnapshot},
};

/// Batches of peers from a tracker client.
pub type PeerSource = UnboundedReceiver<Vec<PeerInfo>>;

/// What a peer told us it has.
#[derive(Debug)]
pub enum Availability {
    Bitfield(Bytes),
    Have(u32),
}

struct SwarmLocked {
    bitsets: PieceBitsets,
    availability: PieceAvailability,
    peers: PeerRegistry,
    // The piece every idle connection joins in end-game.
    endgame_piece: Option<ValidPieceIndex>,
    choker: Choker,
    last_choke: Option<Instant>,
    left_bytes: u64,
    completed_reported: bool,
}

pub struct SwarmCoordinator {
    info_hash: Id20,
    peer_id: Id20,
    options: SwarmOptions,
    store: PieceStore,
    locked: Mutex<SwarmLocked>,
    tracker: Arc<dyn TrackerSink>,

    downloaded: AtomicU64,
    uploaded: AtomicU64,
    down_speed: SpeedEstimator,
    up_speed: SpeedEstimator,

    cancellation_token: CancellationToken,
}

impl SwarmCoordinator {
    /// Pre-size the files and check what's already there. Fails only if the
    /// storage can't be prepared.
    pub fn new(
        metainfo: &Metainfo,
        storage: Box<dyn Storage>,
        peer_id: Id20,
        tracker: Arc<dyn TrackerSink>,
        options: SwarmOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let lengths = metainfo.lengths(options.block_size)?;
        let store = PieceStore::new(metainfo, lengths, storage)?;
        let have = store.initial_check().context("initial check failed")?;
        let bitsets = PieceBitsets::with_complete(have);
        let left_bytes = lengths
            .iter_piece_infos()
            .filter(|p| !bitsets.is_complete(p.piece_index))
            .map(|p| p.len as u64)
            .sum();
        let total_pieces = lengths.total_pieces() as usize;
        let window = options.speed_estimator_window.as_secs() as usize;

        Ok(Arc::new(Self {
            info_hash: metainfo.info_hash,
            peer_id,
            store,
            locked: Mutex::new(SwarmLocked {
                bitsets,
                availability: PieceAvailability::new(total_pieces),
                peers: PeerRegistry::default(),
                endgame_piece: None,
                choker: Choker::default(),
                last_choke: None,
                left_bytes,
                completed_reported: false,
            }),
            tracker,
            downloaded: Default::default(),
            uploaded: Default::default(),
            down_speed: SpeedEstimator::new(window),
            up_speed: SpeedEstimator::new(window),
            cancellation_token: CancellationToken::new(),
            options,
        }))
    }

    pub fn info_hash(&self) -> Id20 {
        self.info_hash
    }

    pub fn peer_id(&self) -> Id20 {
        self.peer_id
    }

    pub fn lengths(&self) -> &Lengths {
        self.store.lengths()
    }

    pub fn piece_store(&self) -> &PieceStore {
        &self.store
    }

    /// Announce ourselves and start the periodic work: choking, tracker
    /// updates and speed estimation. Runs until [`Self::stop`].
    pub fn run(self: &Arc<Self>, peer_source: Option<PeerSource>) {
        info!(info_hash = %self.info_hash, "starting swarm");
        self.report_progress(Some(TrackerEvent::Started));

        spawn_with_cancel(
            error_span!("swarm", info_hash = %self.info_hash),
            self.cancellation_token.clone(),
            self.clone().task_periodic(),
        );
        if let Some(source) = peer_source {
            spawn_with_cancel(
                error_span!("peer_source"),
                self.cancellation_token.clone(),
                self.clone().task_peer_source(source),
            );
        }
    }

    /// Drop every connection and tell the tracker we left.
    pub fn stop(&self) {
        if self.cancellation_token.is_cancelled() {
            return;
        }
        info!("stopping swarm");
        self.cancellation_token.cancel();
        self.report_progress(Some(TrackerEvent::Stopped));
    }

    async fn task_periodic(self: Arc<Self>) -> anyhow::Result<()> {
        let mut choke = tokio::time::interval(self.options.choke_interval);
        let mut tracker = tokio::time::interval(self.options.tracker_update_interval);
        let mut speed = tokio::time::interval(Duration::from_secs(1));
        // The first tick is immediate, and Started already went out.
        tracker.tick().await;

        loop {
            tokio::select! {
                _ = choke.tick() => self.run_choke_cycle(),
                _ = tracker.tick() => self.report_progress(None),
                _ = speed.tick() => self.update_speed(),
            }
        }
    }

    async fn task_peer_source(self: Arc<Self>, mut source: PeerSource) -> anyhow::Result<()> {
        while let Some(peers) = source.recv().await {
            let dialed = self.update_peer_list(peers);
            trace!(dialed, "peer list updated");
        }
        debug!("peer source closed");
        Ok(())
    }

    fn update_speed(&self) {
        let left = self.locked.lock().left_bytes;
        let now = Instant::now();
        self.down_speed
            .add_snapshot(self.downloaded.load(Ordering::Relaxed), Some(left), now);
        self.up_speed
            .add_snapshot(self.uploaded.load(Ordering::Relaxed), None, now);
    }

    fn progress_locked(&self, g: &SwarmLocked, event: Option<TrackerEvent>) -> TrackerUpdate {
        TrackerUpdate {
            downloaded: self.downloaded.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            left: g.left_bytes,
            event,
        }
    }

    fn report_progress(&self, event: Option<TrackerEvent>) {
        let update = self.progress_locked(&self.locked.lock(), event);
        self.tracker.on_update(update);
    }

    fn is_endgame_locked(&self, bitsets: &PieceBitsets) -> bool {
        if bitsets.all_complete() {
            return false;
        }
        match self.options.endgame_threshold_percent {
            Some(pct) => bitsets.completed_count() as f64 * 100. / bitsets.total() as f64 > pct,
            None => bitsets.all_requested_or_complete(),
        }
    }

    pub fn is_endgame(&self) -> bool {
        self.is_endgame_locked(&self.locked.lock().bitsets)
    }

    /// Pick the next piece to download from `addr` and mark it requested.
    pub fn choose_piece(&self, addr: PeerHandle, endgame: bool) -> Option<ValidPieceIndex> {
        let mut g = self.locked.lock();
        self.choose_piece_locked(&mut g, addr, endgame, &mut rand::rng())
    }

    fn choose_piece_locked<R: Rng + ?Sized>(
        &self,
        g: &mut SwarmLocked,
        addr: PeerHandle,
        endgame: bool,
        rng: &mut R,
    ) -> Option<ValidPieceIndex> {
        let known_peers = g.peers.live_count();
        let live = g.peers.live(addr)?;
        let piece = select_piece(
            self.store.lengths(),
            &g.bitsets,
            &g.availability,
            &live.bitfield,
            known_peers,
            endgame,
            rng,
        )?;
        g.bitsets.mark_requested(piece);
        Some(piece)
    }

    /// The connection at `addr` is unchoked and idle. Hand it a piece, or tell
    /// the peer we're not interested.
    pub fn peer_ready(&self, addr: PeerHandle) -> Option<Assignment> {
        let assignment = {
            let mut g = self.locked.lock();
            self.assign_locked(&mut g, addr, &mut rand::rng())
        };
        self.maybe_run_choke_cycle();
        assignment
    }

    fn assign_locked<R: Rng + ?Sized>(
        &self,
        g: &mut SwarmLocked,
        addr: PeerHandle,
        rng: &mut R,
    ) -> Option<Assignment> {
        let Some(live) = g.peers.live_mut(addr) else {
            debug!(peer = %addr, "bug: ready peer isn't live");
            return None;
        };
        if let Some(stale) = live.assigned.take() {
            debug!(peer = %addr, piece = %stale, "peer dropped its piece");
            self.release_piece_locked(g, stale, addr);
        }

        let endgame = self.is_endgame_locked(&g.bitsets);
        let shared = g.endgame_piece.filter(|p| {
            endgame
                && !g.bitsets.is_complete(*p)
                && g.peers.live(addr).is_some_and(|l| l.has(*p))
        });
        let chosen = match shared {
            Some(p) => Some(p),
            None => {
                let p = self.choose_piece_locked(g, addr, endgame, rng);
                if endgame && g.endgame_piece.is_none_or(|e| g.bitsets.is_complete(e)) {
                    g.endgame_piece = p;
                }
                p
            }
        };

        let live = g.peers.live_mut(addr)?;
        let Some(piece) = chosen else {
            trace!(peer = %addr, "nothing to download from peer");
            live.set_interested(false);
            return None;
        };
        live.assigned = Some(piece);
        live.set_interested(true);

        if !endgame && self.is_endgame_locked(&g.bitsets) {
            debug!("entering end-game");
            g.peers.refresh_idle(Some(addr));
        }

        let p = self.store.piece(piece);
        trace!(peer = %addr, %piece, endgame, "assigned piece");
        Some(Assignment {
            piece,
            length: p.length,
            hash: p.hash,
            endgame,
        })
    }

    // Nobody downloads `piece` anymore, unless someone besides `from` still is.
    fn release_piece_locked(&self, g: &mut SwarmLocked, piece: ValidPieceIndex, from: PeerHandle) {
        if g.bitsets.is_complete(piece) || g.peers.is_assigned_elsewhere(piece, from) {
            return;
        }
        trace!(%piece, "releasing piece");
        g.bitsets.release(piece);
        if g.endgame_piece == Some(piece) {
            g.endgame_piece = None;
        }
        g.peers.refresh_idle(Some(from));
    }

    fn piece_failed_locked(&self, g: &mut SwarmLocked, addr: PeerHandle, piece: ValidPieceIndex) {
        if let Some(rec) = g.peers.get_mut(addr) {
            rec.counters.hash_failures += 1;
            if let Some(live) = rec.live.as_mut() {
                if live.assigned == Some(piece) {
                    live.assigned = None;
                }
            }
        }
        self.release_piece_locked(g, piece, addr);
    }

    /// A connection finished downloading `piece`. `data` is None if it
    /// failed the hash check.
    pub fn piece_completed(&self, addr: PeerHandle, piece: ValidPieceIndex, data: Option<Vec<u8>>) {
        let Some(data) = data else {
            warn!(peer = %addr, %piece, "piece failed hash check");
            let mut g = self.locked.lock();
            self.piece_failed_locked(&mut g, addr, piece);
            return;
        };

        {
            let mut g = self.locked.lock();
            if g.bitsets.is_complete(piece) {
                debug!(peer = %addr, %piece, "piece was already completed elsewhere");
                if let Some(live) = g.peers.live_mut(addr) {
                    if live.assigned == Some(piece) {
                        live.assigned = None;
                    }
                }
                return;
            }
        }

        if let Err(e) = self.store.write_piece(piece, &data) {
            warn!(%piece, "error writing piece: {e:#}");
            let mut g = self.locked.lock();
            self.piece_failed_locked(&mut g, addr, piece);
            return;
        }

        let update = {
            let mut g = self.locked.lock();
            let g = &mut *g;
            if !g.bitsets.mark_complete(piece) {
                debug!(%piece, "piece was completed concurrently");
                return;
            }
            let len = data.len() as u64;
            g.left_bytes = g.left_bytes.saturating_sub(len);
            self.downloaded.fetch_add(len, Ordering::Relaxed);
            if g.endgame_piece == Some(piece) {
                g.endgame_piece = None;
            }
            if let Some(rec) = g.peers.get_mut(addr) {
                rec.counters.pieces_downloaded += 1;
            }

            for (other, live) in g.peers.iter_live_mut() {
                if live.assigned == Some(piece) {
                    live.assigned = None;
                    if other != addr {
                        debug!(peer = %other, %piece, "piece finished elsewhere, cancelling");
                        live.notify(PeerEvent::CancelPieceEndgame(piece));
                    }
                }
                live.send(Message::Have(piece.get()));
                live.update_interest(g.bitsets.complete());
            }
            if self.is_endgame_locked(&g.bitsets) {
                g.peers.refresh_idle(Some(addr));
            }

            let completed = g.bitsets.completed_count();
            let total = g.bitsets.total();
            info!(
                %piece,
                progress = format!("{:.2}%", completed as f64 * 100. / total as f64),
                "piece completed"
            );

            let mut event = None;
            if g.bitsets.all_complete() && !g.completed_reported {
                info!("download complete");
                g.completed_reported = true;
                event = Some(TrackerEvent::Completed);
            }
            self.progress_locked(g, event)
        };
        self.tracker.on_update(update);
    }

    pub fn peer_availability(&self, addr: PeerHandle, update: Availability) -> crate::Result<()> {
        let lengths = self.store.lengths();
        let mut g = self.locked.lock();
        let g = &mut *g;
        let live = g.peers.live_mut(addr).ok_or(Error::BugPeerNotFound)?;
        match update {
            Availability::Bitfield(bytes) => {
                if bytes.len() != lengths.piece_bitfield_bytes() {
                    return Err(Error::ProtocolViolation("bitfield has unexpected size"));
                }
                let mut bf = BF::from_vec(bytes.to_vec());
                bf.truncate(lengths.total_pieces() as usize);
                g.availability.remove_bitfield(&live.bitfield);
                g.availability.add_bitfield(&bf);
                trace!(peer = %addr, have = bf.count_ones(), "bitfield");
                live.bitfield = bf;
            }
            Availability::Have(index) => {
                let piece = lengths
                    .validate_piece_index(index)
                    .ok_or(Error::ProtocolViolation("have index out of range"))?;
                if !live.bitfield.replace(piece.get() as usize, true) {
                    g.availability.add_piece(piece);
                }
            }
        }
        live.update_interest(g.bitsets.complete());
        Ok(())
    }

    /// Queue an upload. Peers may only ask for pieces we have.
    pub fn peer_request(&self, addr: PeerHandle, request: Request) -> crate::Result<()> {
        let (piece, _) = self
            .store
            .lengths()
            .validate_request(
                request.index,
                request.begin,
                request.length,
                self.options.max_request_length,
            )
            .ok_or(Error::ProtocolViolation("invalid request"))?;

        let mut g = self.locked.lock();
        let g = &mut *g;
        if !g.bitsets.is_complete(piece) {
            return Err(Error::RequestedMissingPiece(request.index));
        }
        g.bitsets.mark_sent(piece);
        let rec = g.peers.get_mut(addr).ok_or(Error::BugPeerNotFound)?;
        let live = rec.live.as_mut().ok_or(Error::BugPeerNotFound)?;
        if live.mark_sent(piece) {
            rec.counters.pieces_sent += 1;
        }
        if live
            .channels
            .tx
            .send(WriterRequest::UploadBlock(request))
            .is_err()
        {
            trace!(peer = %addr, "writer is gone, not uploading");
        }
        Ok(())
    }

    /// Admission at handshake time. On success the connection is live.
    pub fn register_connection(
        &self,
        addr: PeerHandle,
        peer_id: Id20,
        channels: PeerChannels,
    ) -> crate::Result<()> {
        if peer_id == self.peer_id {
            return Err(Error::ConnectingToOurselves);
        }
        let mut g = self.locked.lock();
        let total_pieces = g.bitsets.total();
        g.peers.set_live(addr, peer_id, channels, total_pieces)?;
        debug!(
            peer = %addr,
            client = ?try_decode_azureus_style(&peer_id),
            "peer is live"
        );
        Ok(())
    }

    /// The remote changed its interest. A newly interested peer gets a regular
    /// slot right away if one is free, and is choked otherwise. The next choke
    /// pass reorders slots by rate.
    pub fn peer_interest_changed(&self, addr: PeerHandle, interested: bool) {
        let mut g = self.locked.lock();
        let g = &mut *g;
        let optimistic = g.choker.optimistic();
        let slots_used = g
            .peers
            .iter_live()
            .filter(|(a, l)| {
                *a != addr && Some(*a) != optimistic && l.peer_interested && !l.am_choking
            })
            .count();
        let Some(live) = g.peers.live_mut(addr) else {
            return;
        };
        live.peer_interested = interested;
        if !interested || optimistic == Some(addr) {
            return;
        }
        live.set_choking(slots_used >= self.options.max_unchoked);
    }

    /// A connection ended. Called exactly once per connection.
    pub fn connection_ended(&self, addr: PeerHandle, reason: TerminationReason) {
        let mut g = self.locked.lock();
        let g = &mut *g;
        let Some(rec) = g.peers.remove(addr) else {
            debug!(peer = %addr, %reason, "bug: ended peer wasn't registered");
            return;
        };
        debug!(peer = %addr, %reason, state = rec.state_name(), "peer disconnected");
        if let Some(live) = rec.live {
            g.availability.remove_bitfield(&live.bitfield);
            if let Some(piece) = live.assigned {
                self.release_piece_locked(g, piece, addr);
            }
        }
    }

    fn maybe_run_choke_cycle(&self) {
        let mut g = self.locked.lock();
        if g
            .last_choke
            .is_some_and(|t| t.elapsed() < self.options.choke_interval)
        {
            return;
        }
        self.choke_cycle_locked(&mut g);
    }

    pub fn run_choke_cycle(&self) {
        let mut g = self.locked.lock();
        self.choke_cycle_locked(&mut g);
    }

    fn choke_cycle_locked(&self, g: &mut SwarmLocked) {
        let seeding = g.bitsets.all_complete();
        let candidates: Vec<ChokeCandidate> = g
            .peers
            .iter_live()
            .map(|(addr, live)| ChokeCandidate {
                addr,
                interested: live.peer_interested,
                am_choking: live.am_choking,
                rate: if seeding {
                    live.uploaded_since_choke
                } else {
                    live.downloaded_since_choke
                },
            })
            .collect();
        let plan = g.choker.plan(
            &candidates,
            self.options.max_unchoked,
            self.options.optimistic_unchoke_every,
            &mut rand::rng(),
        );
        trace!(
            peers = candidates.len(),
            unchoke = plan.unchoke.len(),
            choke = plan.choke.len(),
            seeding,
            "choke pass"
        );
        for addr in plan.unchoke {
            if let Some(live) = g.peers.live_mut(addr) {
                live.set_choking(false);
            }
        }
        for addr in plan.choke {
            if let Some(live) = g.peers.live_mut(addr) {
                live.set_choking(true);
            }
        }
        for (_, live) in g.peers.iter_live_mut() {
            live.downloaded_since_choke = 0;
            live.uploaded_since_choke = 0;
        }
        g.last_choke = Some(Instant::now());
    }

    /// Unchoke a random choked and interested peer right now. It keeps the
    /// optimistic slot until the next rotation.
    pub fn optimistic_unchoke(&self) -> Option<PeerHandle> {
        let mut g = self.locked.lock();
        let g = &mut *g;
        let choked: Vec<PeerHandle> = g
            .peers
            .iter_live()
            .filter(|(_, l)| l.am_choking && l.peer_interested)
            .map(|(a, _)| a)
            .collect();
        let chosen = g.choker.rotate_optimistic(&choked, &mut rand::rng())?;
        g.peers.live_mut(chosen)?.set_choking(false);
        Some(chosen)
    }

    fn new_connection(self: &Arc<Self>, addr: PeerHandle) -> PeerConnection<PeerHandler> {
        PeerConnection::new(
            addr,
            self.info_hash,
            self.peer_id,
            PeerHandler {
                swarm: self.clone(),
                addr,
            },
            self.options.peer_opts,
            SessionOptions::from(&self.options),
        )
    }

    fn spawn_connection(
        &self,
        addr: PeerHandle,
        fut: impl Future<Output = TerminationReason> + Send + 'static,
    ) {
        spawn_with_cancel(
            error_span!("peer", peer = %addr),
            self.cancellation_token.clone(),
            async move {
                let reason = fut.await;
                trace!(%reason, "connection finished");
                Ok(())
            },
        );
    }

    /// Dial the peers we don't know yet. Returns how many were dialed.
    pub fn update_peer_list(self: &Arc<Self>, peers: impl IntoIterator<Item = PeerInfo>) -> usize {
        if self.cancellation_token.is_cancelled() {
            return 0;
        }
        let mut to_dial = Vec::new();
        {
            let mut g = self.locked.lock();
            for p in peers {
                match g.peers.admit(
                    p.addr,
                    p.peer_id,
                    Some(p.addr),
                    self.peer_id,
                    self.options.max_connections,
                ) {
                    Ok(()) => {
                        g.peers
                            .insert_connecting(p.addr, Direction::Outbound, p.peer_id);
                        to_dial.push(p.addr);
                    }
                    Err(e) => trace!(peer = %p.addr, "not connecting: {e:#}"),
                }
            }
        }

        for addr in to_dial.iter().copied() {
            let conn = self.new_connection(addr);
            self.spawn_connection(addr, async move { conn.manage_outgoing().await });
        }
        to_dial.len()
    }

    /// Take over an accepted socket. The remote handshakes first.
    pub fn accept_inbound<S>(self: &Arc<Self>, stream: S, addr: SocketAddr) -> crate::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        {
            let mut g = self.locked.lock();
            g.peers.admit(
                addr,
                None,
                Some(addr),
                self.peer_id,
                self.options.max_connections,
            )?;
            g.peers.insert_connecting(addr, Direction::Inbound, None);
        }
        let conn = self.new_connection(addr);
        self.spawn_connection(addr, async move { conn.manage_incoming(stream).await });
        Ok(())
    }

    /// Accept connections until stopped. Returns the address we listen on.
    pub fn listen(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<SocketAddr> {
        let local_addr = listener
            .local_addr()
            .context("error getting listener address")?;
        spawn_with_cancel(
            error_span!("listener", addr = %local_addr),
            self.cancellation_token.clone(),
            self.clone().task_listen(listener),
        );
        info!(addr = %local_addr, "listening");
        Ok(local_addr)
    }

    async fn task_listen(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .context("error accepting connection")?;
            if let Err(e) = self.accept_inbound(stream, addr) {
                debug!(peer = %addr, "rejecting incoming connection: {e:#}");
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        let g = self.locked.lock();
        let completed = g.bitsets.completed_count() as u32;
        let total = g.bitsets.total() as u32;
        StatsSnapshot {
            downloaded_bytes: self.downloaded.load(Ordering::Relaxed),
            uploaded_bytes: self.uploaded.load(Ordering::Relaxed),
            left_bytes: g.left_bytes,
            completed_pieces: completed,
            total_pieces: total,
            progress_percent: completed as f64 * 100. / total as f64,
            download_speed_bps: self.down_speed.bps(),
            upload_speed_bps: self.up_speed.bps(),
            time_remaining: self.down_speed.time_remaining(),
            connected_peers: g.peers.live_count(),
            endgame: self.is_endgame_locked(&g.bitsets),
        }
    }

    pub fn peer_stats(&self) -> PeerStatsSnapshot {
        let g = self.locked.lock();
        let elapsed = g
            .last_choke
            .map(|t| t.elapsed().as_secs_f64())
            .filter(|e| *e > 0.);
        let rate = |bytes: u64| elapsed.map(|e| (bytes as f64 / e) as u64).unwrap_or(0);
        let peers = g
            .peers
            .iter()
            .map(|rec| {
                let live = rec.live.as_ref();
                let stats = PeerStats {
                    state: rec.state_name(),
                    peer_id: rec.peer_id.map(|id| id.as_string()),
                    counters: rec.counters,
                    download_rate_bps: live.map(|l| rate(l.downloaded_since_choke)).unwrap_or(0),
                    upload_rate_bps: live.map(|l| rate(l.uploaded_since_choke)).unwrap_or(0),
                    am_choking: live.is_none_or(|l| l.am_choking),
                    am_interested: live.is_some_and(|l| l.am_interested),
                    peer_choking: live.is_none_or(|l| l.peer_choking),
                    peer_interested: live.is_some_and(|l| l.peer_interested),
                };
                (rec.addr.to_string(), stats)
            })
            .collect();
        PeerStatsSnapshot { peers }
    }

    fn with_record<R>(&self, addr: PeerHandle, f: impl FnOnce(&mut PeerRecord) -> R) -> Option<R> {
        self.locked.lock().peers.get_mut(addr).map(f)
    }

    fn with_live<R>(&self, addr: PeerHandle, f: impl FnOnce(&mut LivePeer) -> R) -> Option<R> {
        self.locked.lock().peers.live_mut(addr).map(f)
    }
}

/// Connects one connection to the swarm.
pub(crate) struct PeerHandler {
    swarm: Arc<SwarmCoordinator>,
    addr: PeerHandle,
}

impl PeerConnectionHandler for PeerHandler {
    fn on_connected(&self, connection_time: Duration) {
        trace!(?connection_time, "connected");
    }

    fn on_handshake(&self, handshake: &Handshake, channels: PeerChannels) -> crate::Result<()> {
        self.swarm
            .register_connection(self.addr, handshake.peer_id, channels)
    }

    fn serialize_bitfield_message_to_buf(&self, buf: &mut Vec<u8>) -> crate::Result<usize> {
        let bits = self.swarm.locked.lock().bitsets.complete_as_bytes();
        let msg = Message::Bitfield(Bytes::from(bits));
        let len = msg.serialize(buf)?;
        trace!("sending: {:?}, length={}", &msg, len);
        Ok(len)
    }

    fn on_bitfield(&self, bitfield: Bytes) -> crate::Result<()> {
        self.swarm
            .peer_availability(self.addr, Availability::Bitfield(bitfield))
    }

    fn on_have(&self, index: u32) -> crate::Result<()> {
        self.swarm
            .peer_availability(self.addr, Availability::Have(index))
    }

    fn on_remote_choking(&self, choking: bool) {
        self.swarm.with_live(self.addr, |l| l.peer_choking = choking);
    }

    fn on_remote_interested(&self, interested: bool) {
        trace!(interested, "remote interest changed");
        self.swarm.peer_interest_changed(self.addr, interested);
    }

    fn is_choking_remote(&self) -> bool {
        self.swarm
            .with_live(self.addr, |l| l.am_choking)
            .unwrap_or(true)
    }

    fn on_peer_request(&self, request: Request) -> crate::Result<()> {
        self.swarm.peer_request(self.addr, request)
    }

    fn on_ready(&self) -> Option<Assignment> {
        self.swarm.peer_ready(self.addr)
    }

    fn on_piece_downloaded(&self, piece: ValidPieceIndex, data: Option<Vec<u8>>) {
        self.swarm.piece_completed(self.addr, piece, data)
    }

    fn on_downloaded_bytes(&self, bytes: u32) {
        self.swarm.with_record(self.addr, |rec| {
            rec.counters.downloaded_bytes += bytes as u64;
            if let Some(live) = rec.live.as_mut() {
                live.downloaded_since_choke += bytes as u64;
            }
        });
    }

    fn on_uploaded_bytes(&self, bytes: u32) {
        self.swarm
            .uploaded
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.swarm.with_record(self.addr, |rec| {
            rec.counters.uploaded_bytes += bytes as u64;
            if let Some(live) = rec.live.as_mut() {
                live.uploaded_since_choke += bytes as u64;
            }
        });
    }

    fn read_block(&self, request: &Request, buf: &mut [u8]) -> anyhow::Result<()> {
        let piece = self
            .swarm
            .store
            .lengths()
            .validate_piece_index(request.index)
            .context("bug: request for invalid piece was queued")?;
        self.swarm.store.read_block(piece, request.begin, buf)
    }

    fn on_ended(&self, reason: TerminationReason) {
        self.swarm.connection_ended(self.addr, reason);
    }
}
