use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use super::bitfield::Bitfield;
use super::capability::{Capabilities, Capability};
use super::error::PeerError;
use super::message::{Handshake, Message};
use super::peer_id::PeerId;
use super::session::PeerSession;
use super::transport::{PeerReader, PeerTransport, PeerWriter};
use crate::constants::{KEEP_ALIVE_INTERVAL, MAX_REQUEST_LENGTH};
use crate::storage::{PieceDescriptor, StoreError};
use crate::swarm::PoolMember;
use crate::task::TorrentContext;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We connected out and download from the peer.
    Launcher,
    /// The peer connected in and downloads from us.
    Uploader,
}

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Established,
    Closed,
}

/// Exchanges handshakes in the order the role requires and checks the
/// remote's info hash.
pub async fn handshake<S>(
    transport: &mut PeerTransport<S>,
    info_hash: [u8; 20],
    peer_id: PeerId,
    role: ConnectionRole,
) -> Result<Handshake, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::new(info_hash, peer_id);
    let theirs = match role {
        ConnectionRole::Launcher => {
            transport.send_handshake(&ours).await?;
            transport.receive_handshake().await?
        }
        ConnectionRole::Uploader => {
            let theirs = transport.receive_handshake().await?;
            if theirs.info_hash != info_hash {
                return Err(PeerError::InfoHashMismatch);
            }
            transport.send_handshake(&ours).await?;
            theirs
        }
    };

    if theirs.info_hash != info_hash {
        return Err(PeerError::InfoHashMismatch);
    }
    Ok(theirs)
}

/// One live session with a remote peer.
///
/// Incoming messages drive the choke/interest flags and the remote's
/// availability. On a launcher connection, a download loop runs as its own
/// task once we may download: it picks a piece from the torrent's
/// [`StoreGroup`](crate::storage::StoreGroup), pipelines slice requests,
/// waits for the slices and verifies the piece before storing it.
///
/// Every wait is bounded and also ends when the connection is released, so
/// a stalled peer never holds a piece for longer than the configured
/// timeouts.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use swarmcore::peer::{PeerConnection, PeerSession};
/// use swarmcore::TorrentContext;
///
/// # async fn example(ctx: TorrentContext, session: Arc<PeerSession>) -> Result<(), Box<dyn std::error::Error>> {
/// let conn = PeerConnection::connect(ctx, session).await?;
/// assert!(conn.is_available());
/// conn.release().await;
/// # Ok(())
/// # }
/// ```
pub struct PeerConnection {
    ctx: TorrentContext,
    session: Arc<PeerSession>,
    role: ConnectionRole,
    outbound: mpsc::UnboundedSender<Message>,
    state: Mutex<ConnectionState>,
    available: AtomicBool,

    // Scoring
    marked: AtomicBool,
    upload_baseline: AtomicU64,
    download_mark: AtomicU64,

    // Download pipeline
    loop_running: AtomicBool,
    restart: AtomicBool,
    current: Mutex<Option<PieceDescriptor>>,
    outstanding: AtomicUsize,
    interrupted: AtomicBool,
    slot_freed: Notify,
    piece_done: Notify,
    loop_done: Notify,
    closed: Notify,
}

impl PeerConnection {
    /// Creates a connection in the `Connecting` state. Messages it sends are
    /// queued on the returned receiver.
    pub fn new(
        ctx: TorrentContext,
        session: Arc<PeerSession>,
        role: ConnectionRole,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let upload_baseline = session.statistics().uploaded();
        let conn = Arc::new(Self {
            ctx,
            session,
            role,
            outbound,
            state: Mutex::new(ConnectionState::Connecting),
            available: AtomicBool::new(true),
            marked: AtomicBool::new(false),
            upload_baseline: AtomicU64::new(upload_baseline),
            download_mark: AtomicU64::new(0),
            loop_running: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            current: Mutex::new(None),
            outstanding: AtomicUsize::new(0),
            interrupted: AtomicBool::new(false),
            slot_freed: Notify::new(),
            piece_done: Notify::new(),
            loop_done: Notify::new(),
            closed: Notify::new(),
        });
        (conn, rx)
    }

    /// Connects to the session's address, handshakes and starts the
    /// connection. A failure counts against the session.
    pub async fn connect(ctx: TorrentContext, session: Arc<PeerSession>) -> Result<Arc<Self>, PeerError> {
        let (conn, rx) = Self::new(ctx, session, ConnectionRole::Launcher);
        let addr = conn.session.addr();

        let opened = async {
            let mut transport = PeerTransport::connect(addr, conn.ctx.config.connect_timeout).await?;
            conn.set_state(ConnectionState::Handshaking);
            let remote = timeout(
                conn.ctx.config.handshake_timeout,
                handshake(
                    &mut transport,
                    *conn.ctx.info_hash(),
                    conn.ctx.peer_id,
                    ConnectionRole::Launcher,
                ),
            )
            .await
            .map_err(|_| PeerError::Timeout)??;
            Ok::<_, PeerError>((transport, remote))
        }
        .await;

        match opened {
            Ok((transport, remote)) => {
                conn.start(transport, remote, rx);
                Ok(conn)
            }
            Err(e) => {
                conn.available.store(false, Ordering::Release);
                conn.set_state(ConnectionState::Closed);
                let fails = conn.session.fail();
                debug!(peer = %addr, error = %e, fails, "connect failed");
                Err(e)
            }
        }
    }

    /// Starts a connection whose handshake already completed, spawning the
    /// task that pumps messages between the transport and this connection.
    pub fn start<S>(
        self: &Arc<Self>,
        transport: PeerTransport<S>,
        remote: Handshake,
        outbound: mpsc::UnboundedReceiver<Message>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.establish(&remote);
        let (reader, writer) = transport.into_split();
        let have_rx = self.ctx.subscribe_have();
        tokio::spawn(self.clone().run(reader, writer, outbound, have_rx));
    }

    /// Records the remote's handshake and advertises what we have.
    pub fn establish(self: &Arc<Self>, remote: &Handshake) {
        self.session.reset_flags();
        self.session.set_peer_id(remote.peer_id);
        let shared = Capabilities::all().intersect(&remote.capabilities);
        self.session.set_capabilities(shared);
        self.set_state(ConnectionState::Established);
        if self.role == ConnectionRole::Uploader {
            self.session.set_uploading(true);
        }

        let ours = self.ctx.group.pieces();
        if shared.contains(Capability::Fast) && ours.is_complete() {
            self.send(Message::HaveAll);
        } else if shared.contains(Capability::Fast) && ours.is_empty() {
            self.send(Message::HaveNone);
        } else if !ours.is_empty() {
            self.send(Message::Bitfield(ours.to_bytes()));
        }

        if let (true, Some(port)) = (shared.contains(Capability::Dht), self.ctx.config.dht_port) {
            self.send(Message::Port(port));
        }

        if self.role == ConnectionRole::Uploader && self.ctx.task.is_uploadable() {
            self.send(Message::Unchoke);
        }

        debug!(
            peer = %self.session.addr(),
            role = ?self.role,
            client = ?self.session.client_name(),
            capabilities = ?shared,
            "connection established"
        );
    }

    async fn run<R, W>(
        self: Arc<Self>,
        mut reader: PeerReader<R>,
        mut writer: PeerWriter<W>,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        mut have_rx: broadcast::Receiver<u32>,
    ) where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut keep_alive = tokio::time::interval_at(Instant::now() + KEEP_ALIVE_INTERVAL, KEEP_ALIVE_INTERVAL);
        let result: Result<(), PeerError> = loop {
            tokio::select! {
                message = reader.receive_message() => {
                    let handled = match message {
                        Ok(message) => self.handle_message(message).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
                Some(message) = outbound.recv() => {
                    if let Err(e) = writer.send_message(&message).await {
                        break Err(e);
                    }
                }
                have = have_rx.recv() => match have {
                    Ok(index) => {
                        if !self.session.has_piece(index) {
                            self.send(Message::Have { piece: index });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(peer = %self.session.addr(), skipped, "have announcements lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                },
                _ = keep_alive.tick() => {
                    self.send(Message::KeepAlive);
                }
                _ = self.closed.notified() => break Ok(()),
            }
        };

        // Flush what is still queued, typically the final choke.
        while let Ok(message) = outbound.try_recv() {
            if writer.send_message(&message).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
        self.finish(result);
    }

    fn finish(&self, result: Result<(), PeerError>) {
        let was_available = self.available.swap(false, Ordering::AcqRel);
        self.set_state(ConnectionState::Closed);
        self.interrupt();
        self.session.unclaim();

        let addr = self.session.addr();
        match result {
            Err(e) if was_available => {
                let fails = self.session.fail();
                debug!(peer = %addr, error = %e, fails, "connection failed");
            }
            Err(e) => trace!(peer = %addr, error = %e, "connection closed after release"),
            Ok(()) => debug!(peer = %addr, "connection closed"),
        }
    }

    /// Applies one message from the remote.
    pub async fn handle_message(self: &Arc<Self>, message: Message) -> Result<(), PeerError> {
        trace!(peer = %self.session.addr(), id = ?message.id(), "message received");

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.session.set_peer_choking(true);
                // Without the fast extension a choke silently drops our
                // outstanding requests.
                if !self.session.supports(Capability::Fast) {
                    self.interrupt();
                }
            }
            Message::Unchoke => {
                self.session.set_peer_choking(false);
                self.maybe_start_download();
            }
            Message::Interested => {
                self.session.set_peer_interested(true);
                if self.role == ConnectionRole::Launcher
                    && self.session.flags().am_choking
                    && self.ctx.task.is_uploadable()
                {
                    self.send(Message::Unchoke);
                }
            }
            Message::NotInterested => self.session.set_peer_interested(false),
            Message::Have { piece } => {
                self.check_index(piece)?;
                self.session.set_piece(piece);
                self.update_interest(false);
            }
            Message::Bitfield(bytes) => {
                let piece_count = self.ctx.piece_count();
                if bytes.len() != piece_count.div_ceil(8) {
                    return Err(PeerError::InvalidMessage(format!(
                        "bitfield of {} bytes for {} pieces",
                        bytes.len(),
                        piece_count
                    )));
                }
                self.session.merge_pieces(&Bitfield::from_bytes(&bytes, piece_count));
                self.update_interest(true);
            }
            Message::HaveAll => {
                self.session.merge_pieces(&Bitfield::full(self.ctx.piece_count()));
                self.update_interest(true);
            }
            Message::HaveNone => self.update_interest(true),
            Message::Request {
                index,
                begin,
                length,
            } => self.serve(index, begin, length).await?,
            Message::Piece { index, begin, data } => self.receive_slice(index, begin, data).await,
            Message::Cancel { .. } => {}
            Message::Port(port) => self.session.set_dht_port(port),
            Message::Suggest { piece } => {
                self.check_index(piece)?;
                self.session.suggest(piece);
            }
            Message::Reject { index, begin, .. } => {
                if self.current_piece() == Some(index) {
                    debug!(peer = %self.session.addr(), piece = index, begin, "slice rejected");
                    self.interrupt();
                }
            }
            Message::AllowedFast { piece } => {
                self.check_index(piece)?;
                self.session.allow_fast(piece);
                self.maybe_start_download();
            }
            Message::Extended { id, payload } => {
                trace!(peer = %self.session.addr(), id, len = payload.len(), "extended message");
            }
        }
        Ok(())
    }

    fn check_index(&self, index: u32) -> Result<(), PeerError> {
        if index as usize >= self.ctx.piece_count() {
            return Err(PeerError::Protocol(format!("piece index {index} out of range")));
        }
        Ok(())
    }

    /// Sends `interested` or `not_interested` when the decision changes, or
    /// always when `force` is set.
    fn update_interest(self: &Arc<Self>, force: bool) {
        let wanted = self.ctx.group.wants_any(&self.session.available_pieces());
        if force || wanted != self.session.flags().am_interested {
            self.send(if wanted {
                Message::Interested
            } else {
                Message::NotInterested
            });
        }
        if wanted {
            self.maybe_start_download();
        }
    }

    async fn serve(&self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        if length > MAX_REQUEST_LENGTH {
            return Err(PeerError::Protocol(format!("request of {length} bytes")));
        }

        let permitted = self.ctx.task.is_uploadable()
            && (!self.session.flags().am_choking || self.session.is_granted_fast(index));
        let data = if permitted {
            match self.ctx.group.read(index, begin, length).await {
                Ok(data) => data,
                Err(e) => {
                    self.ctx.task.fail(e);
                    None
                }
            }
        } else {
            None
        };

        match data {
            Some(data) => {
                let len = data.len();
                let statistics = self.session.statistics();
                statistics.limit_upload(len).await;
                self.send(Message::Piece { index, begin, data });
                statistics.record_upload(len as u64);
                trace!(peer = %self.session.addr(), piece = index, begin, len, "slice served");
            }
            None if self.session.supports(Capability::Fast) => {
                self.send(Message::Reject {
                    index,
                    begin,
                    length,
                });
            }
            None => trace!(peer = %self.session.addr(), piece = index, begin, "request ignored"),
        }
        Ok(())
    }

    async fn receive_slice(&self, index: u32, begin: u32, data: Bytes) {
        let complete = {
            let mut current = self.current.lock();
            match current.as_mut() {
                Some(descriptor) if descriptor.index() == index => descriptor.put(begin, &data),
                _ => None,
            }
        };
        let Some(complete) = complete else {
            debug!(
                peer = %self.session.addr(),
                piece = index,
                begin,
                len = data.len(),
                "unexpected slice discarded"
            );
            return;
        };

        self.download_mark.fetch_add(data.len() as u64, Ordering::AcqRel);
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.slot_freed.notify_waiters();
        if complete {
            self.piece_done.notify_waiters();
        }
        self.session.statistics().limit_download(data.len()).await;
    }

    /// Spawns the download loop if we may download and it is not running.
    fn maybe_start_download(self: &Arc<Self>) {
        if self.role != ConnectionRole::Launcher
            || !self.is_available()
            || !self.ctx.task.is_downloadable()
        {
            return;
        }
        let flags = self.session.flags();
        let allowed_fast = flags.peer_choking && !self.session.allowed_pieces().is_empty();
        if !flags.can_download() && !allowed_fast {
            return;
        }
        // A loop on its way out may already have decided there is nothing
        // to pick; it checks `restart` after clearing `loop_running`.
        while self.loop_running.swap(true, Ordering::SeqCst) {
            self.restart.store(true, Ordering::SeqCst);
            if self.loop_running.load(Ordering::SeqCst) {
                return;
            }
        }
        self.session.set_downloading(true);
        tokio::spawn(self.clone().download_loop());
    }

    async fn download_loop(self: Arc<Self>) {
        let addr = self.session.addr();
        debug!(peer = %addr, "download started");

        loop {
            if !self.is_available() || !self.ctx.task.is_downloadable() {
                break;
            }
            self.settle_current().await;
            self.restart.store(false, Ordering::SeqCst);
            if self.pick_next().is_none() {
                if !self.session.flags().peer_choking {
                    self.send(Message::NotInterested);
                }
                break;
            }
            self.request_slices().await;
            self.wait_for_piece().await;
        }

        self.settle_current().await;
        self.session.set_downloading(false);
        debug!(peer = %addr, "download stopped");
        self.download_stopped();
    }

    fn download_stopped(self: &Arc<Self>) {
        self.loop_running.store(false, Ordering::SeqCst);
        self.loop_done.notify_waiters();
        if self.restart.swap(false, Ordering::SeqCst) {
            self.maybe_start_download();
        }
    }

    fn pick_next(&self) -> Option<u32> {
        let group = &self.ctx.group;
        let descriptor = if self.session.flags().peer_choking {
            group.pick(&self.session.allowed_pieces())
        } else {
            let suggested = self.session.suggested_pieces();
            let from_suggested = if suggested.is_empty() {
                None
            } else {
                group.pick(&suggested)
            };
            from_suggested.or_else(|| group.pick(&self.session.available_pieces()))
        }?;

        let descriptor = descriptor.with_slice_length(self.ctx.config.slice_length);
        let index = descriptor.index();
        self.outstanding.store(0, Ordering::Release);
        self.interrupted.store(false, Ordering::Release);
        *self.current.lock() = Some(descriptor);
        debug!(peer = %self.session.addr(), piece = index, "piece selected");
        Some(index)
    }

    /// Issues slice requests for the current piece, keeping at most the
    /// configured window outstanding.
    async fn request_slices(&self) {
        let config = &self.ctx.config;
        loop {
            if self.should_stop() {
                return;
            }
            if self.outstanding.load(Ordering::Acquire) >= config.slice_request_size {
                self.wait_until(&self.slot_freed, config.slice_wait, || {
                    self.outstanding.load(Ordering::Acquire) < config.slice_request_size || self.should_stop()
                })
                .await;
                let outstanding = self.outstanding.load(Ordering::Acquire);
                if outstanding >= config.max_wait_slice_requests {
                    debug!(
                        peer = %self.session.addr(),
                        piece = ?self.current_piece(),
                        outstanding,
                        "too many unanswered slices, abandoning piece"
                    );
                    return;
                }
                if self.should_stop() {
                    return;
                }
            }

            let (request, more) = {
                let mut current = self.current.lock();
                let Some(descriptor) = current.as_mut() else {
                    return;
                };
                let Some(request) = descriptor.next_slice() else {
                    return;
                };
                (request, descriptor.has_more_slices())
            };

            self.outstanding.fetch_add(1, Ordering::AcqRel);
            self.send(Message::Request {
                index: request.piece,
                begin: request.offset,
                length: request.length,
            });
            trace!(
                peer = %self.session.addr(),
                piece = request.piece,
                begin = request.offset,
                length = request.length,
                "slice requested"
            );
            if !more {
                return;
            }
        }
    }

    async fn wait_for_piece(&self) {
        let done = self
            .wait_until(&self.piece_done, self.ctx.config.piece_wait, || {
                self.current_complete() || self.interrupted.load(Ordering::Acquire)
            })
            .await;
        if !done {
            warn!(peer = %self.session.addr(), piece = ?self.current_piece(), "piece timed out");
        }
    }

    /// Verifies and stores the current piece, or returns it to the pool.
    async fn settle_current(&self) {
        let Some(descriptor) = self.current.lock().take() else {
            return;
        };
        let index = descriptor.index();
        let group = &self.ctx.group;

        if !descriptor.is_complete() {
            debug!(peer = %self.session.addr(), piece = index, "piece incomplete");
            group.undone(index);
            return;
        }
        if !descriptor.verify() {
            warn!(peer = %self.session.addr(), piece = index, "piece hash mismatch");
            self.session.mark_bad(index);
            group.undone(index);
            return;
        }

        let length = descriptor.length() as u64;
        match group.put(&descriptor.into_piece()).await {
            Ok(()) => {
                self.session.statistics().record_download(length);
                debug!(peer = %self.session.addr(), piece = index, "piece downloaded");
                self.ctx.announce_have(index);
            }
            Err(StoreError::NotOpen) => {
                debug!(peer = %self.session.addr(), piece = index, "store closed, piece dropped");
                group.undone(index);
            }
            Err(e) => {
                group.undone(index);
                self.ctx.task.fail(e);
            }
        }
    }

    /// Waits until `ready` holds, re-checking whenever `notify` fires.
    /// Returns the final value of `ready`.
    async fn wait_until(&self, notify: &Notify, limit: Duration, ready: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if ready() {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return ready();
            }
        }
    }

    fn should_stop(&self) -> bool {
        !self.is_available() || self.interrupted.load(Ordering::Acquire)
    }

    /// Abandons the current piece and wakes every wait.
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.slot_freed.notify_waiters();
        self.piece_done.notify_waiters();
    }

    fn current_complete(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(PieceDescriptor::is_complete)
    }

    /// Queues a message for the remote, tracking our own flags.
    pub fn send(&self, message: Message) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }
        match message {
            Message::Choke => self.session.set_am_choking(true),
            Message::Unchoke => self.session.set_am_choking(false),
            Message::Interested => self.session.set_am_interested(true),
            Message::NotInterested => self.session.set_am_interested(false),
            _ => {}
        }
        self.outbound.send(message).is_ok()
    }

    /// Grants the remote an allowed-fast piece it may request while choked.
    pub fn allow_fast(&self, index: u32) -> bool {
        if !self.session.supports(Capability::Fast) || index as usize >= self.ctx.piece_count() {
            return false;
        }
        self.session.grant_fast(index);
        self.send(Message::AllowedFast { piece: index })
    }

    /// Stops the connection.
    ///
    /// A piece that is still arriving gets up to the release wait to
    /// complete before the remote is choked and the connection closed.
    pub async fn release(self: Arc<Self>) {
        let was_available = self.available.swap(false, Ordering::AcqRel);
        if !was_available && self.state() == ConnectionState::Closed {
            return;
        }
        debug!(peer = %self.session.addr(), "releasing connection");

        // Stop issuing requests; a piece already in flight may still finish.
        self.slot_freed.notify_waiters();
        if self.loop_running.load(Ordering::Acquire) {
            let released = self
                .wait_until(&self.loop_done, self.ctx.config.release_wait, || {
                    !self.loop_running.load(Ordering::Acquire)
                })
                .await;
            if !released {
                debug!(peer = %self.session.addr(), "in-flight piece abandoned on release");
            }
        }

        self.send(Message::Choke);
        self.interrupt();
        self.set_state(ConnectionState::Closed);
        self.closed.notify_one();
        self.session.unclaim();
    }

    pub fn session(&self) -> &Arc<PeerSession> {
        &self.session
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != ConnectionState::Closed {
            *current = state;
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire) && self.state() != ConnectionState::Closed
    }

    /// True while the download loop runs.
    pub fn is_downloading(&self) -> bool {
        self.loop_running.load(Ordering::Acquire)
    }

    pub fn current_piece(&self) -> Option<u32> {
        self.current.lock().as_ref().map(PieceDescriptor::index)
    }

    /// Slice requests sent for the current piece and not yet answered.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Upload bytes since the previous call.
    pub fn upload_mark(&self) -> u64 {
        let now = self.session.statistics().uploaded();
        let before = self.upload_baseline.swap(now, Ordering::AcqRel);
        now.saturating_sub(before)
    }

    /// Download bytes since the previous call.
    pub fn download_mark(&self) -> u64 {
        self.download_mark.swap(0, Ordering::AcqRel)
    }

    /// Returns whether the connection was already scored, marking it.
    pub fn marked(&self) -> bool {
        self.marked.swap(true, Ordering::AcqRel)
    }
}

impl PoolMember for PeerConnection {
    fn session(&self) -> &Arc<PeerSession> {
        &self.session
    }

    fn is_available(&self) -> bool {
        PeerConnection::is_available(self)
    }

    fn marked(&self) -> bool {
        PeerConnection::marked(self)
    }

    fn upload_mark(&self) -> u64 {
        PeerConnection::upload_mark(self)
    }

    fn download_mark(&self) -> u64 {
        PeerConnection::download_mark(self)
    }

    fn release(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(PeerConnection::release(self))
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.session.addr())
            .field("role", &self.role)
            .field("state", &self.state())
            .field("piece", &self.current_piece())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwarmConfig;
    use crate::peer::tests::{
        context, layout_for, next_message, remote_handshake, sample_data, session_for, PIECE,
    };
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_have_while_loop_stops_restarts_download() {
        let temp = TempDir::new().unwrap();
        let data = sample_data(2 * PIECE as usize);
        let layout = layout_for(&[("a.bin", 2 * PIECE)], &data);
        let ctx = context(temp.path(), layout, SwarmConfig::default()).await;
        let (conn, mut rx) = PeerConnection::new(ctx.clone(), session_for(&ctx), ConnectionRole::Launcher);
        conn.establish(&remote_handshake(Capabilities::empty()));
        conn.handle_message(Message::Unchoke).await.unwrap();
        assert!(!conn.is_downloading());

        // a loop that found nothing to pick and has not cleared its flag yet
        conn.loop_running.store(true, Ordering::SeqCst);
        conn.handle_message(Message::Have { piece: 1 }).await.unwrap();
        assert_eq!(next_message(&mut rx).await, Message::Interested);
        assert!(rx.try_recv().is_err());

        conn.download_stopped();
        assert!(conn.is_downloading());
        assert_eq!(
            next_message(&mut rx).await,
            Message::Request {
                index: 1,
                begin: 0,
                length: PIECE as u32,
            }
        );
    }

    #[tokio::test]
    async fn test_stopped_loop_without_news_stays_stopped() {
        let temp = TempDir::new().unwrap();
        let data = sample_data(PIECE as usize);
        let layout = layout_for(&[("a.bin", PIECE)], &data);
        let ctx = context(temp.path(), layout, SwarmConfig::default()).await;
        let (conn, mut rx) = PeerConnection::new(ctx.clone(), session_for(&ctx), ConnectionRole::Launcher);
        conn.establish(&remote_handshake(Capabilities::empty()));

        conn.loop_running.store(true, Ordering::SeqCst);
        conn.download_stopped();
        assert!(!conn.is_downloading());
        assert!(rx.try_recv().is_err());
    }
}
