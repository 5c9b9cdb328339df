//! The per-connection session object.

use super::ancillary::{AncillaryState, Detached, GumpHandle, HuePickerHandle, MenuHandle, TradeHandle};
use super::{ConnectionId, NetContext};
use parking_lot::Mutex;
use shard_protocol::messages::OutgoingMessage;
use shard_protocol::{
    ByteQueue, ClientVersion, CompressionLevel, Gram, Packet, PacketError, ProtocolFeatures,
    SendQueue, StaticPacket,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, warn};

/// World object serial number.
pub type Serial = u32;

const CONNECTING: u8 = 0;
const RUNNING: u8 = 1;
const DISPOSING: u8 = 2;
const DISPOSED: u8 = 3;

/// Lifecycle of a connection. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Accepted, socket tasks not started yet
    Connecting,
    /// Receiving and sending
    Running,
    /// Disposed, waiting for the deferred disposal pass
    Disposing,
    /// Detached from game logic and removed from the server
    Disposed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            CONNECTING => ConnectionState::Connecting,
            RUNNING => ConnectionState::Running,
            DISPOSING => ConnectionState::Disposing,
            _ => ConnectionState::Disposed,
        }
    }
}

/// One client connection.
///
/// `NetState` is shared between the receive task, the send task, the message
/// pump and game logic. Everything mutable sits behind an atomic or a short
/// lock; no lock is ever held across socket I/O or a packet handler.
///
/// # Disposal
///
/// [`NetState::dispose`] claims the connection with a single atomic
/// transition, so any number of concurrent callers (the sweep, a failed
/// write, a handler) agree on exactly one winner. The winner signals both
/// socket tasks and queues the connection for the deferred disposal pass run
/// by the pump.
pub struct NetState {
    id: ConnectionId,
    address: SocketAddr,
    this: Weak<NetState>,
    ctx: Arc<NetContext>,
    state: AtomicU8,

    incoming: Mutex<ByteQueue>,
    outgoing: Mutex<SendQueue>,
    writer: mpsc::UnboundedSender<Gram>,
    shutdown: watch::Sender<bool>,
    /// Drain the send queue before closing
    linger: AtomicBool,
    /// Already sitting in the pump's received queue
    queued: AtomicBool,

    seeded: AtomicBool,
    seed: AtomicU32,
    compression: AtomicBool,
    sequence: AtomicU8,
    features: AtomicU32,
    version: Mutex<Option<ClientVersion>>,

    connected_at: Instant,
    last_activity: Mutex<Instant>,

    avatar: Mutex<Option<Serial>>,
    account: Mutex<Option<String>>,
    ancillary: Mutex<AncillaryState>,
}

impl NetState {
    /// Creates a connection in the `Connecting` state.
    ///
    /// # Returns
    ///
    /// The connection and the receiving end of its gram channel, which the
    /// send task drains.
    pub(crate) fn new(
        id: ConnectionId,
        address: SocketAddr,
        ctx: Arc<NetContext>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Gram>) {
        let (writer, grams) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let incoming = ByteQueue::with_capacity(ctx.byte_queue_capacity);
        let outgoing = SendQueue::new(ctx.pools.coalesced.clone(), ctx.pending_cap);
        let seeded = !ctx.expect_seed;
        let now = Instant::now();

        let ns = Arc::new_cyclic(|this| Self {
            id,
            address,
            this: this.clone(),
            ctx,
            state: AtomicU8::new(CONNECTING),
            incoming: Mutex::new(incoming),
            outgoing: Mutex::new(outgoing),
            writer,
            shutdown,
            linger: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            seeded: AtomicBool::new(seeded),
            seed: AtomicU32::new(0),
            compression: AtomicBool::new(false),
            sequence: AtomicU8::new(0),
            features: AtomicU32::new(0),
            version: Mutex::new(None),
            connected_at: now,
            last_activity: Mutex::new(now),
            avatar: Mutex::new(None),
            account: Mutex::new(None),
            ancillary: Mutex::new(AncillaryState::default()),
        });
        (ns, grams)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Whether dispose has been called.
    pub fn is_disposing(&self) -> bool {
        self.state.load(Ordering::Acquire) >= DISPOSING
    }

    pub(crate) fn set_running(&self) -> bool {
        self.state
            .compare_exchange(CONNECTING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_disposed(&self) {
        self.state.store(DISPOSED, Ordering::Release);
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Refreshes the inactivity window.
    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::Acquire)
    }

    pub fn seed(&self) -> u32 {
        self.seed.load(Ordering::Acquire)
    }

    pub fn set_seed(&self, seed: u32) {
        self.seed.store(seed, Ordering::Release);
        self.seeded.store(true, Ordering::Release);
    }

    pub(crate) fn mark_seeded(&self) {
        self.seeded.store(true, Ordering::Release);
    }

    pub fn version(&self) -> Option<ClientVersion> {
        *self.version.lock()
    }

    /// Records the client version and derives the feature set from it.
    pub fn set_version(&self, version: ClientVersion) {
        *self.version.lock() = Some(version);
        self.features
            .store(version.features().bits(), Ordering::Release);
    }

    pub fn features(&self) -> ProtocolFeatures {
        ProtocolFeatures::from_bits_truncate(self.features.load(Ordering::Acquire))
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression.load(Ordering::Acquire)
    }

    pub fn set_compression(&self, enabled: bool) {
        self.compression.store(enabled, Ordering::Release);
    }

    fn compression_level(&self) -> Option<CompressionLevel> {
        self.compression_enabled()
            .then_some(self.ctx.compression_level)
    }

    /// Returns the current movement sequence and advances it, wrapping at 256.
    pub fn next_sequence(&self) -> u8 {
        self.sequence.fetch_add(1, Ordering::AcqRel)
    }

    pub fn sequence(&self) -> u8 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn reset_sequence(&self) {
        self.sequence.store(0, Ordering::Release);
    }

    pub fn avatar(&self) -> Option<Serial> {
        *self.avatar.lock()
    }

    /// Attaches the connection to an avatar, putting it in game.
    pub fn attach_avatar(&self, serial: Serial) {
        *self.avatar.lock() = Some(serial);
    }

    pub fn detach_avatar(&self) -> Option<Serial> {
        self.avatar.lock().take()
    }

    /// Whether packets flagged in-game only are accepted.
    pub fn in_game(&self) -> bool {
        self.avatar.lock().is_some()
    }

    pub fn account(&self) -> Option<String> {
        self.account.lock().clone()
    }

    pub fn set_account(&self, account: impl Into<String>) {
        *self.account.lock() = Some(account.into());
    }

    /// Bytes received but not yet decoded.
    pub fn incoming_len(&self) -> usize {
        self.incoming.lock().len()
    }

    /// Bytes queued for sending, as counted against the pending cap.
    pub fn pending_outbound(&self) -> usize {
        self.outgoing.lock().pending_bytes()
    }

    pub(crate) fn with_incoming<R>(&self, f: impl FnOnce(&mut ByteQueue) -> R) -> R {
        f(&mut self.incoming.lock())
    }

    /// Appends freshly read bytes and hands the connection to the pump.
    pub(crate) fn on_received(self: &Arc<Self>, data: &[u8]) {
        self.touch();
        self.incoming.lock().enqueue(data);
        if !self.queued.swap(true, Ordering::AcqRel) {
            self.ctx.received.push(self.clone());
        }
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }

    /// Queues raw, already framed bytes.
    ///
    /// A write that would exceed the pending cap disposes the connection.
    pub fn send_bytes(&self, data: &[u8]) {
        if data.is_empty() || !self.is_running() {
            return;
        }

        let result = self.outgoing.lock().enqueue(data);
        match result {
            Ok(Some(gram)) => {
                if self.writer.send(gram).is_err() {
                    self.dispose(false);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("💥 Client: {}: {}, disconnecting", self, e);
                self.dispose(false);
            }
        }
    }

    /// Compiles and queues `packet`, then releases it according to its
    /// lifetime.
    pub fn send(&self, packet: &mut Packet) {
        if self.is_running() {
            let id = packet.id();
            match packet.compile(self.compression_level(), &self.ctx.pools.compiled) {
                Ok(bytes) => self.send_bytes(bytes),
                Err(PacketError::RedundantCompile { .. }) => {}
                Err(e) => {
                    error!("❌ Client: {}: Failed to compile packet 0x{:02X}: {}", self, id, e);
                    self.dispose(false);
                }
            }
        }
        packet.on_send();
    }

    /// Queues the shared bytes of a static packet.
    pub fn send_static(&self, packet: &StaticPacket) {
        if !self.is_running() {
            return;
        }
        match packet.bytes(self.compression_level()) {
            Ok(bytes) => self.send_bytes(bytes),
            Err(e) => {
                error!(
                    "❌ Client: {}: Failed to compress static packet 0x{:02X}: {}",
                    self,
                    packet.id(),
                    e
                );
                self.dispose(false);
            }
        }
    }

    /// Builds and sends a one-off message.
    pub fn send_message<M: OutgoingMessage>(&self, message: &M) {
        let mut packet = message.to_packet();
        self.send(&mut packet);
    }

    fn promote_partial(&self) -> bool {
        let gram = self.outgoing.lock().check_flush_ready();
        match gram {
            Some(gram) => self.writer.send(gram).is_ok(),
            None => false,
        }
    }

    /// Hands a partially filled gram to the send task when nothing else is
    /// being written.
    ///
    /// Returns whether a gram was handed over.
    pub fn flush(&self) -> bool {
        self.is_running() && self.promote_partial()
    }

    /// Starts tearing the connection down.
    ///
    /// Non-blocking and idempotent. Only the first call does anything and
    /// returns `true`.
    ///
    /// # Arguments
    ///
    /// * `flush` - Drain what is already queued before closing the socket,
    ///   bounded by the configured flush timeout
    pub fn dispose(&self, flush: bool) -> bool {
        let claimed = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state == CONNECTING || state == RUNNING).then_some(DISPOSING)
            })
            .is_ok();
        if !claimed {
            return false;
        }

        if flush {
            self.linger.store(true, Ordering::Release);
            self.promote_partial();
        } else {
            self.outgoing.lock().clear();
        }
        self.incoming.lock().clear();
        self.shutdown.send_replace(true);

        if let Some(this) = self.this.upgrade() {
            self.ctx.disposed.push(this);
        }
        debug!("🔌 Client: {}: Disposing (flush: {})", self, flush);
        true
    }

    pub(crate) fn lingers(&self) -> bool {
        self.linger.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn ctx(&self) -> &Arc<NetContext> {
        &self.ctx
    }

    /// Releases a written gram and returns the next one to write, promoting
    /// the partial gram when nothing full is waiting.
    pub(crate) fn next_gram(&self, sent: Gram) -> Option<Gram> {
        let mut outgoing = self.outgoing.lock();
        outgoing.dequeue(sent).or_else(|| outgoing.check_flush_ready())
    }

    pub(crate) fn take_flush_ready(&self) -> Option<Gram> {
        self.outgoing.lock().check_flush_ready()
    }

    /// Disposes the connection when it has been idle longer than the
    /// inactivity window.
    ///
    /// Returns `false` when the connection is no longer alive.
    pub fn check_alive(&self, now: Instant) -> bool {
        if !self.is_running() {
            return false;
        }
        let idle = now.saturating_duration_since(self.last_activity());
        if idle <= self.ctx.inactivity_timeout {
            return true;
        }
        warn!(
            "⏳ Client: {}: Disconnecting due to inactivity ({}s idle)",
            self,
            idle.as_secs()
        );
        self.dispose(false);
        false
    }

    fn add_capped<T>(&self, item: T, kind: &str, cap: usize, list: fn(&mut AncillaryState) -> &mut Vec<T>) -> bool {
        let exceeded = {
            let mut state = self.ancillary.lock();
            let items = list(&mut state);
            if items.len() >= cap {
                true
            } else {
                items.push(item);
                false
            }
        };
        if exceeded {
            warn!("🚫 Client: {}: Exceeded {} cap of {}, disconnecting", self, kind, cap);
            self.dispose(false);
        }
        !exceeded
    }

    /// Tracks an open gump. Exceeding the cap disposes the connection.
    pub fn add_gump(&self, gump: GumpHandle) -> bool {
        self.add_capped(gump, "gump", self.ctx.limits.gumps, |s| &mut s.gumps)
    }

    pub fn remove_gump(&self, serial: Serial, type_id: u32) -> Option<GumpHandle> {
        let mut state = self.ancillary.lock();
        let index = state
            .gumps
            .iter()
            .position(|g| g.serial == serial && g.type_id == type_id)?;
        Some(state.gumps.remove(index))
    }

    pub fn gumps(&self) -> Vec<GumpHandle> {
        self.ancillary.lock().gumps.clone()
    }

    pub fn add_menu(&self, menu: MenuHandle) -> bool {
        self.add_capped(menu, "menu", self.ctx.limits.menus, |s| &mut s.menus)
    }

    pub fn remove_menu(&self, serial: Serial) -> Option<MenuHandle> {
        let mut state = self.ancillary.lock();
        let index = state.menus.iter().position(|m| m.serial == serial)?;
        Some(state.menus.remove(index))
    }

    pub fn add_hue_picker(&self, picker: HuePickerHandle) -> bool {
        self.add_capped(picker, "hue picker", self.ctx.limits.hue_pickers, |s| &mut s.hue_pickers)
    }

    pub fn remove_hue_picker(&self, serial: Serial) -> Option<HuePickerHandle> {
        let mut state = self.ancillary.lock();
        let index = state.hue_pickers.iter().position(|h| h.serial == serial)?;
        Some(state.hue_pickers.remove(index))
    }

    pub fn add_trade(&self, trade: TradeHandle) -> bool {
        self.add_capped(trade, "trade", self.ctx.limits.trades, |s| &mut s.trades)
    }

    pub fn remove_trade(&self, container: Serial) -> Option<TradeHandle> {
        let mut state = self.ancillary.lock();
        let index = state.trades.iter().position(|t| t.container == container)?;
        Some(state.trades.remove(index))
    }

    /// Takes everything game logic must clean up.
    pub(crate) fn detach(&self) -> Detached {
        let state = std::mem::take(&mut *self.ancillary.lock());
        Detached::new(self.detach_avatar(), self.account(), state)
    }
}

impl fmt::Display for NetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl fmt::Debug for NetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetState")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("seeded", &self.is_seeded())
            .field("version", &self.version())
            .finish()
    }
}
