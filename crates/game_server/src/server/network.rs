//! The live-connection registry and the per-slice work driven by the
//! simulation thread.

use crate::config::ServerConfig;
use crate::connection::{io, ConnectionId, Detached, NetContext, NetState};
use crate::handlers::PacketHandlers;
use crate::pump::MessagePump;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use serde::Serialize;
use shard_protocol::{PoolRegistry, PoolStats};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{info, warn};

/// Sockets accepted by the listener and not yet picked up by a slice.
pub type AcceptedQueue = SegQueue<(TcpStream, SocketAddr)>;

/// Live connections by id.
pub type Instances = DashMap<ConnectionId, Arc<NetState>>;

/// Callbacks into game logic for connection lifecycle events.
///
/// Both run on the thread calling [`NetworkCore::slice`], never from a socket
/// task.
pub trait ConnectionEvents: Send + Sync {
    /// A connection was accepted and its socket tasks started.
    fn on_connected(&self, _ns: &Arc<NetState>) {}

    /// A disposed connection is being removed. `detached` holds the avatar,
    /// account and every open gump, menu, hue picker and trade.
    fn on_disconnected(&self, _ns: &Arc<NetState>, _detached: Detached) {}
}

/// Events sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl ConnectionEvents for NoopEvents {}

/// Snapshot of the network core for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub online: usize,
    pub paused: bool,
    pub received_pending: usize,
    pub disposed_pending: usize,
    pub pools: Vec<PoolStats>,
}

/// Owns every live connection of a server.
///
/// Socket tasks only ever push to lock-free queues; everything that touches
/// game state (creating connections, running handlers, detaching disposed
/// connections) happens in [`NetworkCore::slice`].
pub struct NetworkCore {
    ctx: Arc<NetContext>,
    registry: PoolRegistry,
    pump: MessagePump,
    instances: Arc<Instances>,
    accepted: Arc<AcceptedQueue>,
    events: Arc<dyn ConnectionEvents>,
    runtime: Handle,
    next_id: AtomicU64,
    max_connections: usize,
}

impl NetworkCore {
    /// Creates the core and its buffer pools.
    ///
    /// # Arguments
    ///
    /// * `config` - Server configuration
    /// * `handlers` - Packet handlers the pump dispatches to
    /// * `events` - Game logic callbacks for connects and disconnects
    /// * `runtime` - Runtime the socket tasks are spawned on
    pub fn new(
        config: &ServerConfig,
        handlers: Arc<PacketHandlers>,
        events: Arc<dyn ConnectionEvents>,
        runtime: Handle,
    ) -> Self {
        let registry = PoolRegistry::new();
        let ctx = Arc::new(NetContext::new(config, &registry));

        Self {
            ctx,
            registry,
            pump: MessagePump::new(handlers, config.trace_unknown_packets),
            instances: Arc::new(DashMap::new()),
            accepted: Arc::new(SegQueue::new()),
            events,
            runtime,
            next_id: AtomicU64::new(1),
            max_connections: config.max_connections,
        }
    }

    pub fn context(&self) -> &Arc<NetContext> {
        &self.ctx
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.registry
    }

    /// Queue the listener pushes accepted sockets into.
    pub fn accepted(&self) -> Arc<AcceptedQueue> {
        self.accepted.clone()
    }

    pub(crate) fn instances(&self) -> Arc<Instances> {
        self.instances.clone()
    }

    /// Runs one pass of network work on the calling thread.
    ///
    /// Picks up accepted sockets, decodes and dispatches the packets of every
    /// connection that received data since the last pass, then detaches the
    /// connections disposed meanwhile.
    pub fn slice(&self) {
        self.process_accepted();

        // connections re-queued by their own handlers wait for the next pass
        let pending = self.ctx.received.len();
        for _ in 0..pending {
            let Some(ns) = self.ctx.received.pop() else {
                break;
            };
            ns.clear_queued();
            if ns.is_running() {
                self.pump.handle_receive(&ns);
            }
        }

        self.process_disposed();
    }

    /// Turns accepted sockets into running connections.
    ///
    /// Returns the number of connections created.
    pub fn process_accepted(&self) -> usize {
        let mut created = 0;
        while let Some((stream, address)) = self.accepted.pop() {
            if self.max_connections > 0 && self.instances.len() >= self.max_connections {
                warn!(
                    "🚫 Rejecting {}: server full ({} online)",
                    address,
                    self.instances.len()
                );
                drop(stream);
                continue;
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (ns, grams) = NetState::new(id, address, self.ctx.clone());
            self.instances.insert(id, ns.clone());
            io::spawn(&self.runtime, ns.clone(), stream, grams);
            self.events.on_connected(&ns);
            created += 1;

            info!(
                "🔗 Client: {}: Connected. [{} Online]",
                ns,
                self.instances.len()
            );
        }
        created
    }

    /// Detaches and removes every disposed connection.
    ///
    /// Returns the number of connections removed.
    pub fn process_disposed(&self) -> usize {
        let mut removed = 0;
        while let Some(ns) = self.ctx.disposed.pop() {
            let detached = ns.detach();
            let account = detached.account.clone();
            self.events.on_disconnected(&ns, detached);
            self.instances.remove(&ns.id());
            ns.mark_disposed();
            removed += 1;

            match account {
                Some(account) => info!(
                    "👋 Client: {}: Disconnected. [{} Online] [{}]",
                    ns,
                    self.instances.len(),
                    account
                ),
                None => info!(
                    "👋 Client: {}: Disconnected. [{} Online]",
                    ns,
                    self.instances.len()
                ),
            }
        }
        removed
    }

    /// Disposes every connection idle for longer than the inactivity window.
    ///
    /// Returns the number of connections disposed.
    pub fn check_all_alive(&self) -> usize {
        let now = Instant::now();
        self.connections()
            .iter()
            .filter(|ns| ns.is_running() && !ns.check_alive(now))
            .count()
    }

    /// Stops every receive loop without closing any socket.
    pub fn pause(&self) -> bool {
        self.ctx.pause.pause()
    }

    pub fn resume(&self) -> bool {
        self.ctx.pause.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.ctx.pause.is_paused()
    }

    /// Hands the partially filled gram of every idle connection to its send
    /// task.
    pub fn flush_all(&self) -> usize {
        self.connections()
            .iter()
            .filter(|ns| ns.flush())
            .count()
    }

    /// Disposes every connection, e.g. on shutdown.
    pub fn dispose_all(&self, flush: bool) -> usize {
        self.connections()
            .iter()
            .filter(|ns| ns.dispose(flush))
            .count()
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Arc<NetState>> {
        self.instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<NetState>> {
        self.instances.get(&id).map(|entry| entry.value().clone())
    }

    pub fn online_count(&self) -> usize {
        self.instances.len()
    }

    /// Number of live connections from `ip`.
    pub fn connections_from(&self, ip: IpAddr) -> usize {
        count_from(&self.instances, ip)
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            online: self.online_count(),
            paused: self.is_paused(),
            received_pending: self.ctx.received_len(),
            disposed_pending: self.ctx.disposed_len(),
            pools: self.registry.stats(),
        }
    }
}

pub(crate) fn count_from(instances: &Instances, ip: IpAddr) -> usize {
    instances
        .iter()
        .filter(|entry| entry.value().address().ip() == ip)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        connected: AtomicUsize,
        detached: Mutex<Vec<Detached>>,
    }

    impl ConnectionEvents for Recorder {
        fn on_connected(&self, _ns: &Arc<NetState>) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnected(&self, _ns: &Arc<NetState>, detached: Detached) {
            self.detached.lock().push(detached);
        }
    }

    fn core(config: &ServerConfig, events: Arc<Recorder>) -> NetworkCore {
        let handlers = Arc::new(PacketHandlers::new());
        crate::handlers::register_core_handlers(&handlers);
        NetworkCore::new(config, handlers, events, Handle::current())
    }

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.pools.receive_count = 4;
        config.pools.coalesce_count = 4;
        config
    }

    async fn accept_pair(listener: &TcpListener) -> (TcpStream, TcpStream, SocketAddr) {
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, address) = listener.accept().await.unwrap();
        (client, server, address)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slice_creates_and_removes_connections() {
        let events = Arc::new(Recorder::default());
        let core = core(&test_config(), events.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (client, server, address) = accept_pair(&listener).await;
        core.accepted().push((server, address));
        core.slice();

        assert_eq!(core.online_count(), 1);
        assert_eq!(events.connected.load(Ordering::SeqCst), 1);
        let ns = core.connections().pop().unwrap();
        assert!(ns.is_running());
        assert_eq!(core.connections_from(address.ip()), 1);
        ns.attach_avatar(0x44);

        drop(client);
        wait_until(|| core.context().disposed_len() == 1).await;
        core.slice();

        assert_eq!(core.online_count(), 0);
        assert_eq!(events.detached.lock()[0].avatar, Some(0x44));
        assert!(core.get(ns.id()).is_none());
        assert_eq!(ns.state(), crate::connection::ConnectionState::Disposed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_max_connections_rejects_extra_sockets() {
        let mut config = test_config();
        config.max_connections = 1;
        let core = core(&config, Arc::new(Recorder::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let (_first, server, address) = accept_pair(&listener).await;
        core.accepted().push((server, address));
        let (mut second, server, address) = accept_pair(&listener).await;
        core.accepted().push((server, address));

        assert_eq!(core.process_accepted(), 1);
        assert_eq!(core.online_count(), 1);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pause_and_stats() {
        let core = core(&test_config(), Arc::new(Recorder::default()));

        assert!(core.pause());
        assert!(!core.pause());
        let stats = core.stats();
        assert!(stats.paused);
        assert_eq!(stats.online, 0);
        assert_eq!(stats.pools.len(), 4);

        assert!(core.resume());
        assert!(!core.is_paused());
        let json = serde_json::to_value(core.stats()).unwrap();
        assert_eq!(json["paused"], false);
    }
}
