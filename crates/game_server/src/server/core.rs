//! Core game server implementation.
//!
//! This module contains the main `GameServer` struct, which wires the packet
//! handlers, the network core and the listener together and runs the timers
//! driving them.

use crate::{
    config::ServerConfig,
    error::ServerError,
    handlers::{register_core_handlers, PacketHandlers},
    listener::{AdmissionHook, AdmissionHooks, Firewall, IpLimiter, Listener},
    server::network::{ConnectionEvents, NetworkCore, NoopEvents},
};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{info, warn};

/// The core game server structure.
///
/// `GameServer` owns the network core and everything around it: the packet
/// handler registry, the admission hooks consulted by the accept loops and
/// the shutdown channel.
///
/// # Architecture
///
/// * **Listener**: one accept loop per bound socket, queueing admitted sockets
/// * **Network core**: live connections, message pump and deferred disposal
/// * **Liveness sweep**: periodic inactivity check of every connection
/// * **Server tick**: optional built-in driver of `slice` and `flush_all`
///
/// Game logic that runs its own simulation loop sets `tick_interval_ms` to 0
/// and calls [`NetworkCore::slice`] and [`NetworkCore::flush_all`] itself.
pub struct GameServer {
    /// Server configuration settings
    config: ServerConfig,

    /// Packet handlers shared with the message pump
    handlers: Arc<PacketHandlers>,

    /// Live connections and per-slice work
    core: Arc<NetworkCore>,

    /// Ban list, always the first admission hook
    firewall: Arc<Firewall>,

    /// Hooks consulted for every accepted socket
    hooks: Arc<AdmissionHooks>,

    /// Shutdown flag; stays set once raised
    shutdown_sender: watch::Sender<bool>,
}

impl GameServer {
    /// Creates a new game server with the specified configuration.
    ///
    /// Must be called from within a tokio runtime; socket tasks are spawned
    /// on it.
    ///
    /// # Arguments
    ///
    /// * `config` - Configuration parameters for server behavior
    ///
    /// # Returns
    ///
    /// A new `GameServer` with the transport handlers registered, or a
    /// `ServerError` when no runtime is available.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        Self::with_events(config, Arc::new(NoopEvents))
    }

    /// Creates a server reporting connects and disconnects to `events`.
    pub fn with_events(
        config: ServerConfig,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Self, ServerError> {
        let runtime = Handle::try_current()
            .map_err(|e| ServerError::Internal(format!("No tokio runtime: {e}")))?;

        let handlers = Arc::new(PacketHandlers::new());
        register_core_handlers(&handlers);

        let core = Arc::new(NetworkCore::new(&config, handlers.clone(), events, runtime));
        let firewall = Arc::new(Firewall::new());
        let hooks = Arc::new(AdmissionHooks::new());
        hooks.add(firewall.clone());
        if config.max_connections_per_ip > 0 {
            hooks.add(Arc::new(IpLimiter::new(
                core.instances(),
                config.max_connections_per_ip,
            )));
        }

        let (shutdown_sender, _) = watch::channel(false);

        Ok(Self {
            config,
            handlers,
            core,
            firewall,
            hooks,
            shutdown_sender,
        })
    }

    /// Binds every configured endpoint.
    ///
    /// # Returns
    ///
    /// The listener, or a `ServerError::Network` when not a single endpoint
    /// could be bound.
    pub fn bind(&self) -> Result<Listener, ServerError> {
        let listener = Listener::bind(&self.config);
        if listener.is_empty() {
            return Err(ServerError::Network(format!(
                "No endpoint could be bound ({:?})",
                self.config.listen
            )));
        }
        Ok(listener)
    }

    /// Binds and runs the server until [`GameServer::shutdown`] is called.
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.run(listener).await
    }

    /// Runs the accept loops, the liveness sweep and the server tick on an
    /// already bound listener.
    ///
    /// # Shutdown Sequence
    ///
    /// 1. Accept loops and timers stop
    /// 2. Every connection is disposed with its queued data flushed
    /// 3. The disposal pass detaches and removes them
    pub async fn run(&self, listener: Listener) -> Result<(), ServerError> {
        let addresses = listener.local_addrs();
        info!(
            "🚀 Starting game server on {:?} ({} acceptor(s))",
            addresses,
            listener.len()
        );

        let shutdown_receiver = self.shutdown_sender.subscribe();
        let mut tasks = vec![self.start_liveness_sweep()];

        if self.config.tick_interval_ms > 0 {
            tasks.push(self.start_server_tick());
            info!("🕒 Server tick started with interval: {}ms", self.config.tick_interval_ms);
        } else {
            info!("⏸️ Server tick disabled (interval: 0ms)");
        }

        listener
            .run(self.core.accepted(), self.hooks.clone(), shutdown_receiver)
            .await;

        for task in tasks {
            task.abort();
        }

        info!("🧹 Performing server cleanup...");
        let disposed = self.core.dispose_all(true);
        self.core.process_disposed();
        info!("✅ Server cleanup completed ({} connection(s) closed)", disposed);

        info!("Server stopped");
        Ok(())
    }

    fn start_liveness_sweep(&self) -> JoinHandle<()> {
        let core = self.core.clone();
        let delay = self.config.sweep_delay;
        let period = self.config.sweep_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut sweep = interval_at(Instant::now() + delay, period);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                sweep.tick().await;
                let disposed = core.check_all_alive();
                if disposed > 0 {
                    warn!("⏳ Liveness sweep disposed {} idle connection(s)", disposed);
                }
            }
        })
    }

    fn start_server_tick(&self) -> JoinHandle<()> {
        let core = self.core.clone();
        let tick_interval = Duration::from_millis(self.config.tick_interval_ms);

        tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                core.slice();
                core.flush_all();
            }
        })
    }

    /// Initiates server shutdown.
    ///
    /// Signals the accept loops to stop; [`GameServer::run`] then disposes
    /// every connection and returns. A shutdown requested before `run`
    /// subscribes makes `run` return as soon as it starts.
    pub fn shutdown(&self) {
        info!("🛑 Shutting down server...");
        self.shutdown_sender.send_replace(true);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Gets the network core for slicing, flushing and connection lookups.
    pub fn core(&self) -> Arc<NetworkCore> {
        self.core.clone()
    }

    /// Gets the packet handler registry.
    pub fn handlers(&self) -> Arc<PacketHandlers> {
        self.handlers.clone()
    }

    pub fn firewall(&self) -> Arc<Firewall> {
        self.firewall.clone()
    }

    /// Adds an admission hook consulted after the built-in ones.
    pub fn add_admission_hook(&self, hook: Arc<dyn AdmissionHook>) {
        self.hooks.add(hook);
    }
}
