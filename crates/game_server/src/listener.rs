//! TCP listeners and connection admission.
//!
//! Every configured endpoint is bound with `socket2` so that reuse-address,
//! reuse-port and the listen backlog can be set before listening. An endpoint
//! that fails to bind is logged and skipped; the server runs on whatever did
//! bind.
//!
//! Accepted sockets are checked against the registered [`AdmissionHook`]s
//! right in the accept loop. Rejected sockets are shut down immediately,
//! admitted ones are queued for the next [`NetworkCore::slice`].
//!
//! [`NetworkCore::slice`]: crate::server::NetworkCore::slice

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::server::network::{count_from, AcceptedQueue, Instances};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Decides whether an accepted socket may become a connection.
pub trait AdmissionHook: Send + Sync {
    /// Name used when logging rejections.
    fn name(&self) -> &str;

    fn admit(&self, address: &SocketAddr) -> bool;
}

/// Ordered set of admission hooks. The first hook refusing a socket wins.
#[derive(Default)]
pub struct AdmissionHooks {
    hooks: RwLock<Vec<Arc<dyn AdmissionHook>>>,
}

impl AdmissionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: Arc<dyn AdmissionHook>) {
        info!("🛡️ Admission hook registered: {}", hook.name());
        self.hooks.write().push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the name of the first hook refusing `address`, if any.
    pub fn check(&self, address: &SocketAddr) -> Option<String> {
        let hooks = self.hooks.read().clone();
        hooks
            .iter()
            .find(|hook| !hook.admit(address))
            .map(|hook| hook.name().to_string())
    }
}

/// IP ban list.
#[derive(Debug, Default)]
pub struct Firewall {
    banned: RwLock<HashSet<IpAddr>>,
}

impl Firewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the address was already banned.
    pub fn ban(&self, ip: IpAddr) -> bool {
        self.banned.write().insert(ip)
    }

    pub fn unban(&self, ip: IpAddr) -> bool {
        self.banned.write().remove(&ip)
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.read().contains(&ip)
    }
}

impl AdmissionHook for Firewall {
    fn name(&self) -> &str {
        "firewall"
    }

    fn admit(&self, address: &SocketAddr) -> bool {
        !self.is_banned(address.ip())
    }
}

/// Caps the number of live connections from one IP address.
pub struct IpLimiter {
    instances: Arc<Instances>,
    limit: usize,
}

impl IpLimiter {
    pub(crate) fn new(instances: Arc<Instances>, limit: usize) -> Self {
        Self { instances, limit }
    }
}

impl AdmissionHook for IpLimiter {
    fn name(&self) -> &str {
        "ip limiter"
    }

    fn admit(&self, address: &SocketAddr) -> bool {
        self.limit == 0 || count_from(&self.instances, address.ip()) < self.limit
    }
}

/// The bound listening sockets of a server.
pub struct Listener {
    listeners: Vec<TcpListener>,
}

impl Listener {
    /// Binds every endpoint in `config.listen`.
    ///
    /// With `use_reuse_port` each endpoint gets one listening socket per CPU
    /// core so the kernel spreads incoming connections across accept loops.
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &ServerConfig) -> Self {
        let core_count = num_cpus::get();
        let mut listeners = Vec::new();

        for endpoint in &config.listen {
            // ephemeral ports cannot be shared between sockets
            let acceptors = if config.use_reuse_port && endpoint.port() != 0 {
                core_count
            } else {
                1
            };

            for index in 0..acceptors {
                match bind_socket(endpoint, config) {
                    Ok(listener) => {
                        info!("✅ Listener {} bound on {}", index, endpoint);
                        listeners.push(listener);
                    }
                    Err(e) => {
                        error!("❌ Failed to bind {}: {}", endpoint, e);
                        break;
                    }
                }
            }
        }

        Self { listeners }
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Runs the accept loops until `shutdown` turns true.
    ///
    /// A flag that is already set stops the loops right away.
    pub async fn run(
        self,
        accepted: Arc<AcceptedQueue>,
        hooks: Arc<AdmissionHooks>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut accept_futures = self
            .listeners
            .into_iter()
            .map(|listener| accept_loop(listener, accepted.clone(), hooks.clone()))
            .collect::<FuturesUnordered<_>>();

        tokio::select! {
            _ = accept_futures.next() => {}
            signalled = async { shutdown.wait_for(|stopped| *stopped).await.is_ok() } => {
                if signalled {
                    info!("Shutdown signal received");
                }
            }
        }
    }
}

fn bind_socket(endpoint: &SocketAddr, config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::for_address(*endpoint), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();

    if config.use_reuse_port {
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))))]
        {
            if let Err(e) = socket.set_reuse_port(true) {
                warn!("Failed to set SO_REUSEPORT: {}", e);
            }
        }
        #[cfg(not(unix))]
        {
            warn!("SO_REUSEPORT is not supported on this platform. Using SO_REUSEADDR only.");
        }
    }

    socket
        .bind(&(*endpoint).into())
        .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
    socket
        .listen(config.listen_backlog)
        .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener.set_nonblocking(true).ok();
    TcpListener::from_std(std_listener)
        .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))
}

async fn accept_loop(listener: TcpListener, accepted: Arc<AcceptedQueue>, hooks: Arc<AdmissionHooks>) {
    loop {
        match listener.accept().await {
            Ok((stream, address)) => {
                if let Some(hook) = hooks.check(&address) {
                    debug!("🚫 Connection from {} refused by {}", address, hook);
                    if let Err(e) = SockRef::from(&stream).shutdown(Shutdown::Both) {
                        debug!("Failed to shut down refused socket {}: {}", address, e);
                    }
                    continue;
                }
                accepted.push((stream, address));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::queue::SegQueue;
    use dashmap::DashMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            listen: vec![SocketAddr::from(([127, 0, 0, 1], 0))],
            ..ServerConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bind_failure_skips_endpoint() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = loopback_config();
        config.listen.insert(0, taken.local_addr().unwrap());

        let listener = Listener::bind(&config);
        assert_eq!(listener.len(), 1);
        assert_ne!(listener.local_addrs()[0], taken.local_addr().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_banned_address_is_refused() {
        let listener = Listener::bind(&loopback_config());
        let address = listener.local_addrs()[0];

        let firewall = Arc::new(Firewall::new());
        let hooks = Arc::new(AdmissionHooks::new());
        hooks.add(firewall.clone());
        let accepted = Arc::new(SegQueue::new());
        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(listener.run(accepted.clone(), hooks, receiver));

        firewall.ban(IpAddr::from([127, 0, 0, 1]));
        let mut refused = TcpStream::connect(address).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), refused.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(accepted.is_empty());

        firewall.unban(IpAddr::from([127, 0, 0, 1]));
        let _admitted = TcpStream::connect(address).await.unwrap();
        for _ in 0..200 {
            if !accepted.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(accepted.len(), 1);

        shutdown.send_replace(true);
        task.await.unwrap();
    }

    #[test]
    fn test_ip_limiter_counts_live_connections() {
        let limiter = IpLimiter::new(Arc::new(DashMap::new()), 2);
        assert!(limiter.admit(&SocketAddr::from(([10, 0, 0, 1], 1000))));

        let unlimited = IpLimiter::new(Arc::new(DashMap::new()), 0);
        assert!(unlimited.admit(&SocketAddr::from(([10, 0, 0, 1], 1000))));
    }

    #[test]
    fn test_first_refusing_hook_is_reported() {
        let hooks = AdmissionHooks::new();
        let firewall = Arc::new(Firewall::new());
        hooks.add(firewall.clone());
        let address = SocketAddr::from(([192, 168, 1, 2], 5000));

        assert_eq!(hooks.check(&address), None);
        firewall.ban(address.ip());
        assert_eq!(hooks.check(&address).as_deref(), Some("firewall"));
        assert!(firewall.is_banned(address.ip()));
    }
}
