//! Server configuration types and defaults.
//!
//! This module contains the runtime configuration handed to the network core.
//! The binary builds it from a TOML file and command line overrides; tests
//! build it directly with struct update syntax.

use shard_protocol::send_queue::{DEFAULT_COALESCE_BUFFER_SIZE, DEFAULT_PENDING_CAP};
use shard_protocol::CompressionLevel;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration structure for the network core.
///
/// Contains every tunable of the transport: endpoints, connection limits,
/// timing of the liveness sweep and server tick, queue caps and the sizes
/// of the buffer pools.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Endpoints to listen on. Endpoints that fail to bind are skipped.
    pub listen: Vec<SocketAddr>,

    /// Maximum number of concurrent connections allowed
    pub max_connections: usize,

    /// Maximum concurrent connections from one IP address, 0 for no limit
    pub max_connections_per_ip: usize,

    /// Whether to use SO_REUSEPORT for one accept loop per CPU core
    pub use_reuse_port: bool,

    /// Listen backlog passed to every bound socket
    pub listen_backlog: i32,

    /// Interval of the built-in server tick driving `slice` and `flush_all`,
    /// 0 when the caller drives them itself
    pub tick_interval_ms: u64,

    /// Connections without traffic for this long are disposed by the sweep
    pub inactivity_timeout: Duration,

    /// Delay before the first liveness sweep
    pub sweep_delay: Duration,

    /// Period of the liveness sweep after the first one
    pub sweep_interval: Duration,

    /// Upper bound on draining the send queue of a connection disposed
    /// with flushing
    pub flush_timeout: Duration,

    /// Whether new connections must open with a four byte seed or a seed
    /// packet
    pub expect_seed: bool,

    /// Cap on bytes waiting to be sent per connection
    pub pending_cap: usize,

    /// Initial capacity of each connection's inbound queue
    pub byte_queue_capacity: usize,

    /// Deflate level used for connections with compression enabled
    pub compression_level: CompressionLevel,

    /// Hex-dump unknown packets to the `packet_trace` log target
    pub trace_unknown_packets: bool,

    pub pools: PoolConfig,

    pub limits: AncillaryLimits,
}

/// Sizes of the buffer pools shared by every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Buffers used by receive loops
    pub receive_count: usize,
    pub receive_size: usize,
    /// Buffers backing outbound grams
    pub coalesce_count: usize,
    pub coalesce_size: usize,
    /// Buffers holding compiled ephemeral packets
    pub compiled_count: usize,
    pub compiled_size: usize,
    /// Buffers holding one inbound packet while its handler runs
    pub processor_count: usize,
    pub processor_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            receive_count: 2048,
            receive_size: 2048,
            coalesce_count: 2048,
            coalesce_size: DEFAULT_COALESCE_BUFFER_SIZE,
            compiled_count: 16,
            compiled_size: 4096,
            processor_count: 16,
            processor_size: 4096,
        }
    }
}

/// Per-connection caps on open UI state. Exceeding one disposes the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AncillaryLimits {
    pub gumps: usize,
    pub menus: usize,
    pub hue_pickers: usize,
    pub trades: usize,
}

impl Default for AncillaryLimits {
    fn default() -> Self {
        Self {
            gumps: 512,
            menus: 512,
            hue_pickers: 512,
            trades: 512,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 2593))],
            max_connections: 1000,
            max_connections_per_ip: 0,
            use_reuse_port: false,
            listen_backlog: 128,
            tick_interval_ms: 50,
            inactivity_timeout: Duration::from_secs(90),
            sweep_delay: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(90),
            flush_timeout: Duration::from_secs(5),
            expect_seed: true,
            pending_cap: DEFAULT_PENDING_CAP,
            byte_queue_capacity: shard_protocol::byte_queue::DEFAULT_CAPACITY,
            compression_level: CompressionLevel::FAST,
            trace_unknown_packets: true,
            pools: PoolConfig::default(),
            limits: AncillaryLimits::default(),
        }
    }
}
