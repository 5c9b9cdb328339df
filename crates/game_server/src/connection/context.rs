//! State shared by every connection of one server.

use super::NetState;
use crate::config::{AncillaryLimits, PoolConfig, ServerConfig};
use crossbeam::queue::SegQueue;
use shard_protocol::{BufferPool, CompressionLevel, PoolRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// The buffer pools the network core draws from.
#[derive(Debug, Clone)]
pub struct NetPools {
    /// One buffer per live receive loop
    pub receive: Arc<BufferPool>,
    /// Outbound grams
    pub coalesced: Arc<BufferPool>,
    /// Compiled ephemeral and acquired packets
    pub compiled: Arc<BufferPool>,
    /// One inbound packet while its handler runs
    pub processor: Arc<BufferPool>,
}

impl NetPools {
    /// Creates the pools and registers them with `registry`.
    pub fn new(registry: &PoolRegistry, config: &PoolConfig) -> Self {
        Self {
            receive: registry.create("Receive", config.receive_count, config.receive_size),
            coalesced: registry.create("Coalesced", config.coalesce_count, config.coalesce_size),
            compiled: registry.create("Compiled", config.compiled_count, config.compiled_size),
            processor: registry.create("Processor", config.processor_count, config.processor_size),
        }
    }
}

/// Global switch halting every receive loop without closing sockets.
///
/// Receive loops hold a subscription and wait on it before each read, so
/// resuming releases all of them at once.
#[derive(Debug)]
pub struct PauseGate {
    paused: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops new receives. Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        let was_paused = self.paused.send_replace(true);
        if !was_paused {
            info!("⏸️ Network paused");
        }
        !was_paused
    }

    /// Releases every paused receive loop. Returns `false` if not paused.
    pub fn resume(&self) -> bool {
        let was_paused = self.paused.send_replace(false);
        if was_paused {
            info!("▶️ Network resumed");
        }
        was_paused
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }
}

/// Everything a [`NetState`] needs from the server it belongs to.
///
/// Built once per server and shared by all of its connections, so tests can
/// stand up several isolated servers in one process.
#[derive(Debug)]
pub struct NetContext {
    pub pools: NetPools,
    pub pause: PauseGate,
    /// Connections with inbound bytes waiting for the pump
    pub(crate) received: SegQueue<Arc<NetState>>,
    /// Connections waiting for the deferred disposal pass
    pub(crate) disposed: SegQueue<Arc<NetState>>,
    pub(crate) limits: AncillaryLimits,
    pub(crate) pending_cap: usize,
    pub(crate) byte_queue_capacity: usize,
    pub(crate) compression_level: CompressionLevel,
    pub(crate) inactivity_timeout: Duration,
    pub(crate) flush_timeout: Duration,
    pub(crate) expect_seed: bool,
}

impl NetContext {
    pub fn new(config: &ServerConfig, registry: &PoolRegistry) -> Self {
        Self {
            pools: NetPools::new(registry, &config.pools),
            pause: PauseGate::new(),
            received: SegQueue::new(),
            disposed: SegQueue::new(),
            limits: config.limits,
            pending_cap: config.pending_cap,
            byte_queue_capacity: config.byte_queue_capacity,
            compression_level: config.compression_level,
            inactivity_timeout: config.inactivity_timeout,
            flush_timeout: config.flush_timeout,
            expect_seed: config.expect_seed,
        }
    }

    /// Connections waiting for the pump.
    pub fn received_len(&self) -> usize {
        self.received.len()
    }

    /// Connections waiting for the deferred disposal pass.
    pub fn disposed_len(&self) -> usize {
        self.disposed.len()
    }
}
