//! Server orchestration: the network core owning live connections and the
//! `GameServer` running listeners and timers around it.

pub mod core;
pub mod network;

pub use self::core::GameServer;
pub use network::{AcceptedQueue, ConnectionEvents, NetworkCore, NetworkStats, NoopEvents};
