//! Connection management for client connections.
//!
//! This module handles the lifecycle of client connections: the per-connection
//! [`NetState`], the socket tasks feeding and draining it, the ancillary UI
//! state whose cleanup is tied to disconnection, and the [`NetContext`] every
//! connection shares.

pub mod ancillary;
mod context;
pub(crate) mod io;
mod netstate;

pub use ancillary::{Detached, GumpHandle, HuePickerHandle, MenuHandle, TradeHandle};
pub use context::{NetContext, NetPools, PauseGate};
pub use netstate::{ConnectionState, NetState, Serial};

#[cfg(test)]
pub(crate) use netstate::tests as test_support;

/// Type alias for connection identifiers.
///
/// Connection IDs are assigned in accept order and never reused during the
/// lifetime of a server.
pub type ConnectionId = u64;
