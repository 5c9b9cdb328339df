//! Error types for packet compilation and outbound queueing.

use thiserror::Error;

/// Errors raised while compiling, compressing or unframing a packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// The packet's compiled buffer was already freed and it was compiled
    /// again without being marked acquired or static.
    #[error("Packet 0x{id:02X} compiled again after its buffer was freed")]
    RedundantCompile { id: u8 },

    /// A dynamic packet grew past what the 16-bit length field can describe.
    #[error("Packet 0x{id:02X} is {length} bytes, exceeding the 65535 byte length field")]
    LengthOverflow { id: u8, length: usize },

    #[error("Compression error: {0}")]
    Compression(String),

    /// An inbound compressed frame did not match its envelope.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

/// Errors raised by a connection's send queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendQueueError {
    /// Accepting the write would push the connection's pending bytes past its
    /// cap. Nothing was written.
    #[error("Send queue capacity exceeded: {pending} pending + {requested} requested > {cap}")]
    CapacityExceeded {
        pending: usize,
        requested: usize,
        cap: usize,
    },
}
