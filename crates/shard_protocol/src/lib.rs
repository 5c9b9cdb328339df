//! # Shard Protocol - Wire Format and Buffer Discipline
//!
//! Everything needed to get bytes on and off the wire for a shard, without
//! any sockets: the buffers the network core recycles, the inbound and
//! outbound byte queues, packet encoding and decoding, compression and the
//! client version negotiation that selects between wire formats.
//!
//! ## Framing
//!
//! Every packet starts with a one byte opcode. Fixed-length packets have a
//! size known from the opcode alone; variable-length packets follow the
//! opcode with a two byte big-endian **total** length (opcode and length
//! field included). Opcode `0xBF` escapes into an extended space keyed by a
//! two byte sub-command.
//!
//! ## Buffers
//!
//! * [`BufferPool`] - Named pools of fixed-size buffers returned on drop
//! * [`ByteQueue`] - Per-connection ring buffer of undecoded inbound bytes
//! * [`SendQueue`] - Per-connection chain of coalesced outbound [`Gram`]s
//!
//! ## Packets
//!
//! * [`Packet`] - Outbound message compiled with an explicit [`PacketLifetime`]
//! * [`StaticPacketCache`] - Shared compiled packets keyed by a typed enum
//! * [`PacketReader`] / [`PacketWriter`] - Bounds-safe cursors
//! * [`messages`] - The outbound messages the core and its callers send
//!
//! ## Example
//!
//! ```rust
//! use shard_protocol::{BufferPool, Packet, PacketReader};
//!
//! let pool = BufferPool::new("Compiled", 4, 4096);
//! let mut packet = Packet::dynamic(0xAE, 64);
//! packet.stream().write_ascii_null("hello");
//!
//! let bytes = packet.compile(None, &pool).unwrap();
//! assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]) as usize, bytes.len());
//!
//! let mut reader = PacketReader::new(bytes, false);
//! assert_eq!(reader.read_ascii(), "hello");
//! ```

pub mod buffer_pool;
pub mod byte_queue;
pub mod compression;
pub mod error;
pub mod messages;
pub mod packet;
pub mod reader;
pub mod send_queue;
pub mod version;
pub mod writer;

pub use buffer_pool::{BufferPool, PoolRegistry, PoolStats, PooledBuffer};
pub use byte_queue::ByteQueue;
pub use compression::{compress_frame, compress_frame_into, decompress_frame, CompressionLevel};
pub use error::{PacketError, SendQueueError};
pub use packet::{Packet, PacketLifetime, StaticPacket, StaticPacketCache};
pub use reader::{HexDump, PacketReader, StringEncoding};
pub use send_queue::{Gram, SendQueue};
pub use version::{ClientVersion, ParseVersionError, ProtocolFeatures};
pub use writer::PacketWriter;
