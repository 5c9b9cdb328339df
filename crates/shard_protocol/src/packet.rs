//! Outbound packet construction and compilation.
//!
//! A [`Packet`] is built by writing its body through [`Packet::stream`] and is
//! turned into wire bytes by [`Packet::compile`]. What happens to the compiled
//! bytes afterwards depends on the packet's [`PacketLifetime`]:
//!
//! | lifetime    | compiled into            | freed by                     |
//! |-------------|--------------------------|------------------------------|
//! | `Ephemeral` | pooled buffer            | [`Packet::on_send`]          |
//! | `Acquired`  | pooled buffer            | [`Packet::release`]          |
//! | `Static`    | dedicated shared buffer  | never                        |
//!
//! Packets that are sent to many connections forever (common system messages
//! and the like) are better held as a [`StaticPacket`] inside a
//! [`StaticPacketCache`], which compiles them once and hands out shared bytes.

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::compression::{
    compress_frame, compress_frame_into, CompressionLevel, ENVELOPE_HEADER_SIZE,
};
use crate::error::PacketError;
use crate::writer::PacketWriter;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::io::SeekFrom;
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Largest total length a dynamic packet's 16-bit length field can carry.
pub const MAX_PACKET_LENGTH: usize = u16::MAX as usize;

/// Ownership of a packet's compiled bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLifetime {
    /// Compiled once, freed as soon as it is sent
    Ephemeral,
    /// Kept across sends until explicitly released
    Acquired,
    /// Compiled into a dedicated buffer and never freed
    Static,
}

#[derive(Debug)]
enum CompiledBuffer {
    Pooled { buffer: PooledBuffer, length: usize },
    Shared(Arc<[u8]>),
}

impl CompiledBuffer {
    fn as_bytes(&self) -> &[u8] {
        match self {
            CompiledBuffer::Pooled { buffer, length } => &buffer[..*length],
            CompiledBuffer::Shared(bytes) => bytes,
        }
    }
}

/// An outbound message under construction or compiled.
#[derive(Debug)]
pub struct Packet {
    id: u8,
    fixed_length: Option<usize>,
    stream: PacketWriter,
    lifetime: PacketLifetime,
    plain: Option<CompiledBuffer>,
    compressed: Option<CompiledBuffer>,
    freed: bool,
    warned: bool,
}

impl Packet {
    /// Starts a packet with a known total length.
    ///
    /// The opcode is written; the body follows through [`Packet::stream`].
    pub fn fixed(id: u8, length: usize) -> Self {
        let mut stream = PacketWriter::with_capacity(length);
        stream.write_u8(id);
        Self::with_stream(id, Some(length), stream)
    }

    /// Starts a packet whose total length is only known once the body is
    /// written.
    ///
    /// The opcode and a placeholder length field are written; the length is
    /// patched in at compile time.
    pub fn dynamic(id: u8, capacity: usize) -> Self {
        let mut stream = PacketWriter::with_capacity(capacity.max(3));
        stream.write_u8(id);
        stream.write_u16(0);
        Self::with_stream(id, None, stream)
    }

    fn with_stream(id: u8, fixed_length: Option<usize>, stream: PacketWriter) -> Self {
        Self {
            id,
            fixed_length,
            stream,
            lifetime: PacketLifetime::Ephemeral,
            plain: None,
            compressed: None,
            freed: false,
            warned: false,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn is_dynamic(&self) -> bool {
        self.fixed_length.is_none()
    }

    pub fn lifetime(&self) -> PacketLifetime {
        self.lifetime
    }

    /// Body writer. Writes after the first compile are not reflected in the
    /// cached output.
    pub fn stream(&mut self) -> &mut PacketWriter {
        &mut self.stream
    }

    /// Whether any compiled output is currently held.
    pub fn is_compiled(&self) -> bool {
        self.plain.is_some() || self.compressed.is_some()
    }

    /// Keeps the compiled output across sends until [`Packet::release`].
    pub fn acquire(&mut self) {
        if self.lifetime == PacketLifetime::Ephemeral {
            self.lifetime = PacketLifetime::Acquired;
        }
    }

    /// Marks the packet as shared forever.
    ///
    /// Any output compiled into a pooled buffer before this call is dropped
    /// and recompiled into a dedicated buffer on next use.
    pub fn set_static(&mut self) {
        if self.lifetime != PacketLifetime::Static {
            self.lifetime = PacketLifetime::Static;
            self.plain = None;
            self.compressed = None;
        }
    }

    /// Patches the length field and returns the framed bytes in place.
    fn frame(&mut self) -> Result<&[u8], PacketError> {
        let length = self.stream.len();
        match self.fixed_length {
            None => {
                if length > MAX_PACKET_LENGTH {
                    return Err(PacketError::LengthOverflow { id: self.id, length });
                }
                let end = self.stream.position();
                self.stream.seek(SeekFrom::Start(1));
                self.stream.write_u16(length as u16);
                self.stream.seek(SeekFrom::Start(end as u64));
            }
            Some(declared) if declared != length => {
                let diff = length as i64 - declared as i64;
                warn!(
                    "📦 Packet 0x{:02X}: Bad packet length! ({}{} bytes)",
                    self.id,
                    if diff > 0 { "+" } else { "" },
                    diff
                );
            }
            Some(_) => {}
        }
        Ok(self.stream.as_slice())
    }

    fn compiled(&self, compressed: bool) -> Option<&CompiledBuffer> {
        if compressed {
            self.compressed.as_ref()
        } else {
            self.plain.as_ref()
        }
    }

    /// Compiles the packet to wire bytes, reusing earlier output for the same
    /// compression mode.
    ///
    /// # Arguments
    ///
    /// * `compression` - Wrap the output in the deflate envelope at this level
    /// * `pool` - Pool supplying the buffer for ephemeral and acquired output
    ///
    /// # Errors
    ///
    /// * [`PacketError::RedundantCompile`] when the output was already freed
    /// * [`PacketError::LengthOverflow`] for a dynamic packet over 65535 bytes
    /// * [`PacketError::Compression`] when the envelope cannot carry the packet
    pub fn compile(
        &mut self,
        compression: Option<CompressionLevel>,
        pool: &Arc<BufferPool>,
    ) -> Result<&[u8], PacketError> {
        if self.freed {
            if !self.warned {
                self.warned = true;
                warn!(
                    "⚠️ Packet 0x{:02X} compiled again after its buffer was freed",
                    self.id
                );
            }
            return Err(PacketError::RedundantCompile { id: self.id });
        }

        let compressed = compression.is_some();
        if self.compiled(compressed).is_none() {
            let lifetime = self.lifetime;
            let frame = self.frame()?;

            let buffer = match (lifetime, compression) {
                (PacketLifetime::Static, None) => CompiledBuffer::Shared(Arc::from(frame)),
                (PacketLifetime::Static, Some(level)) => {
                    CompiledBuffer::Shared(Arc::from(compress_frame(frame, level)?))
                }
                (PacketLifetime::Ephemeral | PacketLifetime::Acquired, None) => {
                    let mut buffer = pool.acquire_sized(frame.len());
                    buffer[..frame.len()].copy_from_slice(frame);
                    CompiledBuffer::Pooled {
                        buffer,
                        length: frame.len(),
                    }
                }
                (PacketLifetime::Ephemeral | PacketLifetime::Acquired, Some(level)) => {
                    // sized for the stored fallback, the largest frame possible
                    let mut buffer = pool.acquire_sized(ENVELOPE_HEADER_SIZE + frame.len());
                    let length = compress_frame_into(frame, level, &mut buffer)?;
                    CompiledBuffer::Pooled { buffer, length }
                }
            };

            if compressed {
                self.compressed = Some(buffer);
            } else {
                self.plain = Some(buffer);
            }
        }

        Ok(self.compiled(compressed).map_or(&[][..], CompiledBuffer::as_bytes))
    }

    fn free(&mut self) {
        if self.is_compiled() {
            self.plain = None;
            self.compressed = None;
            self.freed = true;
        }
    }

    /// Called once the compiled bytes were queued. Frees ephemeral output.
    pub fn on_send(&mut self) {
        if self.lifetime == PacketLifetime::Ephemeral {
            self.free();
        }
    }

    /// Frees the output of an acquired packet.
    pub fn release(&mut self) {
        if self.lifetime == PacketLifetime::Acquired {
            self.free();
        }
    }
}

/// A compiled packet shared between every connection that sends it.
#[derive(Debug)]
pub struct StaticPacket {
    id: u8,
    bytes: Arc<[u8]>,
    compressed: OnceLock<Arc<[u8]>>,
}

impl StaticPacket {
    /// Compiles `packet` once into a dedicated buffer.
    pub fn new(mut packet: Packet) -> Result<Self, PacketError> {
        packet.set_static();
        let bytes = Arc::from(packet.frame()?);
        Ok(Self {
            id: packet.id,
            bytes,
            compressed: OnceLock::new(),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Wire bytes for a connection with the given compression setting.
    ///
    /// The compressed form is created on first use with the level of that
    /// first request and reused afterwards.
    pub fn bytes(&self, compression: Option<CompressionLevel>) -> Result<&[u8], PacketError> {
        let Some(level) = compression else {
            return Ok(&self.bytes[..]);
        };
        if let Some(frame) = self.compressed.get() {
            return Ok(&frame[..]);
        }
        let frame: Arc<[u8]> = Arc::from(compress_frame(&self.bytes, level)?);
        Ok(&self.compressed.get_or_init(|| frame)[..])
    }
}

/// Lazily populated map from a typed key to a shared compiled packet.
#[derive(Debug)]
pub struct StaticPacketCache<K: Eq + Hash> {
    packets: DashMap<K, Arc<StaticPacket>>,
}

impl<K: Eq + Hash> Default for StaticPacketCache<K> {
    fn default() -> Self {
        Self {
            packets: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash> StaticPacketCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached packet for `key`, building and compiling it on the
    /// first request.
    pub fn get_or_create(
        &self,
        key: K,
        build: impl FnOnce() -> Packet,
    ) -> Result<Arc<StaticPacket>, PacketError> {
        match self.packets.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let packet = Arc::new(StaticPacket::new(build())?);
                entry.insert(packet.clone());
                Ok(packet)
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<StaticPacket>> {
        self.packets.get(key).map(|entry| entry.value().clone())
    }

    /// Drops the cached packet so the next request rebuilds it.
    pub fn invalidate(&self, key: &K) -> bool {
        self.packets.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}
