//! Inbound framing and dispatch.
//!
//! The pump turns the bytes a connection received into packets and hands
//! each packet to its registered handler. It runs on the simulation thread,
//! one connection at a time, and never holds a queue lock while a handler
//! runs.

use crate::connection::NetState;
use crate::handlers::{transport::LOGIN_SEED, PacketHandler, PacketHandlers, PacketLength};
use shard_protocol::{ByteQueue, PacketReader, PooledBuffer};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of looking at the front of a connection's inbound queue.
enum Step {
    /// Not enough bytes for the next packet
    Stop,
    /// The stream is unusable
    Dispose(&'static str),
    /// Opcode without a handler; everything buffered was dropped
    Unknown(Vec<u8>),
    Packet {
        handler: Arc<PacketHandler>,
        buffer: PooledBuffer,
        length: usize,
    },
}

/// Frames inbound bytes and invokes packet handlers.
#[derive(Debug)]
pub struct MessagePump {
    handlers: Arc<PacketHandlers>,
    trace_unknown: bool,
}

impl MessagePump {
    /// # Arguments
    ///
    /// * `handlers` - Registry consulted for every opcode
    /// * `trace_unknown` - Hex-dump packets without a handler on the
    ///   `packet_trace` target
    pub fn new(handlers: Arc<PacketHandlers>, trace_unknown: bool) -> Self {
        Self {
            handlers,
            trace_unknown,
        }
    }

    pub fn handlers(&self) -> &Arc<PacketHandlers> {
        &self.handlers
    }

    /// Decodes and dispatches every complete packet buffered for `ns`.
    ///
    /// Stops at the first incomplete packet, leaving it buffered until more
    /// bytes arrive.
    pub fn handle_receive(&self, ns: &Arc<NetState>) {
        while ns.is_running() {
            match ns.with_incoming(|queue| self.next_step(ns, queue)) {
                Step::Stop => break,
                Step::Dispose(reason) => {
                    warn!("🚫 Client: {}: {}, disconnecting", ns, reason);
                    ns.dispose(false);
                    break;
                }
                Step::Unknown(data) => {
                    let id = data.first().copied().unwrap_or_default();
                    warn!(
                        "❓ Client: {}: Unknown packet 0x{:02X}, dropped {} buffered bytes",
                        ns,
                        id,
                        data.len()
                    );
                    if self.trace_unknown {
                        PacketReader::new(&data, true).trace(ns);
                    }
                    break;
                }
                Step::Packet {
                    handler,
                    buffer,
                    length,
                } => self.dispatch(ns, &handler, &buffer[..length]),
            }
        }
    }

    fn next_step(&self, ns: &NetState, queue: &mut ByteQueue) -> Step {
        if !ns.is_seeded() {
            if queue.is_empty() {
                return Step::Stop;
            }
            if queue.peek_packet_id() == LOGIN_SEED {
                ns.mark_seeded();
            } else if queue.len() >= 4 {
                let mut seed = [0u8; 4];
                queue.dequeue(&mut seed);
                let seed = u32::from_be_bytes(seed);
                if seed == 0 {
                    return Step::Dispose("Invalid client detected");
                }
                ns.set_seed(seed);
            } else {
                return Step::Stop;
            }
        }

        if queue.is_empty() {
            return Step::Stop;
        }

        let id = queue.peek_packet_id();
        let Some(handler) = self.handlers.get(id, ns.features()) else {
            let mut data = vec![0u8; queue.len()];
            queue.dequeue(&mut data);
            return Step::Unknown(data);
        };

        let length = match handler.length() {
            PacketLength::Fixed(length) => length.max(1),
            PacketLength::Dynamic | PacketLength::Variable => {
                if queue.len() < 3 {
                    return Step::Stop;
                }
                let length = usize::from(queue.peek_packet_length());
                if length < 3 {
                    return Step::Dispose("Bad packet length");
                }
                length
            }
        };

        if queue.len() < length {
            return Step::Stop;
        }

        let mut buffer = ns.ctx().pools.processor.acquire_sized(length);
        queue.dequeue(&mut buffer[..length]);
        Step::Packet {
            handler,
            buffer,
            length,
        }
    }

    fn dispatch(&self, ns: &Arc<NetState>, handler: &PacketHandler, data: &[u8]) {
        if handler.ingame() && !ns.in_game() {
            debug!(
                "🚫 Client: {}: Sent in-game packet 0x{:02X} before entering the world",
                ns,
                handler.id()
            );
            return;
        }
        if !handler.allows(ns) {
            debug!("⏱️ Client: {}: Packet 0x{:02X} throttled", ns, handler.id());
            return;
        }

        let mut reader = PacketReader::new(data, handler.length().reads_header());
        handler.invoke(ns, &mut reader);
    }
}
