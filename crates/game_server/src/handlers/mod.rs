//! Packet handler registry.
//!
//! Handlers are registered per opcode in two tables. The legacy table serves
//! clients older than the container grid line change, the current table
//! everything newer; which one a connection uses follows from its negotiated
//! [`ProtocolFeatures`].
//!
//! Two opcodes open a second level of dispatch: `0xBF` carries a 16-bit
//! extended sub-command, `0xD7` a serial followed by a 16-bit encoded command.
//! Both are dispatched through their own tables with their own in-game gate.
//!
//! # Example
//!
//! ```rust
//! use game_server::handlers::{PacketHandlers, PacketLength};
//!
//! let handlers = PacketHandlers::new();
//! handlers.register(0x34, PacketLength::Fixed(10), true, |ns, reader| {
//!     let _kind = reader.read_u8();
//!     let _serial = reader.read_u32();
//!     let _ = ns;
//! });
//! assert!(handlers.get(0x34, Default::default()).is_some());
//! ```

pub mod transport;

use crate::connection::NetState;
use parking_lot::RwLock;
use shard_protocol::{PacketReader, ProtocolFeatures};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub use self::transport::register_core_handlers;

/// Opcode of the extended command space.
pub const EXTENDED_COMMAND: u8 = 0xBF;

/// Opcode of the encoded command space.
pub const ENCODED_COMMAND: u8 = 0xD7;

/// Callback invoked with the connection and a reader over one packet.
pub type PacketCallback = Arc<dyn Fn(&Arc<NetState>, &mut PacketReader<'_>) + Send + Sync>;

/// Returns `false` to discard the packet.
pub type ThrottleCallback = Arc<dyn Fn(&NetState) -> bool + Send + Sync>;

/// Callback of an encoded command, given the serial the command targets.
pub type EncodedCallback = Arc<dyn Fn(&Arc<NetState>, u32, &mut PacketReader<'_>) + Send + Sync>;

/// How the length of a packet is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLength {
    /// Exactly this many bytes including the opcode. The reader starts
    /// after the opcode.
    Fixed(usize),
    /// Length taken from bytes 1..3. The reader starts after the length.
    Dynamic,
    /// Length taken from bytes 1..3. The reader starts after the opcode and
    /// the callback parses the length itself.
    Variable,
}

impl PacketLength {
    /// Whether the callback's reader starts right after the opcode.
    pub fn reads_header(self) -> bool {
        !matches!(self, PacketLength::Dynamic)
    }
}

/// A registered packet handler.
#[derive(Clone)]
pub struct PacketHandler {
    id: u8,
    length: PacketLength,
    ingame: bool,
    throttle: Option<ThrottleCallback>,
    callback: PacketCallback,
}

impl PacketHandler {
    pub fn new<F>(id: u8, length: PacketLength, ingame: bool, callback: F) -> Self
    where
        F: Fn(&Arc<NetState>, &mut PacketReader<'_>) + Send + Sync + 'static,
    {
        Self {
            id,
            length,
            ingame,
            throttle: None,
            callback: Arc::new(callback),
        }
    }

    pub fn with_throttle(mut self, throttle: ThrottleCallback) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn length(&self) -> PacketLength {
        self.length
    }

    /// Whether the packet is only accepted from connections in game.
    pub fn ingame(&self) -> bool {
        self.ingame
    }

    /// Whether the throttle, if any, lets the packet through.
    pub fn allows(&self, ns: &NetState) -> bool {
        self.throttle.as_ref().map_or(true, |throttle| throttle(ns))
    }

    pub fn invoke(&self, ns: &Arc<NetState>, reader: &mut PacketReader<'_>) {
        (self.callback)(ns, reader)
    }
}

impl fmt::Debug for PacketHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketHandler")
            .field("id", &format_args!("0x{:02X}", self.id))
            .field("length", &self.length)
            .field("ingame", &self.ingame)
            .field("throttled", &self.throttle.is_some())
            .finish()
    }
}

/// A handler in the `0xBF` extended command space.
#[derive(Clone)]
pub struct ExtendedHandler {
    pub id: u16,
    pub ingame: bool,
    callback: PacketCallback,
}

/// A handler in the `0xD7` encoded command space.
#[derive(Clone)]
pub struct EncodedHandler {
    pub id: u16,
    pub ingame: bool,
    callback: EncodedCallback,
}

type HandlerTable = RwLock<Vec<Option<Arc<PacketHandler>>>>;

fn empty_table() -> HandlerTable {
    RwLock::new(vec![None; 256])
}

/// Registry of every packet handler of one server.
///
/// Lookups clone the handler's `Arc` out of the table, so no lock is held
/// while a callback runs and callbacks may register further handlers.
pub struct PacketHandlers {
    legacy: HandlerTable,
    current: HandlerTable,
    extended: Arc<RwLock<HashMap<u16, Arc<ExtendedHandler>>>>,
    encoded: Arc<RwLock<HashMap<u16, Arc<EncodedHandler>>>>,
}

impl Default for PacketHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketHandlers {
    /// Creates a registry with the extended and encoded dispatchers installed.
    pub fn new() -> Self {
        let handlers = Self {
            legacy: empty_table(),
            current: empty_table(),
            extended: Arc::new(RwLock::new(HashMap::new())),
            encoded: Arc::new(RwLock::new(HashMap::new())),
        };

        let extended = handlers.extended.clone();
        handlers.register(EXTENDED_COMMAND, PacketLength::Dynamic, false, move |ns, reader| {
            let command = reader.read_u16();
            let handler = extended.read().get(&command).cloned();
            match handler {
                Some(handler) if handler.ingame && !ns.in_game() => {
                    debug!("🚫 Client: {}: Extended command 0x{:04X} sent before entering the world", ns, command);
                }
                Some(handler) => (handler.callback)(ns, reader),
                None => {
                    debug!("❓ Client: {}: Unknown extended command 0x{:04X}", ns, command);
                    reader.trace(ns);
                }
            }
        });

        let encoded = handlers.encoded.clone();
        handlers.register(ENCODED_COMMAND, PacketLength::Dynamic, true, move |ns, reader| {
            let serial = reader.read_u32();
            let command = reader.read_u16();
            let handler = encoded.read().get(&command).cloned();
            match handler {
                Some(handler) if handler.ingame && !ns.in_game() => {
                    debug!("🚫 Client: {}: Encoded command 0x{:04X} sent before entering the world", ns, command);
                }
                Some(handler) => (handler.callback)(ns, serial, reader),
                None => {
                    debug!("❓ Client: {}: Unknown encoded command 0x{:04X}", ns, command);
                    reader.trace(ns);
                }
            }
        });

        handlers
    }

    /// Registers a handler for every client.
    ///
    /// The handler goes into the legacy table and, unless the opcode already
    /// has a current-only override, into the current table too.
    ///
    /// # Arguments
    ///
    /// * `id` - Opcode of the packet
    /// * `length` - How the packet's length is determined
    /// * `ingame` - Accept the packet only from connections with an avatar
    /// * `callback` - Invoked with the connection and a reader over the packet
    pub fn register<F>(&self, id: u8, length: PacketLength, ingame: bool, callback: F)
    where
        F: Fn(&Arc<NetState>, &mut PacketReader<'_>) + Send + Sync + 'static,
    {
        self.register_handler(PacketHandler::new(id, length, ingame, callback));
    }

    /// Registers a prebuilt handler, for instance one carrying a throttle.
    pub fn register_handler(&self, handler: PacketHandler) {
        let index = usize::from(handler.id);
        let handler = Arc::new(handler);
        self.legacy.write()[index] = Some(handler.clone());

        let mut current = self.current.write();
        if current[index].is_none() {
            current[index] = Some(handler);
        }
    }

    /// Registers a handler used only by clients on the current table.
    pub fn register_current<F>(&self, id: u8, length: PacketLength, ingame: bool, callback: F)
    where
        F: Fn(&Arc<NetState>, &mut PacketReader<'_>) + Send + Sync + 'static,
    {
        let handler = PacketHandler::new(id, length, ingame, callback);
        self.current.write()[usize::from(id)] = Some(Arc::new(handler));
    }

    /// Attaches a throttle to the handler of `id` in both tables.
    ///
    /// Returns `false` when no handler is registered for `id`.
    pub fn set_throttle(&self, id: u8, throttle: ThrottleCallback) -> bool {
        let index = usize::from(id);
        let mut found = false;
        for table in [&self.legacy, &self.current] {
            let mut table = table.write();
            if let Some(handler) = table[index].take() {
                let throttled = (*handler).clone().with_throttle(throttle.clone());
                table[index] = Some(Arc::new(throttled));
                found = true;
            }
        }
        found
    }

    pub fn register_extended<F>(&self, id: u16, ingame: bool, callback: F)
    where
        F: Fn(&Arc<NetState>, &mut PacketReader<'_>) + Send + Sync + 'static,
    {
        let handler = ExtendedHandler {
            id,
            ingame,
            callback: Arc::new(callback),
        };
        self.extended.write().insert(id, Arc::new(handler));
    }

    pub fn register_encoded<F>(&self, id: u16, ingame: bool, callback: F)
    where
        F: Fn(&Arc<NetState>, u32, &mut PacketReader<'_>) + Send + Sync + 'static,
    {
        let handler = EncodedHandler {
            id,
            ingame,
            callback: Arc::new(callback),
        };
        self.encoded.write().insert(id, Arc::new(handler));
    }

    /// Looks up the handler of `id` in the table selected by `features`.
    pub fn get(&self, id: u8, features: ProtocolFeatures) -> Option<Arc<PacketHandler>> {
        let table = if features.uses_current_handlers() {
            &self.current
        } else {
            &self.legacy
        };
        table.read()[usize::from(id)].clone()
    }

    pub fn get_extended(&self, id: u16) -> Option<Arc<ExtendedHandler>> {
        self.extended.read().get(&id).cloned()
    }

    pub fn get_encoded(&self, id: u16) -> Option<Arc<EncodedHandler>> {
        self.encoded.read().get(&id).cloned()
    }
}

impl fmt::Debug for PacketHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = |table: &HandlerTable| table.read().iter().filter(|h| h.is_some()).count();
        f.debug_struct("PacketHandlers")
            .field("legacy", &registered(&self.legacy))
            .field("current", &registered(&self.current))
            .field("extended", &self.extended.read().len())
            .field("encoded", &self.encoded.read().len())
            .finish()
    }
}
