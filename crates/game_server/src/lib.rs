//! # Game Server - Shard Network Core
//!
//! The transport of a persistent multiplayer shard: accepting client TCP
//! connections, framing and dispatching the binary client protocol, and
//! queueing and coalescing outgoing data for thousands of long-lived
//! connections.
//!
//! ## Design Philosophy
//!
//! The network core contains **NO game logic**. Game code plugs in at three
//! points:
//!
//! * **Packet handlers** - callbacks registered per opcode in [`PacketHandlers`]
//! * **Connection events** - [`ConnectionEvents`] reports connects and hands
//!   back everything a disconnected client left open
//! * **Outgoing packets** - built with `shard_protocol` and sent through a
//!   [`NetState`]
//!
//! ## Architecture Overview
//!
//! ### Threads
//!
//! Socket I/O runs on tokio worker tasks, two per connection. Everything that
//! touches game state runs on the one thread calling
//! [`NetworkCore::slice`], either the built-in server tick or the game's own
//! simulation loop.
//!
//! ### Message Flow
//!
//! 1. The listener admits a socket and queues it
//! 2. `slice` creates its [`NetState`] and starts its socket tasks
//! 3. The receive task appends bytes to the connection's inbound queue and
//!    queues the connection for the pump
//! 4. `slice` frames complete packets and invokes their handlers
//! 5. Handlers send packets, which are coalesced into grams and written by
//!    the send task; `flush_all` pushes out partially filled grams
//!
//! ### Disposal
//!
//! Any party may dispose a connection at any time. Disposal is idempotent,
//! never blocks and defers the cleanup visible to game logic to the next
//! `slice`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use game_server::{GameServer, PacketLength, ServerConfig};
//!
//! # async fn run() -> Result<(), game_server::ServerError> {
//! let server = GameServer::new(ServerConfig::default())?;
//! server.handlers().register(0x02, PacketLength::Fixed(7), true, |ns, reader| {
//!     let _direction = reader.read_u8();
//!     let _sequence = reader.read_u8();
//!     let _ = ns;
//! });
//! server.start().await
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Only failures that stop the server surface as [`ServerError`]. Everything
//! per connection (I/O errors, protocol violations, exceeded caps) disposes
//! that one connection and is logged.

// Re-export core types for easy access
pub use config::{AncillaryLimits, PoolConfig, ServerConfig};
pub use connection::{
    ConnectionId, ConnectionState, Detached, GumpHandle, HuePickerHandle, MenuHandle, NetContext,
    NetState, PauseGate, Serial, TradeHandle,
};
pub use error::ServerError;
pub use handlers::{PacketHandler, PacketHandlers, PacketLength};
pub use listener::{AdmissionHook, AdmissionHooks, Firewall, IpLimiter, Listener};
pub use pump::MessagePump;
pub use server::{ConnectionEvents, GameServer, NetworkCore, NetworkStats, NoopEvents};

// Public module declarations
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod listener;
pub mod pump;
pub mod server;
