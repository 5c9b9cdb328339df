//! Handlers for the packets the transport itself answers: keep-alive pings,
//! the login seed and the client version report.

use super::{PacketHandlers, PacketLength};
use crate::connection::NetState;
use shard_protocol::messages::PingAck;
use shard_protocol::{ClientVersion, PacketReader};
use std::sync::Arc;
use tracing::{debug, warn};

pub const PING: u8 = 0x73;
pub const CLIENT_VERSION: u8 = 0xBD;
pub const LOGIN_SEED: u8 = 0xEF;

/// Registers the transport-level handlers.
pub fn register_core_handlers(handlers: &PacketHandlers) {
    handlers.register(PING, PacketLength::Fixed(2), false, ping);
    handlers.register(CLIENT_VERSION, PacketLength::Dynamic, false, client_version);
    handlers.register(LOGIN_SEED, PacketLength::Fixed(21), false, login_seed);
}

fn ping(ns: &Arc<NetState>, reader: &mut PacketReader<'_>) {
    let sequence = reader.read_u8();
    ns.send_message(&PingAck { sequence });
}

fn client_version(ns: &Arc<NetState>, reader: &mut PacketReader<'_>) {
    let text = reader.read_ascii_safe();
    match text.parse::<ClientVersion>() {
        Ok(version) => {
            debug!("Client: {}: Reported version {}", ns, version);
            ns.set_version(version);
        }
        Err(e) => warn!("⚠️ Client: {}: {}", ns, e),
    }
}

fn login_seed(ns: &Arc<NetState>, reader: &mut PacketReader<'_>) {
    let seed = reader.read_u32();
    if seed == 0 {
        warn!("🚫 Client: {}: Invalid client detected, disconnecting", ns);
        ns.dispose(false);
        return;
    }

    let major = reader.read_u32();
    let minor = reader.read_u32();
    let revision = reader.read_u32();
    let patch = reader.read_u32();

    ns.set_seed(seed);
    ns.set_version(ClientVersion::new(major, minor, revision, patch));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{context, detached, small_config};
    use shard_protocol::ProtocolFeatures;

    fn handlers() -> PacketHandlers {
        let handlers = PacketHandlers::new();
        register_core_handlers(&handlers);
        handlers
    }

    #[test]
    fn test_ping_is_echoed() {
        let handlers = handlers();
        let ctx = context(&small_config());
        let (ns, mut grams) = detached(&ctx, 1);

        let ping = handlers.get(PING, ProtocolFeatures::empty()).unwrap();
        ping.invoke(&ns, &mut PacketReader::new(&[0x73, 0x2A], true));
        assert!(ns.flush());
        assert_eq!(grams.try_recv().unwrap().as_bytes(), &[0x73, 0x2A]);
    }

    #[test]
    fn test_seed_packet_sets_seed_and_version() {
        let handlers = handlers();
        let ctx = context(&small_config());
        let (ns, _grams) = detached(&ctx, 1);

        let mut packet = vec![0xEF];
        for value in [0xC0A8_0001u32, 7, 0, 15, 1] {
            packet.extend_from_slice(&value.to_be_bytes());
        }
        let handler = handlers.get(LOGIN_SEED, ProtocolFeatures::empty()).unwrap();
        assert_eq!(handler.length(), PacketLength::Fixed(packet.len()));
        handler.invoke(&ns, &mut PacketReader::new(&packet, true));

        assert_eq!(ns.seed(), 0xC0A8_0001);
        assert_eq!(ns.version(), Some(ClientVersion::new(7, 0, 15, 1)));
        assert!(ns.features().contains(ProtocolFeatures::NEW_CHARACTER_LIST));
    }

    #[test]
    fn test_zero_seed_disposes() {
        let handlers = handlers();
        let ctx = context(&small_config());
        let (ns, _grams) = detached(&ctx, 1);

        let packet = [0xEF; 1].iter().copied().chain([0u8; 20]).collect::<Vec<_>>();
        handlers
            .get(LOGIN_SEED, ProtocolFeatures::empty())
            .unwrap()
            .invoke(&ns, &mut PacketReader::new(&packet, true));
        assert!(ns.is_disposing());
    }

    #[test]
    fn test_client_version_string() {
        let handlers = handlers();
        let ctx = context(&small_config());
        let (ns, _grams) = detached(&ctx, 1);

        let mut packet = vec![0xBD, 0x00, 0x00];
        packet.extend_from_slice(b"5.0.2b\0");
        packet[2] = packet.len() as u8;
        handlers
            .get(CLIENT_VERSION, ProtocolFeatures::empty())
            .unwrap()
            .invoke(&ns, &mut PacketReader::new(&packet, false));

        assert_eq!(ns.version(), Some(ClientVersion::new(5, 0, 2, 2)));
        assert!(ns.features().contains(ProtocolFeatures::BUFF_ICON));
        assert!(!ns.features().uses_current_handlers());
    }
}
