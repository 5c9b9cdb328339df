//! Outbound messages used by the transport core and its callers.
//!
//! These are the packets the core itself needs (ping acknowledgement, speech
//! and localized system text) plus [`WorldItem`], the canonical example of a
//! logical message with several wire formats chosen per connection by its
//! negotiated [`ProtocolFeatures`].

use crate::error::PacketError;
use crate::packet::{Packet, StaticPacket, StaticPacketCache};
use crate::version::ProtocolFeatures;
use std::sync::Arc;

/// Serial used for messages that do not come from a world object.
pub const SYSTEM_SERIAL: u32 = 0xFFFF_FFFF;
/// Graphic used for messages that do not come from a world object.
pub const SYSTEM_GRAPHIC: u16 = 0xFFFF;
/// Hue clients render as the default system colour.
pub const DEFAULT_SYSTEM_HUE: u16 = 0x3B2;
/// Font clients use for system text.
pub const DEFAULT_FONT: u16 = 3;

/// Something that can be turned into a single outbound packet.
pub trait OutgoingMessage {
    fn to_packet(&self) -> Packet;
}

/// Speech and message rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum MessageType {
    #[default]
    Regular = 0x00,
    System = 0x01,
    Emote = 0x02,
    Label = 0x06,
    Focus = 0x07,
    Whisper = 0x08,
    Yell = 0x09,
    Spell = 0x0A,
    Guild = 0x0D,
    Alliance = 0x0E,
    Command = 0x0F,
    Encoded = 0xC0,
}

/// Ping reply echoing the client's sequence byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingAck {
    pub sequence: u8,
}

impl OutgoingMessage for PingAck {
    fn to_packet(&self) -> Packet {
        let mut packet = Packet::fixed(0x73, 2);
        packet.stream().write_u8(self.sequence);
        packet
    }
}

/// Fields shared by the speech-style messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub serial: u32,
    pub graphic: u16,
    pub kind: MessageType,
    pub hue: u16,
    pub font: u16,
    pub name: String,
}

impl MessageHeader {
    /// Header for text that comes from the server rather than an object.
    pub fn system() -> Self {
        Self {
            serial: SYSTEM_SERIAL,
            graphic: SYSTEM_GRAPHIC,
            kind: MessageType::Regular,
            hue: DEFAULT_SYSTEM_HUE,
            font: DEFAULT_FONT,
            name: "System".to_string(),
        }
    }

    fn write_prefix(&self, packet: &mut Packet, hue: u16) {
        let stream = packet.stream();
        stream.write_u32(self.serial);
        stream.write_u16(self.graphic);
        stream.write_u8(self.kind as u8);
        stream.write_u16(hue);
        stream.write_u16(self.font);
    }
}

/// Single-byte speech (0x1C).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiMessage {
    pub header: MessageHeader,
    pub text: String,
}

impl OutgoingMessage for AsciiMessage {
    fn to_packet(&self) -> Packet {
        let mut packet = Packet::dynamic(0x1C, 45 + self.text.len());
        self.header.write_prefix(&mut packet, self.header.hue);
        packet.stream().write_ascii_fixed(&self.header.name, 30);
        packet.stream().write_ascii_null(&self.text);
        packet
    }
}

/// UTF-16 speech with a language code (0xAE).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnicodeMessage {
    pub header: MessageHeader,
    /// Three letter language code, e.g. `ENU`
    pub language: String,
    pub text: String,
}

impl OutgoingMessage for UnicodeMessage {
    fn to_packet(&self) -> Packet {
        let language = if self.language.is_empty() {
            "ENU"
        } else {
            &self.language
        };
        let mut packet = Packet::dynamic(0xAE, 50 + self.text.len() * 2);
        self.header.write_prefix(&mut packet, self.header.hue);
        packet.stream().write_ascii_fixed(language, 4);
        packet.stream().write_ascii_fixed(&self.header.name, 30);
        packet.stream().write_big_uni_null(&self.text);
        packet
    }
}

/// Client-side localized text looked up by number (0xC1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLocalized {
    pub header: MessageHeader,
    pub number: u32,
    /// Tab separated arguments substituted into the localized text
    pub args: String,
}

impl OutgoingMessage for MessageLocalized {
    fn to_packet(&self) -> Packet {
        let hue = if self.header.hue == 0 {
            DEFAULT_SYSTEM_HUE
        } else {
            self.header.hue
        };
        let mut packet = Packet::dynamic(0xC1, 50 + self.args.len() * 2);
        self.header.write_prefix(&mut packet, hue);
        packet.stream().write_u32(self.number);
        packet.stream().write_ascii_fixed(&self.header.name, 30);
        packet.stream().write_little_uni_null(&self.args);
        packet
    }
}

/// Frequently sent localized system lines, compiled once and shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemMessage {
    /// "Target cannot be seen."
    CannotSee,
    /// "That is too far away."
    TooFarAway,
    /// "That must be in your pack for you to use it."
    MustBeInPack,
}

impl SystemMessage {
    /// Localization number of the line.
    pub fn number(self) -> u32 {
        match self {
            SystemMessage::CannotSee => 500_237,
            SystemMessage::TooFarAway => 500_446,
            SystemMessage::MustBeInPack => 1_042_001,
        }
    }

    pub fn message(self) -> MessageLocalized {
        MessageLocalized {
            header: MessageHeader::system(),
            number: self.number(),
            args: String::new(),
        }
    }

    /// Shared compiled form of the line, built on first use.
    pub fn static_packet(
        self,
        cache: &StaticPacketCache<SystemMessage>,
    ) -> Result<Arc<StaticPacket>, PacketError> {
        cache.get_or_create(self, || self.message().to_packet())
    }
}

/// An item lying in the world, sent when it comes into view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorldItem {
    pub serial: u32,
    pub item_id: u16,
    pub amount: u16,
    pub x: u16,
    pub y: u16,
    pub z: i8,
    /// Facing for directional items, light level for light sources
    pub direction: u8,
    pub hue: u16,
    pub flags: u8,
    /// Whether `item_id` names a multi (house, boat) rather than an item
    pub multi: bool,
}

impl WorldItem {
    /// Builds the wire format the connection's features call for.
    pub fn to_packet(&self, features: ProtocolFeatures) -> Packet {
        if features.contains(ProtocolFeatures::HIGH_SEAS) {
            self.build_extended(true)
        } else if features.contains(ProtocolFeatures::STYGIAN_ABYSS) {
            self.build_extended(false)
        } else {
            self.build_legacy()
        }
    }

    /// Pre Stygian Abyss format (0x1A) where optional fields are signalled
    /// by flag bits packed into the serial and coordinates.
    fn build_legacy(&self) -> Packet {
        let mut packet = Packet::dynamic(0x1A, 20);
        let stream = packet.stream();

        let mut serial = self.serial & 0x7FFF_FFFF;
        if self.amount != 0 {
            serial |= 0x8000_0000;
        }
        stream.write_u32(serial);

        let item_id = if self.multi {
            (self.item_id & 0x3FFF) | 0x4000
        } else {
            self.item_id & 0x3FFF
        };
        stream.write_u16(item_id);

        if self.amount != 0 {
            stream.write_u16(self.amount);
        }

        let mut x = self.x & 0x7FFF;
        if self.direction != 0 {
            x |= 0x8000;
        }
        stream.write_u16(x);

        let mut y = self.y & 0x3FFF;
        if self.hue != 0 {
            y |= 0x8000;
        }
        if self.flags != 0 {
            y |= 0x4000;
        }
        stream.write_u16(y);

        if self.direction != 0 {
            stream.write_u8(self.direction);
        }
        stream.write_i8(self.z);
        if self.hue != 0 {
            stream.write_u16(self.hue);
        }
        if self.flags != 0 {
            stream.write_u8(self.flags);
        }
        packet
    }

    /// Fixed layout (0xF3) used from Stygian Abyss on. High Seas clients
    /// expect two trailing bytes.
    fn build_extended(&self, high_seas: bool) -> Packet {
        let mut packet = Packet::fixed(0xF3, if high_seas { 26 } else { 24 });
        let stream = packet.stream();
        stream.write_u16(0x0001);
        stream.write_u8(if self.multi { 0x02 } else { 0x00 });
        stream.write_u32(self.serial);
        stream.write_u16(self.item_id & 0x3FFF);
        stream.write_u8(0);
        stream.write_u16(self.amount);
        stream.write_u16(self.amount);
        stream.write_u16(self.x & 0x7FFF);
        stream.write_u16(self.y & 0x3FFF);
        stream.write_i8(self.z);
        stream.write_u8(self.direction);
        stream.write_u16(self.hue);
        stream.write_u8(self.flags);
        if high_seas {
            stream.write_u16(0);
        }
        packet
    }
}
