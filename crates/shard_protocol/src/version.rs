//! Client versions and the protocol features they imply.

use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A client build number such as `7.0.15.1` or `5.0.2b`.
///
/// Ordering compares the components left to right, so a newer build always
/// compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClientVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    pub patch: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid client version '{0}'")]
pub struct ParseVersionError(pub String);

impl ClientVersion {
    pub const fn new(major: u32, minor: u32, revision: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            revision,
            patch,
        }
    }

    /// Features every client of this version or newer supports.
    pub fn features(&self) -> ProtocolFeatures {
        ProtocolFeatures::for_version(self)
    }
}

impl FromStr for ClientVersion {
    type Err = ParseVersionError;

    /// Accepts `a.b.c.d` and the older lettered `a.b.cX` form, where the
    /// letter `a` through `z` becomes patch 1 through 26.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseVersionError(s.to_string());
        let parts: Vec<&str> = s.trim().split('.').collect();

        let number = |part: &str| part.parse::<u32>().map_err(|_| invalid());

        match parts.as_slice() {
            [major, minor, revision, patch] => Ok(Self::new(
                number(major)?,
                number(minor)?,
                number(revision)?,
                number(patch)?,
            )),
            [major, minor, revision] => {
                let digits = revision.trim_end_matches(|c: char| c.is_ascii_alphabetic());
                let letters = &revision[digits.len()..];
                let patch = match letters.as_bytes() {
                    [] => 0,
                    [letter] => (letter.to_ascii_lowercase() - b'a' + 1) as u32,
                    _ => return Err(invalid()),
                };
                Ok(Self::new(number(major)?, number(minor)?, number(digits)?, patch))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.major < 6 && (1..=26).contains(&self.patch) {
            let letter = (b'a' + (self.patch - 1) as u8) as char;
            write!(f, "{}.{}.{}{}", self.major, self.minor, self.revision, letter)
        } else {
            write!(
                f,
                "{}.{}.{}.{}",
                self.major, self.minor, self.revision, self.patch
            )
        }
    }
}

bitflags! {
    /// Protocol capabilities negotiated from the client version.
    ///
    /// The set is monotone: a client has every feature of every older
    /// threshold it meets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProtocolFeatures: u32 {
        const NEW_SPELLBOOK = 1 << 0;
        const DAMAGE_PACKET = 1 << 1;
        const UNPACK = 1 << 2;
        const BUFF_ICON = 1 << 3;
        const NEW_HAVEN = 1 << 4;
        const CONTAINER_GRID_LINES = 1 << 5;
        const EXTENDED_SUPPORTED_FEATURES = 1 << 6;
        const STYGIAN_ABYSS = 1 << 7;
        const HIGH_SEAS = 1 << 8;
        const NEW_CHARACTER_LIST = 1 << 9;
        const NEW_CHARACTER_CREATION = 1 << 10;
    }
}

/// First version granting each feature, oldest first.
const THRESHOLDS: [(ClientVersion, ProtocolFeatures); 11] = [
    (ClientVersion::new(4, 0, 0, 1), ProtocolFeatures::NEW_SPELLBOOK),
    (ClientVersion::new(4, 0, 7, 1), ProtocolFeatures::DAMAGE_PACKET),
    (ClientVersion::new(5, 0, 0, 1), ProtocolFeatures::UNPACK),
    (ClientVersion::new(5, 0, 2, 2), ProtocolFeatures::BUFF_ICON),
    (ClientVersion::new(6, 0, 0, 0), ProtocolFeatures::NEW_HAVEN),
    (ClientVersion::new(6, 0, 1, 7), ProtocolFeatures::CONTAINER_GRID_LINES),
    (ClientVersion::new(6, 0, 14, 2), ProtocolFeatures::EXTENDED_SUPPORTED_FEATURES),
    (ClientVersion::new(7, 0, 0, 0), ProtocolFeatures::STYGIAN_ABYSS),
    (ClientVersion::new(7, 0, 9, 0), ProtocolFeatures::HIGH_SEAS),
    (ClientVersion::new(7, 0, 13, 0), ProtocolFeatures::NEW_CHARACTER_LIST),
    (ClientVersion::new(7, 0, 16, 0), ProtocolFeatures::NEW_CHARACTER_CREATION),
];

impl ProtocolFeatures {
    pub fn for_version(version: &ClientVersion) -> Self {
        THRESHOLDS
            .iter()
            .take_while(|(threshold, _)| version >= threshold)
            .fold(Self::empty(), |acc, (_, feature)| acc | *feature)
    }

    /// Whether packets should be dispatched through the current handler
    /// table rather than the legacy one.
    pub fn uses_current_handlers(&self) -> bool {
        self.contains(Self::CONTAINER_GRID_LINES)
    }
}
