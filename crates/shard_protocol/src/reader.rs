//! Cursor-based decoding of inbound packets.
//!
//! Every read is bounds checked against the packet slice. A read that runs
//! past the end yields `0`, `false` or an empty value and parks the cursor at
//! the end instead of faulting, so a truncated or hostile packet can only
//! ever produce default values for its handler.

use std::fmt::{self, Display, Write as _};
use std::io::SeekFrom;
use tracing::debug;

/// Lowest character kept by the `_safe` string reads.
const SAFE_MIN: u32 = 0x20;
/// First character dropped at the top of the range by the `_safe` reads.
const SAFE_MAX: u32 = 0xFFFE;

/// Character encoding of a string field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    /// One byte per character
    Ascii,
    /// UTF-16, big-endian code units
    BigUnicode,
    /// UTF-16, little-endian code units
    LittleUnicode,
    Utf8,
}

impl StringEncoding {
    /// Width of one character (or code unit) in bytes.
    fn unit(self) -> usize {
        match self {
            StringEncoding::BigUnicode | StringEncoding::LittleUnicode => 2,
            StringEncoding::Ascii | StringEncoding::Utf8 => 1,
        }
    }
}

/// Sequential reader over one framed packet.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> PacketReader<'a> {
    /// Creates a reader over a complete packet.
    ///
    /// # Arguments
    ///
    /// * `data` - The whole packet including its opcode
    /// * `fixed_header` - `true` to start after the opcode, `false` to also
    ///   skip the two byte length field of a dynamic packet
    pub fn new(data: &'a [u8], fixed_header: bool) -> Self {
        let start = if fixed_header { 1 } else { 3 };
        Self {
            data,
            index: start.min(data.len()),
        }
    }

    /// The whole packet buffer, independent of the cursor.
    pub fn buffer(&self) -> &'a [u8] {
        self.data
    }

    /// Opcode of the packet, or 0 for an empty buffer.
    pub fn packet_id(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current cursor position.
    pub fn position(&self) -> usize {
        self.index
    }

    /// Bytes left between the cursor and the end.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.index
    }

    /// Moves the cursor, clamping to the packet bounds, and returns the new
    /// position.
    pub fn seek(&mut self, pos: SeekFrom) -> usize {
        let len = self.data.len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset.min(len as u64) as i64,
            SeekFrom::Current(offset) => (self.index as i64).saturating_add(offset),
            SeekFrom::End(offset) => len.saturating_add(offset),
        };
        self.index = target.clamp(0, len) as usize;
        self.index
    }

    /// Takes exactly `N` bytes, or parks the cursor at the end and returns
    /// `None` when fewer remain.
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        match self.data.get(self.index..self.index + N) {
            Some(bytes) => {
                self.index += N;
                bytes.try_into().ok()
            }
            None => {
                self.index = self.data.len();
                None
            }
        }
    }

    pub fn read_u8(&mut self) -> u8 {
        self.take::<1>().map_or(0, |b| b[0])
    }

    pub fn read_i8(&mut self) -> i8 {
        self.read_u8() as i8
    }

    pub fn read_bool(&mut self) -> bool {
        self.read_u8() != 0
    }

    pub fn read_u16(&mut self) -> u16 {
        self.take::<2>().map_or(0, u16::from_be_bytes)
    }

    pub fn read_i16(&mut self) -> i16 {
        self.take::<2>().map_or(0, i16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> u32 {
        self.take::<4>().map_or(0, u32::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> i32 {
        self.take::<4>().map_or(0, i32::from_be_bytes)
    }

    /// Reads `count` raw bytes, or an empty slice when fewer remain.
    pub fn read_bytes(&mut self, count: usize) -> &'a [u8] {
        let bytes = self
            .index
            .checked_add(count)
            .and_then(|end| self.data.get(self.index..end));
        match bytes {
            Some(bytes) => {
                self.index += count;
                bytes
            }
            None => {
                self.index = self.data.len();
                &[]
            }
        }
    }

    /// Reads a string in `encoding`.
    ///
    /// # Arguments
    ///
    /// * `encoding` - Wire encoding of the field
    /// * `fixed` - `Some(n)` for a field of `n` characters that always
    ///   consumes its full width, `None` for a null-terminated field
    /// * `safe` - Drop characters outside `[0x20, 0xFFFE)`
    pub fn read_string(&mut self, encoding: StringEncoding, fixed: Option<usize>, safe: bool) -> String {
        let unit = encoding.unit();
        let start = self.index;
        let bound = match fixed {
            Some(chars) => chars
                .checked_mul(unit)
                .and_then(|width| start.checked_add(width))
                .map_or(self.data.len(), |end| end.min(self.data.len())),
            None => self.data.len(),
        };

        // Find the terminator on a code-unit boundary.
        let mut end = start;
        while end + unit <= bound {
            if self.data[end..end + unit].iter().all(|&b| b == 0) {
                break;
            }
            end += unit;
        }
        let terminated = end + unit <= bound;
        let raw = &self.data[start..end];

        self.index = match fixed {
            Some(_) => bound,
            None if terminated => end + unit,
            None => bound,
        };

        let text = decode(encoding, raw);
        if safe {
            text.chars()
                .filter(|&c| (SAFE_MIN..SAFE_MAX).contains(&(c as u32)))
                .collect()
        } else {
            text
        }
    }

    /// Null-terminated ASCII.
    pub fn read_ascii(&mut self) -> String {
        self.read_string(StringEncoding::Ascii, None, false)
    }

    pub fn read_ascii_safe(&mut self) -> String {
        self.read_string(StringEncoding::Ascii, None, true)
    }

    /// ASCII padded to `len` bytes.
    pub fn read_ascii_fixed(&mut self, len: usize) -> String {
        self.read_string(StringEncoding::Ascii, Some(len), false)
    }

    pub fn read_ascii_fixed_safe(&mut self, len: usize) -> String {
        self.read_string(StringEncoding::Ascii, Some(len), true)
    }

    /// Null-terminated big-endian UTF-16.
    pub fn read_unicode(&mut self) -> String {
        self.read_string(StringEncoding::BigUnicode, None, false)
    }

    pub fn read_unicode_safe(&mut self) -> String {
        self.read_string(StringEncoding::BigUnicode, None, true)
    }

    /// Big-endian UTF-16 padded to `chars` code units.
    pub fn read_unicode_fixed(&mut self, chars: usize) -> String {
        self.read_string(StringEncoding::BigUnicode, Some(chars), false)
    }

    pub fn read_unicode_fixed_safe(&mut self, chars: usize) -> String {
        self.read_string(StringEncoding::BigUnicode, Some(chars), true)
    }

    /// Null-terminated little-endian UTF-16.
    pub fn read_unicode_le(&mut self) -> String {
        self.read_string(StringEncoding::LittleUnicode, None, false)
    }

    pub fn read_unicode_le_safe(&mut self) -> String {
        self.read_string(StringEncoding::LittleUnicode, None, true)
    }

    pub fn read_unicode_le_fixed(&mut self, chars: usize) -> String {
        self.read_string(StringEncoding::LittleUnicode, Some(chars), false)
    }

    pub fn read_unicode_le_fixed_safe(&mut self, chars: usize) -> String {
        self.read_string(StringEncoding::LittleUnicode, Some(chars), true)
    }

    /// Null-terminated UTF-8. Invalid sequences decode to U+FFFD.
    pub fn read_utf8(&mut self) -> String {
        self.read_string(StringEncoding::Utf8, None, false)
    }

    pub fn read_utf8_safe(&mut self) -> String {
        self.read_string(StringEncoding::Utf8, None, true)
    }

    pub fn read_utf8_fixed(&mut self, len: usize) -> String {
        self.read_string(StringEncoding::Utf8, Some(len), false)
    }

    /// Hex-dumps the whole packet on the `packet_trace` target.
    pub fn trace(&self, source: impl Display) {
        debug!(
            target: "packet_trace",
            "🔍 Client: {}: Unhandled packet 0x{:02X} ({} bytes)\n{}",
            source,
            self.packet_id(),
            self.data.len(),
            HexDump(self.data)
        );
    }
}

fn decode(encoding: StringEncoding, raw: &[u8]) -> String {
    match encoding {
        StringEncoding::Ascii => raw.iter().map(|&b| b as char).collect(),
        StringEncoding::Utf8 => String::from_utf8_lossy(raw).into_owned(),
        StringEncoding::BigUnicode => decode_utf16(raw, u16::from_be_bytes),
        StringEncoding::LittleUnicode => decode_utf16(raw, u16::from_le_bytes),
    }
}

fn decode_utf16(raw: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units = raw.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Classic 16-bytes-per-row hex dump with an ASCII gutter.
pub struct HexDump<'a>(pub &'a [u8]);

impl Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (row, chunk) in self.0.chunks(16).enumerate() {
            let mut hex = String::with_capacity(48);
            for (i, byte) in chunk.iter().enumerate() {
                if i == 8 {
                    hex.push(' ');
                }
                let _ = write!(hex, "{:02X} ", byte);
            }
            let ascii: String = chunk
                .iter()
                .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '.' })
                .collect();
            writeln!(f, "{:04X}   {:<49} {}", row * 16, hex, ascii)?;
        }
        Ok(())
    }
}
