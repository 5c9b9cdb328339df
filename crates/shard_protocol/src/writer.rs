//! Cursor-based encoding of outbound packets.
//!
//! [`PacketWriter`] behaves like a seekable in-memory stream: writes land at
//! the cursor, overwriting existing bytes and extending the buffer when they
//! run past its end. Seeking back is how a dynamic packet patches its length
//! field once the body is complete.

use std::io::SeekFrom;

/// Growable big-endian packet encoder.
#[derive(Debug, Clone, Default)]
pub struct PacketWriter {
    data: Vec<u8>,
    position: usize,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            position: 0,
        }
    }

    /// Total bytes written, independent of the cursor.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Moves the cursor and returns the new position.
    ///
    /// Positions before the start clamp to zero. Seeking past the end is
    /// allowed; the gap is zero-filled by the next write.
    pub fn seek(&mut self, pos: SeekFrom) -> usize {
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.data.len() as i64 + offset,
        };
        self.position = target.max(0) as usize;
        self.position
    }

    /// Writes raw bytes at the cursor.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_be_bytes());
    }

    /// Writes `count` zero bytes.
    pub fn fill(&mut self, count: usize) {
        let end = self.position + count;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.position..end].fill(0);
        self.position = end;
    }

    /// ASCII followed by a null byte. Non-ASCII characters become `?`.
    pub fn write_ascii_null(&mut self, value: &str) {
        let bytes: Vec<u8> = value.chars().map(ascii_byte).collect();
        self.write_bytes(&bytes);
        self.write_u8(0);
    }

    /// ASCII truncated or zero-padded to exactly `size` bytes.
    pub fn write_ascii_fixed(&mut self, value: &str, size: usize) {
        let mut bytes: Vec<u8> = value.chars().take(size).map(ascii_byte).collect();
        bytes.resize(size, 0);
        self.write_bytes(&bytes);
    }

    /// Big-endian UTF-16 followed by a null code unit.
    pub fn write_big_uni_null(&mut self, value: &str) {
        for unit in value.encode_utf16() {
            self.write_u16(unit);
        }
        self.write_u16(0);
    }

    /// Big-endian UTF-16 truncated or zero-padded to `size` code units.
    pub fn write_big_uni_fixed(&mut self, value: &str, size: usize) {
        let written = value.encode_utf16().take(size).fold(0, |count, unit| {
            self.write_u16(unit);
            count + 1
        });
        self.fill((size - written) * 2);
    }

    /// Little-endian UTF-16 followed by a null code unit.
    pub fn write_little_uni_null(&mut self, value: &str) {
        for unit in value.encode_utf16() {
            self.write_bytes(&unit.to_le_bytes());
        }
        self.write_u16(0);
    }

    /// Little-endian UTF-16 truncated or zero-padded to `size` code units.
    pub fn write_little_uni_fixed(&mut self, value: &str, size: usize) {
        let written = value.encode_utf16().take(size).fold(0, |count, unit| {
            self.write_bytes(&unit.to_le_bytes());
            count + 1
        });
        self.fill((size - written) * 2);
    }

    /// UTF-8 followed by a null byte.
    pub fn write_utf8_null(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
        self.write_u8(0);
    }

    /// UTF-8 truncated or zero-padded to exactly `size` bytes.
    ///
    /// Truncation never splits a character.
    pub fn write_utf8_fixed(&mut self, value: &str, size: usize) {
        let mut cut = value.len().min(size);
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        self.write_bytes(&value.as_bytes()[..cut]);
        self.fill(size - cut);
    }
}

fn ascii_byte(c: char) -> u8 {
    if c.is_ascii() {
        c as u8
    } else {
        b'?'
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::PacketReader;

    #[test]
    fn test_integers_are_big_endian() {
        let mut writer = PacketWriter::new();
        writer.write_u16(0x1234);
        writer.write_i32(-2);
        writer.write_bool(true);
        assert_eq!(writer.as_slice(), &[0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFE, 0x01]);
    }

    #[test]
    fn test_seek_back_patches_in_place() {
        let mut writer = PacketWriter::new();
        writer.write_u8(0xAE);
        writer.write_u16(0);
        writer.write_bytes(&[1, 2, 3]);

        let end = writer.position();
        writer.seek(SeekFrom::Start(1));
        writer.write_u16(end as u16);
        writer.seek(SeekFrom::End(0));

        assert_eq!(writer.as_slice(), &[0xAE, 0x00, 0x06, 1, 2, 3]);
        assert_eq!(writer.position(), 6);
    }

    #[test]
    fn test_seek_past_end_zero_fills_gap() {
        let mut writer = PacketWriter::new();
        writer.write_u8(1);
        writer.seek(SeekFrom::Current(2));
        writer.write_u8(9);
        assert_eq!(writer.as_slice(), &[1, 0, 0, 9]);
    }

    #[test]
    fn test_ascii_fixed_truncates_and_pads() {
        let mut writer = PacketWriter::new();
        writer.write_ascii_fixed("abcdef", 4);
        writer.write_ascii_fixed("xy", 4);
        writer.write_ascii_fixed("ñ", 2);
        assert_eq!(writer.as_slice(), b"abcdxy\0\0?\0");
    }

    #[test]
    fn test_unicode_fixed_counts_code_units() {
        let mut writer = PacketWriter::new();
        writer.write_big_uni_fixed("hello", 3);
        writer.write_little_uni_fixed("a", 2);
        assert_eq!(
            writer.as_slice(),
            &[0, b'h', 0, b'e', 0, b'l', b'a', 0, 0, 0]
        );
    }

    #[test]
    fn test_utf8_fixed_respects_char_boundary() {
        let mut writer = PacketWriter::new();
        writer.write_utf8_fixed("aé", 2);
        assert_eq!(writer.as_slice(), &[b'a', 0]);
    }

    #[test]
    fn test_strings_read_back() {
        let mut writer = PacketWriter::new();
        writer.write_u8(0x00);
        writer.write_ascii_null("name");
        writer.write_big_uni_null("Grüße");
        writer.write_little_uni_null("args\tmore");
        writer.write_utf8_null("✓ ok");
        writer.write_ascii_fixed("Ann", 30);

        let data = writer.into_vec();
        let mut reader = PacketReader::new(&data, true);
        assert_eq!(reader.read_ascii(), "name");
        assert_eq!(reader.read_unicode(), "Grüße");
        assert_eq!(reader.read_unicode_le(), "args\tmore");
        assert_eq!(reader.read_utf8(), "✓ ok");
        assert_eq!(reader.read_ascii_fixed(30), "Ann");
        assert_eq!(reader.remaining(), 0);
    }
}
