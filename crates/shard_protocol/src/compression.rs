//! Deflate envelope for compressed connections.
//!
//! A compiled packet sent to a connection with compression enabled is wrapped
//! as:
//!
//! ```text
//! +----------------+---------------------+-----------------+
//! | u16 BE payload | u16 BE decompressed | payload bytes   |
//! +----------------+---------------------+-----------------+
//! ```
//!
//! The payload is raw deflate when that is strictly smaller than the input
//! and the input itself otherwise, so equal lengths always mean the payload is
//! stored.

use crate::error::PacketError;
use flate2::read::DeflateDecoder;
use flate2::{Compress, Compression, FlushCompress, Status};
use serde::{Deserialize, Serialize};
use std::io::Read;
use tracing::warn;

/// Size of the envelope header preceding the payload.
pub const ENVELOPE_HEADER_SIZE: usize = 4;

/// Deflate level from 0 (store) to 9 (best).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressionLevel(u32);

impl CompressionLevel {
    pub const FAST: CompressionLevel = CompressionLevel(1);
    pub const BEST: CompressionLevel = CompressionLevel(9);

    /// Creates a level, clamping to the valid range.
    pub fn new(level: u32) -> Self {
        Self(level.min(9))
    }

    pub fn level(self) -> u32 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::FAST
    }
}

impl From<CompressionLevel> for Compression {
    fn from(level: CompressionLevel) -> Self {
        Compression::new(level.0)
    }
}

/// Raw-deflates `data` into `out`. Returns the deflated length, or `None`
/// when the stream did not finish within `out`.
fn deflate_into(data: &[u8], level: CompressionLevel, out: &mut [u8]) -> Option<usize> {
    let mut compress = Compress::new(level.into(), false);
    match compress.compress(data, out, FlushCompress::Finish) {
        Ok(Status::StreamEnd) => usize::try_from(compress.total_out()).ok(),
        Ok(_) => None,
        Err(e) => {
            warn!("⚠️ Deflate failed, sending {} bytes stored: {}", data.len(), e);
            None
        }
    }
}

/// Wraps a compiled packet in the compression envelope, writing into `out`.
///
/// `out` must hold at least [`ENVELOPE_HEADER_SIZE`] plus `data.len()`
/// bytes, which is the size of the frame when the payload is stored.
///
/// # Returns
///
/// The number of bytes of `out` making up the frame.
///
/// # Errors
///
/// Returns [`PacketError::Compression`] when `data` is too long for the
/// envelope's 16-bit length fields or `out` is too small.
pub fn compress_frame_into(
    data: &[u8],
    level: CompressionLevel,
    out: &mut [u8],
) -> Result<usize, PacketError> {
    let decompressed_len = u16::try_from(data.len()).map_err(|_| {
        PacketError::Compression(format!(
            "{} bytes does not fit the envelope length field",
            data.len()
        ))
    })?;
    let frame_limit = ENVELOPE_HEADER_SIZE + data.len();
    if out.len() < frame_limit {
        return Err(PacketError::Compression(format!(
            "{} byte output cannot hold a {} byte frame",
            out.len(),
            frame_limit
        )));
    }

    // deflated output only wins when strictly smaller than the input
    let payload = &mut out[ENVELOPE_HEADER_SIZE..frame_limit];
    let payload_len = match deflate_into(data, level, payload) {
        Some(deflated) if deflated < data.len() => deflated,
        _ => {
            payload.copy_from_slice(data);
            data.len()
        }
    };

    out[0..2].copy_from_slice(&(payload_len as u16).to_be_bytes());
    out[2..4].copy_from_slice(&decompressed_len.to_be_bytes());
    Ok(ENVELOPE_HEADER_SIZE + payload_len)
}

/// Wraps a compiled packet in the compression envelope.
///
/// A deflate failure is logged and the packet is stored uncompressed instead.
///
/// # Errors
///
/// Returns [`PacketError::Compression`] when `data` is too long for the
/// envelope's 16-bit length fields.
pub fn compress_frame(data: &[u8], level: CompressionLevel) -> Result<Vec<u8>, PacketError> {
    let mut frame = vec![0u8; ENVELOPE_HEADER_SIZE + data.len()];
    let length = compress_frame_into(data, level, &mut frame)?;
    frame.truncate(length);
    Ok(frame)
}

/// Unwraps a frame produced by [`compress_frame`].
///
/// # Errors
///
/// Returns [`PacketError::MalformedFrame`] when the header is truncated, the
/// payload is shorter than declared, or inflating does not produce the
/// declared length.
pub fn decompress_frame(frame: &[u8]) -> Result<Vec<u8>, PacketError> {
    if frame.len() < ENVELOPE_HEADER_SIZE {
        return Err(PacketError::MalformedFrame(format!(
            "{} byte frame is shorter than its header",
            frame.len()
        )));
    }

    let payload_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let decompressed_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    let payload = frame
        .get(ENVELOPE_HEADER_SIZE..ENVELOPE_HEADER_SIZE + payload_len)
        .ok_or_else(|| {
            PacketError::MalformedFrame(format!(
                "declared {} payload bytes, found {}",
                payload_len,
                frame.len() - ENVELOPE_HEADER_SIZE
            ))
        })?;

    if payload_len == decompressed_len {
        return Ok(payload.to_vec());
    }

    let mut inflated = Vec::with_capacity(decompressed_len);
    DeflateDecoder::new(payload)
        .read_to_end(&mut inflated)
        .map_err(|e| PacketError::MalformedFrame(format!("inflate failed: {}", e)))?;

    if inflated.len() != decompressed_len {
        return Err(PacketError::MalformedFrame(format!(
            "inflated to {} bytes, expected {}",
            inflated.len(),
            decompressed_len
        )));
    }
    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetitive_data_is_deflated() {
        let data = vec![0x41u8; 1000];
        let frame = compress_frame(&data, CompressionLevel::FAST).unwrap();

        let payload_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        let decompressed_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        assert!(payload_len < decompressed_len);
        assert_eq!(decompressed_len, 1000);
        assert_eq!(frame.len(), ENVELOPE_HEADER_SIZE + payload_len);
        assert_eq!(decompress_frame(&frame).unwrap(), data);
    }

    #[test]
    fn test_incompressible_data_is_stored() {
        let data = [0x73u8, 0x05];
        let frame = compress_frame(&data, CompressionLevel::BEST).unwrap();
        assert_eq!(frame, vec![0x00, 0x02, 0x00, 0x02, 0x73, 0x05]);
        assert_eq!(decompress_frame(&frame).unwrap(), data);
    }

    #[test]
    fn test_level_zero_stores() {
        let data = vec![7u8; 64];
        let frame = compress_frame(&data, CompressionLevel::new(0)).unwrap();
        assert_eq!(&frame[..4], &[0x00, 0x40, 0x00, 0x40]);
    }

    #[test]
    fn test_oversized_input_rejected() {
        let data = vec![0u8; 70_000];
        assert!(matches!(
            compress_frame(&data, CompressionLevel::FAST),
            Err(PacketError::Compression(_))
        ));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(decompress_frame(&[0x00, 0x01]).is_err());
        assert!(decompress_frame(&[0x00, 0x05, 0x00, 0x05, 1, 2]).is_err());
        assert!(decompress_frame(&[0x00, 0x02, 0x00, 0x10, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_compress_into_larger_buffer() {
        let data = vec![0x41u8; 500];
        let mut out = vec![0xEEu8; 4096];
        let length = compress_frame_into(&data, CompressionLevel::FAST, &mut out).unwrap();

        assert!(length < ENVELOPE_HEADER_SIZE + data.len());
        assert_eq!(decompress_frame(&out[..length]).unwrap(), data);
        assert_eq!(compress_frame(&data, CompressionLevel::FAST).unwrap(), &out[..length]);
    }

    #[test]
    fn test_compress_into_rejects_short_buffer() {
        let mut out = [0u8; 5];
        assert!(matches!(
            compress_frame_into(&[1, 2], CompressionLevel::FAST, &mut out),
            Err(PacketError::Compression(_))
        ));
    }

    #[test]
    fn test_level_clamped() {
        assert_eq!(CompressionLevel::new(42).level(), 9);
        assert_eq!(CompressionLevel::default(), CompressionLevel::FAST);
    }
}
