//! PCM wire encoding for the tutor session.
//!
//! Outbound: 16 kHz mono f32 frames -> 16-bit little-endian PCM -> base64.
//! Inbound: base64 -> 16-bit little-endian PCM -> 24 kHz mono f32.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::VoiceError;

/// MIME descriptor attached to every outbound chunk.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// One outbound audio chunk, ready for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Base64 of the PCM16LE bytes.
    pub data: String,
    pub mime_type: &'static str,
}

/// Convert one sample to 16-bit PCM.
///
/// No clamping: the scaled value is truncated toward zero and wrapped modulo
/// 2^16 for any finite magnitude, so `1.0` becomes `-32768` and `1.5`
/// becomes `-16384`. NaN and infinities map to `0`.
fn sample_to_i16(sample: f32) -> i16 {
    // Scaling in f64 is exact; an f32 product could overflow to infinity.
    (sample as f64 * 32768.0).trunc().rem_euclid(65536.0) as u16 as i16
}

/// Encode a captured frame for the tutor session.
pub fn encode_frame(samples: &[f32]) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    EncodedChunk {
        data: STANDARD.encode(&bytes),
        mime_type: CAPTURE_MIME_TYPE,
    }
}

/// Decode one inbound audio payload into f32 samples.
pub fn decode_chunk(payload: &str) -> Result<Vec<f32>, VoiceError> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| VoiceError::Decode(format!("invalid base64: {e}")))?;

    if bytes.len() % 2 != 0 {
        return Err(VoiceError::Decode(format!(
            "odd PCM16 byte count: {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(chunk: &EncodedChunk) -> Vec<i16> {
        STANDARD
            .decode(&chunk.data)
            .unwrap()
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect()
    }

    #[test]
    fn test_encode_scales_and_is_little_endian() {
        let chunk = encode_frame(&[0.0, 0.5, -0.5]);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        let bytes = STANDARD.decode(&chunk.data).unwrap();
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x40, 0x00, 0xC0]);
    }

    #[test]
    fn test_encode_wraps_out_of_range() {
        let chunk = encode_frame(&[1.0, 1.5, -1.0, -1.5]);
        assert_eq!(raw(&chunk), vec![-32768, -16384, -32768, 16384]);
    }

    #[test]
    fn test_wrap_is_exact_beyond_i32_range() {
        // 70001 * 32768 is past i32::MAX; the low 16 bits are 0x8000.
        assert_eq!(sample_to_i16(70001.0), -32768);
        assert_eq!(sample_to_i16(-70001.5), 16384);
        assert_eq!(sample_to_i16(3.0e38), 0);
    }

    #[test]
    fn test_non_finite_samples_encode_as_silence() {
        assert_eq!(sample_to_i16(f32::NAN), 0);
        assert_eq!(sample_to_i16(f32::INFINITY), 0);
        assert_eq!(sample_to_i16(f32::NEG_INFINITY), 0);
    }

    #[test]
    fn test_encode_truncates_toward_zero() {
        // 0.00002 * 32768 = 0.655..., -0.00002 * 32768 = -0.655...
        let chunk = encode_frame(&[0.00002, -0.00002]);
        assert_eq!(raw(&chunk), vec![0, 0]);
    }

    #[test]
    fn test_decode_values() {
        let bytes: Vec<u8> = [16384i16, -32768, 0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let samples = decode_chunk(&STANDARD.encode(bytes)).unwrap();
        assert_eq!(samples, vec![0.5, -1.0, 0.0]);
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        let err = decode_chunk(&STANDARD.encode([1u8, 2, 3])).unwrap_err();
        assert!(matches!(err, VoiceError::Decode(_)));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(matches!(
            decode_chunk("not base64!!"),
            Err(VoiceError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_empty_payload() {
        assert!(decode_chunk("").unwrap().is_empty());
    }
}
