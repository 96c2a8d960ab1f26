//! Audio payload encoding: base64 on the wire, PCM16 or WAV underneath.

use crate::{Result, SellerError};
use base64::{engine::general_purpose, Engine as _};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use tracing::debug;

/// Decoded chunk payload
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    /// Known only when the payload carried a WAV header
    pub sample_rate: Option<u32>,
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| SellerError::InvalidParameters(format!("invalid base64 audio data: {}", e)))
}

/// Little-endian signed 16-bit PCM
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub fn pcm16_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(SellerError::InvalidParameters(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect())
}

fn is_wav(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Decode a chunk payload that is either a WAV container or raw PCM16
pub fn decode_payload(bytes: &[u8]) -> Result<DecodedAudio> {
    if bytes.is_empty() {
        return Ok(DecodedAudio {
            samples: Vec::new(),
            sample_rate: None,
        });
    }
    if !is_wav(bytes) {
        return Ok(DecodedAudio {
            samples: pcm16_to_f32(bytes)?,
            sample_rate: None,
        });
    }

    let mut reader = WavReader::new(Cursor::new(bytes))
        .map_err(|e| SellerError::InvalidParameters(format!("invalid WAV payload: {}", e)))?;
    let spec = reader.spec();
    debug!(
        "Decoding WAV payload: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let read_err = |e: hound::Error| SellerError::InvalidParameters(format!("invalid WAV sample: {}", e));
    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, _) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?,
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?,
        (SampleFormat::Int, 24) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 8_388_608.0))
            .collect::<std::result::Result<_, _>>()
            .map_err(read_err)?,
        (SampleFormat::Int, bits) => {
            return Err(SellerError::InvalidParameters(format!(
                "unsupported WAV bit depth: {}",
                bits
            )))
        }
    };

    Ok(DecodedAudio {
        samples: to_mono(&interleaved, spec.channels),
        sample_rate: Some(spec.sample_rate),
    })
}

/// Average interleaved channels down to one
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// 16-bit mono WAV bytes
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    write_wav_i16(
        samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
        sample_rate,
    )
}

/// Wrap little-endian PCM16 bytes in a mono WAV container without requantizing
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>> {
    if pcm.len() % 2 != 0 {
        return Err(SellerError::InvalidParameters(format!(
            "PCM16 payload has odd length {}",
            pcm.len()
        )));
    }
    write_wav_i16(
        pcm.chunks_exact(2).map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        sample_rate,
    )
}

fn write_wav_i16(samples: impl Iterator<Item = i16>, sample_rate: u32) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)
            .map_err(|e| SellerError::IOError(format!("Failed to create WAV writer: {}", e)))?;
        for sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| SellerError::IOError(format!("Failed to write sample: {}", e)))?;
        }
        writer
            .finalize()
            .map_err(|e| SellerError::IOError(format!("Failed to finalize WAV: {}", e)))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_odd_length() {
        assert!(pcm16_to_f32(&[1, 2, 3]).is_err());
        assert_eq!(pcm16_to_f32(&[]).unwrap().len(), 0);
    }

    #[test]
    fn test_pcm16_values() {
        let bytes = f32_to_pcm16(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(bytes.len(), 8);
        let samples = pcm16_to_f32(&bytes).unwrap();
        assert_eq!(samples[0], 0.0);
        assert!((samples[1] - 1.0).abs() < 1e-4);
        assert!((samples[2] + 1.0).abs() < 1e-4);
        // Clamped
        assert!((samples[3] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_wav_payload_carries_rate() {
        let wav = encode_wav(&[0.1; 160], 16000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        let decoded = decode_payload(&wav).unwrap();
        assert_eq!(decoded.sample_rate, Some(16000));
        assert_eq!(decoded.samples.len(), 160);
    }

    #[test]
    fn test_pcm16_to_wav_keeps_samples() {
        let pcm = f32_to_pcm16(&[0.25, -0.5, 0.75]);
        let wav = pcm16_to_wav(&pcm, 22050).unwrap();
        let decoded = decode_payload(&wav).unwrap();
        assert_eq!(decoded.sample_rate, Some(22050));
        assert_eq!(f32_to_pcm16(&decoded.samples).len(), pcm.len());
        assert!(pcm16_to_wav(&[0], 22050).is_err());
    }

    #[test]
    fn test_raw_payload_has_no_rate() {
        let decoded = decode_payload(&f32_to_pcm16(&[0.5; 10])).unwrap();
        assert_eq!(decoded.sample_rate, None);
        assert_eq!(decoded.samples.len(), 10);
    }

    #[test]
    fn test_base64() {
        let encoded = encode_base64(b"audio");
        assert_eq!(decode_base64(&encoded).unwrap(), b"audio");
        assert!(decode_base64("not base64!!").is_err());
    }

    #[test]
    fn test_to_mono() {
        let mono = to_mono(&[0.2, 0.4, 0.6, 0.8], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] - 0.7).abs() < 1e-6);
    }
}
