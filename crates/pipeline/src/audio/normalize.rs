//! Proprietary-to-WAV normalization
//!
//! Two vendor layouts are understood:
//! 1. a vendor prefix followed by a complete RIFF/WAVE file, which is cut out
//!    as-is
//! 2. a fixed-length vendor header followed by raw samples (G.711 or 16-bit
//!    PCM), which are decoded and wrapped into a 16-bit mono WAV
//!
//! Standard containers are returned untouched.

use std::io::Cursor;
use std::str::FromStr;

use bytes::Bytes;
use callscope_common::config::AudioConfig;
use callscope_common::errors::{AppError, Result};
use serde::Serialize;

use super::{g711, is_riff_wave, AudioFormat};

/// Sample encoding of headerless vendor payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    MuLaw,
    ALaw,
    Pcm16,
}

impl FromStr for Encoding {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mulaw" | "ulaw" | "pcmu" => Ok(Self::MuLaw),
            "alaw" | "pcma" => Ok(Self::ALaw),
            "pcm16" | "s16le" => Ok(Self::Pcm16),
            other => Err(AppError::Configuration {
                message: format!("unknown proprietary audio encoding '{}'", other),
            }),
        }
    }
}

/// What normalization did to the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
    Passthrough,
    EmbeddedRiff { offset: usize },
    Decoded { encoding: Encoding },
}

#[derive(Debug, Clone)]
pub struct NormalizedAudio {
    pub bytes: Bytes,
    pub format: AudioFormat,
    pub normalization: Normalization,
}

impl NormalizedAudio {
    pub fn converted(&self) -> bool {
        self.normalization != Normalization::Passthrough
    }
}

/// Turn downloaded bytes into a standard container
pub fn normalize(input: Bytes, config: &AudioConfig) -> Result<NormalizedAudio> {
    if input.is_empty() {
        return Err(AppError::InvalidAudio {
            message: "recording payload is empty".to_string(),
        });
    }

    let format = AudioFormat::detect(&input);
    if format.is_standard() {
        return Ok(NormalizedAudio {
            bytes: input,
            format,
            normalization: Normalization::Passthrough,
        });
    }

    if let Some(offset) = find_embedded_riff(&input, config.riff_scan_limit) {
        return Ok(NormalizedAudio {
            bytes: input.slice(offset..),
            format: AudioFormat::Wav,
            normalization: Normalization::EmbeddedRiff { offset },
        });
    }

    let encoding: Encoding = config.proprietary_encoding.parse()?;
    let header_len = config.proprietary_header_len;
    if header_len >= input.len() {
        return Err(AppError::InvalidAudio {
            message: format!(
                "payload of {} bytes is not longer than the {}-byte vendor header",
                input.len(),
                header_len
            ),
        });
    }

    let payload = &input[header_len..];
    let samples = match encoding {
        Encoding::MuLaw => g711::decode_ulaw(payload),
        Encoding::ALaw => g711::decode_alaw(payload),
        Encoding::Pcm16 => g711::decode_pcm16le(payload),
    };
    if samples.is_empty() {
        return Err(AppError::InvalidAudio {
            message: "no samples after vendor header".to_string(),
        });
    }

    let wav = encode_wav(&samples, config.sample_rate)?;
    Ok(NormalizedAudio {
        bytes: Bytes::from(wav),
        format: AudioFormat::Wav,
        normalization: Normalization::Decoded { encoding },
    })
}

/// Offset of a RIFF/WAVE header inside the first `limit` bytes, skipping 0
fn find_embedded_riff(bytes: &[u8], limit: usize) -> Option<usize> {
    let end = limit.min(bytes.len().saturating_sub(12));
    (1..=end).find(|&i| is_riff_wave(&bytes[i..]))
}

fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
        for &sample in samples {
            writer.write_sample(sample).map_err(wav_error)?;
        }
        writer.finalize().map_err(wav_error)?;
    }
    Ok(cursor.into_inner())
}

fn wav_error(e: hound::Error) -> AppError {
    AppError::InvalidAudio {
        message: format!("WAV encoding failed: {}", e),
    }
}
