//! Audio inspection and normalization
//!
//! PBX recordings arrive as standard containers (WAV, MP3, Ogg) or as a
//! vendor format: a short proprietary header in front of either an embedded
//! RIFF file or raw G.711 samples.

pub mod g711;
pub mod normalize;

use std::io::Cursor;

use callscope_common::errors::{AppError, Result};
use serde::Serialize;

pub use normalize::{normalize, Encoding, Normalization, NormalizedAudio};

/// Container detected from leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Proprietary,
}

impl AudioFormat {
    pub fn detect(bytes: &[u8]) -> Self {
        if is_riff_wave(bytes) {
            return Self::Wav;
        }
        if bytes.starts_with(b"ID3") {
            return Self::Mp3;
        }
        if let Some(frame_len) = mpeg_frame_len(bytes) {
            // a second frame must follow when the buffer is long enough to hold one
            if bytes.len() < frame_len + 4 || mpeg_frame_len(&bytes[frame_len..]).is_some() {
                return Self::Mp3;
            }
        }
        if bytes.starts_with(b"OggS") {
            return Self::Ogg;
        }
        Self::Proprietary
    }

    pub fn is_standard(self) -> bool {
        !matches!(self, Self::Proprietary)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Proprietary => "bin",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::Ogg => "audio/ogg",
            Self::Proprietary => "application/octet-stream",
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

pub(crate) fn is_riff_wave(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

const MPEG1_SAMPLE_RATES: [u32; 3] = [44_100, 48_000, 32_000];

// kbps by bitrate index; index 0 (free format) and 15 are rejected before lookup
const MPEG1_L1_KBPS: [u32; 15] = [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const MPEG1_L2_KBPS: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const MPEG1_L3_KBPS: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const MPEG2_L1_KBPS: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const MPEG2_L23_KBPS: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

/// Length in bytes of the MPEG audio frame whose header starts `bytes`.
///
/// `None` unless all four header bytes are present and the sync word,
/// version, layer, bitrate and sample-rate fields hold legal values.
/// Headerless μ-law starts with runs of 0xFF, which pass the sync check
/// alone but carry bitrate index 15.
fn mpeg_frame_len(bytes: &[u8]) -> Option<usize> {
    let header = bytes.get(..4)?;
    if header[0] != 0xFF || header[1] & 0xE0 != 0xE0 {
        return None;
    }

    let version = (header[1] >> 3) & 0b11;
    let layer = (header[1] >> 1) & 0b11;
    let bitrate_index = (header[2] >> 4) as usize;
    let rate_index = ((header[2] >> 2) & 0b11) as usize;
    let padding = u32::from((header[2] >> 1) & 1);

    if version == 0b01 || layer == 0b00 || bitrate_index == 0 || bitrate_index == 15 || rate_index == 3 {
        return None;
    }

    let mpeg1 = version == 0b11;
    let sample_rate = match version {
        0b11 => MPEG1_SAMPLE_RATES[rate_index],
        0b10 => MPEG1_SAMPLE_RATES[rate_index] / 2,
        _ => MPEG1_SAMPLE_RATES[rate_index] / 4,
    };
    let kbps = match (mpeg1, layer) {
        (true, 0b11) => MPEG1_L1_KBPS[bitrate_index],
        (true, 0b10) => MPEG1_L2_KBPS[bitrate_index],
        (true, _) => MPEG1_L3_KBPS[bitrate_index],
        (false, 0b11) => MPEG2_L1_KBPS[bitrate_index],
        (false, _) => MPEG2_L23_KBPS[bitrate_index],
    };
    let bitrate = kbps * 1000;

    let len = match layer {
        0b11 => (12 * bitrate / sample_rate + padding) * 4,
        0b01 if !mpeg1 => 72 * bitrate / sample_rate + padding,
        _ => 144 * bitrate / sample_rate + padding,
    };
    Some(len as usize)
}

/// Duration of a WAV file in seconds.
///
/// hound handles PCM; companded WAVs (format tag 6/7) fall back to walking
/// the RIFF chunks and dividing the data size by the byte rate.
pub fn wav_duration_secs(bytes: &[u8]) -> Result<f64> {
    match hound::WavReader::new(Cursor::new(bytes)) {
        Ok(reader) => {
            let spec = reader.spec();
            if spec.sample_rate == 0 {
                return Err(AppError::InvalidAudio {
                    message: "WAV header declares a zero sample rate".to_string(),
                });
            }
            Ok(reader.duration() as f64 / spec.sample_rate as f64)
        }
        Err(_) => riff_header_duration(bytes),
    }
}

fn riff_header_duration(bytes: &[u8]) -> Result<f64> {
    if !is_riff_wave(bytes) {
        return Err(AppError::InvalidAudio {
            message: "not a RIFF/WAVE payload".to_string(),
        });
    }

    let mut offset = 12;
    let mut byte_rate: Option<u32> = None;
    let mut data_len: Option<usize> = None;

    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let body = offset + 8;

        match id {
            b"fmt " if body + 12 <= bytes.len() => {
                byte_rate = Some(u32::from_le_bytes([
                    bytes[body + 8],
                    bytes[body + 9],
                    bytes[body + 10],
                    bytes[body + 11],
                ]));
            }
            b"data" => {
                data_len = Some(size.min(bytes.len().saturating_sub(body)));
                break;
            }
            _ => {}
        }

        // chunks are word aligned
        offset = body.saturating_add(size).saturating_add(size & 1);
    }

    match (byte_rate, data_len) {
        (Some(rate), Some(len)) if rate > 0 => Ok(len as f64 / rate as f64),
        _ => Err(AppError::InvalidAudio {
            message: "WAV header missing fmt or data chunk".to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use callscope_common::config::AudioConfig;
    use tokio_test::assert_err;

    /// 16-bit mono PCM WAV of the given length
    pub fn pcm_wav(seconds: u32, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..(seconds * sample_rate) {
                writer.write_sample(((i % 64) as i16 - 32) * 100).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    /// μ-law WAV header (format tag 7) around `data_len` bytes of silence
    fn ulaw_wav(data_len: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&7u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&8000u32.to_le_bytes());
        out.extend_from_slice(&8000u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.extend(std::iter::repeat(0xFFu8).take(data_len as usize));
        out
    }

    #[test]
    fn test_detect_formats() {
        assert_eq!(AudioFormat::detect(&pcm_wav(1, 8000)), AudioFormat::Wav);
        assert_eq!(AudioFormat::detect(b"ID3\x04\x00rest"), AudioFormat::Mp3);
        assert_eq!(AudioFormat::detect(&[0xFF, 0xFB, 0x90, 0x00]), AudioFormat::Mp3);
        assert_eq!(AudioFormat::detect(b"OggS\x00\x02"), AudioFormat::Ogg);
        assert_eq!(AudioFormat::detect(b"GSREC\x01\x00\x00"), AudioFormat::Proprietary);
        assert_eq!(AudioFormat::detect(b""), AudioFormat::Proprietary);
    }

    /// Two back to back MPEG-1 Layer III frames at 128 kbps / 44.1 kHz
    fn mp3_frames() -> Vec<u8> {
        let mut frame = vec![0u8; 417];
        frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        let mut out = frame.clone();
        out.extend_from_slice(&frame);
        out
    }

    #[test]
    fn test_mpeg_frame_len() {
        assert_eq!(mpeg_frame_len(&[0xFF, 0xFB, 0x90, 0x00]), Some(417));
        assert_eq!(mpeg_frame_len(&[0xFF, 0xFB, 0x92, 0x00]), Some(418));
        // MPEG-2 Layer III, 64 kbps at 22.05 kHz
        assert_eq!(mpeg_frame_len(&[0xFF, 0xF3, 0x80, 0x00]), Some(208));
        assert_eq!(mpeg_frame_len(&[0xFF, 0xFB]), None);
    }

    #[test]
    fn test_consecutive_mpeg_frames_detect_as_mp3() {
        assert_eq!(AudioFormat::detect(&mp3_frames()), AudioFormat::Mp3);

        let mut broken = mp3_frames();
        broken[417] = 0x00;
        assert_eq!(AudioFormat::detect(&broken), AudioFormat::Proprietary);
    }

    #[test]
    fn test_ff_led_mulaw_is_not_mp3() {
        // μ-law silence is 0xFF; bitrate index 15 is illegal
        assert_eq!(AudioFormat::detect(&[0xFF; 1000]), AudioFormat::Proprietary);
        // reserved layer bits
        assert_eq!(AudioFormat::detect(&[0xFF, 0xF1, 0x90, 0x00, 0x7F]), AudioFormat::Proprietary);
        // reserved version bits
        assert_eq!(AudioFormat::detect(&[0xFF, 0xEB, 0x90, 0x00]), AudioFormat::Proprietary);
        // reserved sample rate
        assert_eq!(AudioFormat::detect(&[0xFF, 0xFB, 0x9C, 0x00]), AudioFormat::Proprietary);
        // free-format bitrate
        assert_eq!(AudioFormat::detect(&[0xFF, 0xFB, 0x00, 0x00]), AudioFormat::Proprietary);
    }

    #[test]
    fn test_headerless_mulaw_normalizes_with_default_config() {
        let mut samples = vec![0xFFu8; 8000 * 40];
        for (i, b) in samples.iter_mut().enumerate().skip(4000) {
            *b = 0x70 + (i % 32) as u8;
        }

        let normalized = normalize(Bytes::from(samples), &AudioConfig::default()).unwrap();

        assert_eq!(normalized.format, AudioFormat::Wav);
        assert_eq!(
            normalized.normalization,
            Normalization::Decoded {
                encoding: Encoding::MuLaw
            }
        );
        assert!((wav_duration_secs(&normalized.bytes).unwrap() - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_pcm_duration() {
        let wav = pcm_wav(3, 8000);
        assert!((wav_duration_secs(&wav).unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_companded_duration_from_header() {
        let wav = ulaw_wav(8000 * 5);
        assert!((wav_duration_secs(&wav).unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_duration_rejects_garbage() {
        assert_err!(wav_duration_secs(b"not audio at all"));
    }
}
