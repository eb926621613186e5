//! G.711 expansion (ITU-T reference algorithm)
//!
//! PBX recordings without a container are raw 8 kHz G.711 frames. Only the
//! decode direction is needed here.

/// A-law byte to 16-bit linear PCM
pub fn alaw_expand(compressed: u8) -> i16 {
    let ix = ((compressed ^ 0x55) & 0x7F) as i16;
    let iexp = ix >> 4;
    let mut mant = ix & 0x0F;

    if iexp > 0 {
        mant += 16;
    }

    mant = (mant << 4) + 0x08;

    if iexp > 1 {
        mant <<= iexp - 1;
    }

    if compressed > 127 {
        mant
    } else {
        -mant
    }
}

/// μ-law byte to 16-bit linear PCM
pub fn ulaw_expand(compressed: u8) -> i16 {
    let sign = if compressed < 0x80 { -1 } else { 1 };
    let inverted = (!compressed) as i16;
    let exponent = (inverted >> 4) & 0x07;
    let mantissa = inverted & 0x0F;
    let step = 4 << (exponent + 1);

    sign * ((0x80 << exponent) + step * mantissa + step / 2 - 4 * 33)
}

pub fn decode_ulaw(input: &[u8]) -> Vec<i16> {
    input.iter().map(|&b| ulaw_expand(b)).collect()
}

pub fn decode_alaw(input: &[u8]) -> Vec<i16> {
    input.iter().map(|&b| alaw_expand(b)).collect()
}

/// Little-endian 16-bit PCM; a trailing odd byte is dropped
pub fn decode_pcm16le(input: &[u8]) -> Vec<i16> {
    input
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_reference_points() {
        assert_eq!(ulaw_expand(0xFF), 0);
        assert_eq!(ulaw_expand(0x7F), 0);
        assert_eq!(ulaw_expand(0x80), 32124);
        assert_eq!(ulaw_expand(0x00), -32124);
    }

    #[test]
    fn test_alaw_reference_points() {
        assert_eq!(alaw_expand(0xD5), 8);
        assert_eq!(alaw_expand(0x55), -8);
        assert_eq!(alaw_expand(0xAA), 32256);
        assert_eq!(alaw_expand(0x2A), -32256);
    }

    #[test]
    fn test_ulaw_is_symmetric() {
        for b in 0u8..0x80 {
            assert_eq!(ulaw_expand(b), -ulaw_expand(b | 0x80));
        }
    }

    #[test]
    fn test_pcm16_drops_odd_byte() {
        assert_eq!(decode_pcm16le(&[0x01, 0x00, 0xFF, 0xFF, 0x07]), vec![1, -1]);
    }
}
