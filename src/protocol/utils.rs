/// Splits a 14-bit value into its (LSB, MSB) 7-bit wire bytes.
pub fn encode_u14(value: u16) -> [u8; 2] {
    [(value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
}

/// Encodes a sequence of 14-bit values as pairs of 7-bit bytes.
pub fn encode_sequence(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|&value| encode_u14(value)).collect()
}

/// Decodes pairs of 7-bit bytes back into 14-bit values.
///
/// A trailing unpaired byte is ignored.
pub fn decode_sequence(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from(pair[0]) | (u16::from(pair[1]) << 7))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sequence() {
        assert_eq!(encode_sequence(&[255, 0, 36]), vec![127, 1, 0, 0, 36, 0]);
    }

    #[test]
    fn test_decode_sequence() {
        assert_eq!(decode_sequence(&[127, 1, 0, 0, 36, 0]), vec![255, 0, 36]);
    }

    #[test]
    fn test_sequence_roundtrip_at_boundaries() {
        let values = [0, 1, 0x7F, 0x80, 0x1234, 0x3FFF];
        assert_eq!(decode_sequence(&encode_sequence(&values)), values);
    }

    #[test]
    fn test_decode_ignores_unpaired_byte() {
        assert_eq!(decode_sequence(&[0x05, 0x01, 0x7F]), vec![0x85]);
    }
}
