/// Masks or unmasks `buf` in place with `key`.
///
/// Byte `i` is XOR-ed with `key[i % 4]`, so applying the same key twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    apply_mask_words(buf, key);
}

/// Byte-at-a-time masking, also used for the tail of [`apply_mask_words`].
#[inline]
fn apply_mask_bytes(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Masks four bytes at a time.
///
/// Every chunk starts at a multiple of four, so the key lines up with the chunk as-is and the
/// remainder restarts at `key[0]`.
#[inline]
fn apply_mask_words(buf: &mut [u8], key: [u8; 4]) {
    let key_word = u32::from_ne_bytes(key);

    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ key_word;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    apply_mask_bytes(chunks.into_remainder(), key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_match_bytes() {
        let keys = [
            [0x00, 0x00, 0x00, 0x00],
            [0xFF, 0xFF, 0xFF, 0xFF],
            [0x6d, 0xb6, 0xb2, 0x80],
            [0x12, 0x34, 0x56, 0x78],
        ];

        for key in keys {
            for size in 0..=67 {
                let data: Vec<u8> = (0..size).map(|i| (i * 13) as u8).collect();

                let mut by_byte = data.clone();
                apply_mask_bytes(&mut by_byte, key);

                let mut by_word = data.clone();
                apply_mask_words(&mut by_word, key);

                assert_eq!(by_byte, by_word, "key {key:?} size {size}");
            }
        }
    }

    #[test]
    fn test_mask_involution() {
        let key = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"Lights: 75%, shades: closed, projector: on".to_vec();

        let mut data = original.clone();
        apply_mask(&mut data, key);
        assert_ne!(data, original);

        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn test_mask_involution_random() {
        for len in [0usize, 1, 3, 4, 5, 125, 126, 1000] {
            let key: [u8; 4] = rand::random();
            let original: Vec<u8> = (0..len).map(|_| rand::random()).collect();

            let mut data = original.clone();
            apply_mask(&mut data, key);
            apply_mask(&mut data, key);
            assert_eq!(data, original, "len {len}");
        }
    }

    #[test]
    fn test_mask_rfc_example() {
        // RFC 6455 section 5.7, masked "Hello"
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, key);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn test_mask_short_buffers() {
        let key = [0x12, 0x34, 0x56, 0x78];

        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, key);
        assert!(empty.is_empty());

        let mut three = vec![0xAB, 0xCD, 0xEF];
        apply_mask(&mut three, key);
        assert_eq!(three, vec![0xAB ^ 0x12, 0xCD ^ 0x34, 0xEF ^ 0x56]);
    }
}
