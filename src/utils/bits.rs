//! Fingerprint bit helpers. Bit `i` lives in byte `i / 8` at position `i % 8`
//! (least significant bit first).

#[inline]
pub fn get_bit(bytes: &[u8], bit: usize) -> bool {
    bytes
        .get(bit >> 3)
        .is_some_and(|b| b & (1 << (bit & 7)) != 0)
}

#[inline]
pub fn set_bit(bytes: &mut [u8], bit: usize) {
    if let Some(b) = bytes.get_mut(bit >> 3) {
        *b |= 1 << (bit & 7);
    }
}

/// Number of set bits
#[inline]
pub fn popcount(bytes: &[u8]) -> u32 {
    let mut chunks = bytes.chunks_exact(8);
    let mut total = 0;
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        total += u64::from_le_bytes(word).count_ones();
    }
    total + chunks.remainder().iter().map(|b| b.count_ones()).sum::<u32>()
}

/// Positions of set bits in ascending order
pub fn set_bits(bytes: &[u8]) -> Vec<usize> {
    let mut out = Vec::new();
    for (i, &byte) in bytes.iter().enumerate() {
        let mut b = byte;
        while b != 0 {
            let pos = b.trailing_zeros() as usize;
            out.push(i * 8 + pos);
            b &= b - 1;
        }
    }
    out
}

/// True if every bit set in `query` is also set in `fp`
#[inline]
pub fn contains_all(fp: &[u8], query: &[u8]) -> bool {
    fp.len() == query.len() && fp.iter().zip(query).all(|(f, q)| f & q == *q)
}

/// Decode a hex string (either case). None on odd length or bad digit.
pub fn parse_hex(text: &[u8]) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    fn digit(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }
    text.chunks_exact(2)
        .map(|pair| Some(digit(pair[0])? << 4 | digit(pair[1])?))
        .collect()
}

pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0xf) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_order() {
        let mut fp = [0u8; 2];
        set_bit(&mut fp, 0);
        set_bit(&mut fp, 9);
        assert_eq!(fp, [0b0000_0001, 0b0000_0010]);
        assert!(get_bit(&fp, 9));
        assert!(!get_bit(&fp, 8));
        assert!(!get_bit(&fp, 100));
        assert_eq!(set_bits(&fp), vec![0, 9]);
    }

    #[test]
    fn test_popcount_with_tail() {
        let fp = [0xffu8; 11];
        assert_eq!(popcount(&fp), 88);
        assert_eq!(popcount(&[]), 0);
    }

    #[test]
    fn test_contains_all() {
        assert!(contains_all(&[0b1110], &[0b0110]));
        assert!(!contains_all(&[0b1010], &[0b0110]));
        assert!(contains_all(&[0b1010], &[0]));
    }

    #[test]
    fn test_hex() {
        assert_eq!(parse_hex(b"0aFf").unwrap(), vec![0x0a, 0xff]);
        assert!(parse_hex(b"abc").is_none());
        assert!(parse_hex(b"zz").is_none());
        assert_eq!(to_hex(&[0x0a, 0xff]), "0aff");
    }
}
