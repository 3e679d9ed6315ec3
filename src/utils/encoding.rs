//! Little-endian fixed-width helpers shared by the on-disk formats.

/// Append a u16 in little-endian format
#[inline]
pub fn put_u16_le(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a u32 in little-endian format
#[inline]
pub fn put_u32_le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a u64 in little-endian format
#[inline]
pub fn put_u64_le(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Read a u16 at `offset`, or None if the slice is too short
#[inline]
pub fn get_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a u32 at `offset`, or None if the slice is too short
#[inline]
pub fn get_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a u64 at `offset`, or None if the slice is too short
#[inline]
pub fn get_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    let bytes = buf.get(offset..offset.checked_add(8)?)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    Some(u64::from_le_bytes(word))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_layout() {
        let mut buf = Vec::new();
        put_u16_le(&mut buf, 0x0102);
        put_u32_le(&mut buf, 0x03040506);
        put_u64_le(&mut buf, u64::MAX - 1);

        assert_eq!(&buf[..2], &[0x02, 0x01]);
        assert_eq!(get_u16_le(&buf, 0), Some(0x0102));
        assert_eq!(get_u32_le(&buf, 2), Some(0x03040506));
        assert_eq!(get_u64_le(&buf, 6), Some(u64::MAX - 1));
    }

    #[test]
    fn test_short_reads() {
        let buf = [1u8, 2, 3];
        assert_eq!(get_u32_le(&buf, 0), None);
        assert_eq!(get_u16_le(&buf, 2), None);
        assert_eq!(get_u64_le(&buf, usize::MAX), None);
    }
}
