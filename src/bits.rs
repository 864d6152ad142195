//! Bit packing for coil and discrete-input banks
//!
//! Modbus carries boolean banks LSB-first: flag 0 is bit 0 of byte 0,
//! flag 8 is bit 0 of byte 1. Unused high bits of the final byte are zero.

/// Number of bytes needed to carry `count` flags
#[inline]
pub fn packed_len(count: usize) -> usize {
    count.div_ceil(8)
}

/// Pack flags into bytes, least significant bit first.
///
/// # Example
///
/// ```rust
/// use modbus_node::bits::pack_bits;
///
/// let bytes = pack_bits(&[true, false, true, false, true, false, true, false, true]);
/// assert_eq!(bytes, vec![0b0101_0101, 0b0000_0001]);
/// ```
pub fn pack_bits(flags: &[bool]) -> Vec<u8> {
    flags
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &flag)| if flag { byte | (1 << i) } else { byte })
        })
        .collect()
}

/// Unpack exactly `count` flags from LSB-first packed bytes.
///
/// Bits beyond `count` in the final byte are ignored. If `bytes` is shorter
/// than `packed_len(count)` the missing flags read as `false`; callers that
/// need strictness check the length first.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|byte| (byte >> (i % 8)) & 0x01 != 0)
                .unwrap_or(false)
        })
        .collect()
}
