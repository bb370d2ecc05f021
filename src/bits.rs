//! Bit-level helpers used to slice sub-byte fields out of frame headers.
//!
//! Both functions treat index 0 as the most significant bit, which matches the
//! way RFC 6455 draws the frame header (`FIN` is bit 0 of byte 0).

/// Expands a byte into its eight bits, most significant bit first.
#[inline]
pub fn byte_to_bits(byte: u8) -> [bool; 8] {
    std::array::from_fn(|i| byte & (0x80 >> i) != 0)
}

/// Folds a bit sequence into an unsigned integer.
///
/// The first bit of `bits` is the most significant one. Sequences longer than 64 bits
/// are a programming error.
#[inline]
pub fn bits_to_uint(bits: &[bool]) -> u64 {
    debug_assert!(bits.len() <= 64, "bit sequence wider than u64");
    bits.iter()
        .fold(0u64, |acc, &bit| (acc << 1) | u64::from(bit))
}
