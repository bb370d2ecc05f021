/// XORs `buf` with the masking key, byte `i` with `mask[i % 4]`.
///
/// Applying the same key twice yields the original bytes, so this both masks and unmasks.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        for (byte, key) in word.iter_mut().zip(mask) {
            *byte ^= key;
        }
    }
    // the tail starts on a multiple of four, so the key index restarts at 0
    for (byte, key) in words.into_remainder().iter_mut().zip(mask) {
        *byte ^= key;
    }
}
