use std::fmt;

/// Number of trailing id bytes folded into a distance.
const DISTANCE_BYTES: usize = 8;

pub fn encode_id<const N: usize>(id: &[u8; N], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    id.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
}

/// XOR the trailing bytes of two ids and read the result as a big-endian integer.
pub fn short_xor_distance<const N: usize>(a: &[u8; N], b: &[u8; N]) -> u64 {
    let start = N.saturating_sub(DISTANCE_BYTES);

    a[start..].iter().zip(&b[start..]).fold(0, |acc, (x, y)| (acc << 8) | u64::from(x ^ y))
}
