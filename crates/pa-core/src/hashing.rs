//! Stable string hashing used for rollout and experiment bucketing.

/// Classic 31-multiplier rolling hash over UTF-16 code units, wrapped to
/// 32 bits and returned as an absolute value.
///
/// Rollout and A/B buckets already handed out to users were computed with
/// this exact function, so it must not be swapped for a "better" hash.
pub fn string_hash(input: &str) -> u32 {
    let mut hash: i32 = 0;
    for unit in input.encode_utf16() {
        hash = hash.wrapping_mul(31).wrapping_add(i32::from(unit));
    }
    hash.unsigned_abs()
}

/// Bucket in `0..100` for the given input.
pub fn bucket_of(input: &str) -> u32 {
    string_hash(input) % 100
}
