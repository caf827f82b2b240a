//! Hashing utilities for cache keys.

/// Classic 32-bit rolling string hash (`hash = hash * 31 + unit`).
///
/// Runs over UTF-16 code units and wraps on overflow, so the result is the
/// same signed value Java's `String::hashCode` produces. Stable across runs
/// and platforms, which is all a cache key needs.
pub fn string_hash(text: &str) -> i32 {
    text.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// [`string_hash`] rendered as a key segment.
pub fn hash_segment(text: &str) -> String {
    string_hash(text).to_string()
}
