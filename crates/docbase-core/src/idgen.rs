//! Pluggable `_id` generation.
//!
//! The default factory produces a compact, URL-safe, globally-unique-enough
//! base36 string from a SHA-256 digest of (wall clock nanoseconds, a
//! per-process random seed, a monotonic counter) — the same hash-then-encode
//! recipe used elsewhere in this workspace for content-addressed ids, minus
//! the content (an `_id` has no semantic payload to hash, unlike a content
//! hash).

use std::sync::atomic::{AtomicU64, Ordering};

use num_bigint::BigUint;
use num_traits::Zero;
use sha2::{Digest, Sha256};

/// Base36 alphabet (0-9, a-z).
const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Default length, in base36 characters, of a generated `_id`.
pub const DEFAULT_ID_LENGTH: usize = 20;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Converts a byte slice to a base36 string of the specified length,
/// zero-padded on the left or truncated (keeping the least-significant
/// digits) to fit exactly.
pub fn encode_base36(data: &[u8], length: usize) -> String {
    let mut num = BigUint::from_bytes_be(data);
    let base = BigUint::from(36u32);
    let zero = BigUint::zero();

    let mut chars: Vec<u8> = Vec::with_capacity(length);
    while num > zero {
        let rem = &num % &base;
        num /= &base;
        let digits = rem.to_u32_digits();
        let i = if digits.is_empty() { 0 } else { digits[0] as usize };
        chars.push(BASE36_ALPHABET[i]);
    }
    chars.reverse();

    let mut s = String::from_utf8(chars).expect("base36 chars are valid UTF-8");
    if s.len() < length {
        s = "0".repeat(length - s.len()) + &s;
    }
    if s.len() > length {
        s = s[s.len() - length..].to_owned();
    }
    s
}

/// A per-process random seed, derived once from `std::collections::hash_map`'s
/// OS-seeded `RandomState` so the default id factory need not depend on a
/// dedicated `rand` crate for a single seed value.
fn process_seed() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish()
}

/// Generates a fresh, globally-unique-enough document identifier.
///
/// Combines wall-clock nanoseconds, a per-process random seed, and a
/// monotonic counter (so two ids requested in the same nanosecond on the
/// same process never collide) into a SHA-256 digest, then encodes the
/// digest as base36.
pub fn generate_id() -> String {
    generate_id_with_length(DEFAULT_ID_LENGTH)
}

/// As [`generate_id`], with an explicit output length.
pub fn generate_id_with_length(length: usize) -> String {
    let now_nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let seed = process_seed();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(now_nanos.to_be_bytes());
    hasher.update(seed.to_be_bytes());
    hasher.update(counter.to_be_bytes());
    let digest = hasher.finalize();

    let num_bytes = ((length * 4) / 5).clamp(4, digest.len());
    encode_base36(&digest[..num_bytes], length)
}

/// A pluggable source of `_id` values (§4.8's `idGenerator` option).
///
/// Boxed as a trait object so `Database` can hold either the default
/// factory or a caller-supplied closure uniformly.
pub trait IdFactory: Send + Sync {
    fn generate(&self) -> String;
}

/// The default [`IdFactory`], backed by [`generate_id`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultIdFactory;

impl IdFactory for DefaultIdFactory {
    fn generate(&self) -> String {
        generate_id()
    }
}

impl<F> IdFactory for F
where
    F: Fn() -> String + Send + Sync,
{
    fn generate(&self) -> String {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn encode_base36_basic() {
        assert_eq!(encode_base36(&[], 4), "0000");
    }

    #[test]
    fn encode_base36_length_is_exact() {
        let result = encode_base36(&[0xFF, 0xFF], 4);
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn encode_base36_truncates_from_the_left() {
        let result = encode_base36(&[0xFF, 0xFF, 0xFF, 0xFF], 3);
        assert_eq!(result.len(), 3);
    }

    #[test]
    fn generate_id_has_default_length() {
        let id = generate_id();
        assert_eq!(id.len(), DEFAULT_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn generate_id_is_unique_across_many_calls() {
        let ids: HashSet<String> = (0..2000).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 2000);
    }

    #[test]
    fn default_id_factory_matches_generate_id_length() {
        let factory = DefaultIdFactory;
        assert_eq!(factory.generate().len(), DEFAULT_ID_LENGTH);
    }

    #[test]
    fn closures_implement_id_factory() {
        let factory: Box<dyn IdFactory> = Box::new(|| "fixed-id".to_string());
        assert_eq!(factory.generate(), "fixed-id");
    }
}
