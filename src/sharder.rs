//! Deterministic hashing of strings into `[0, 1)`.
//!
//! Sampling and variation allocation both depend on this mapping. It must stay stable forever:
//! changing it reshuffles every entity's bucket.

pub trait Hasher {
    /// Map `input` onto the unit interval.
    fn hash(&self, input: &str) -> f64;
}

/// The default (and only) hasher.
///
/// Interprets the 128-bit md5 digest of the input as a big-endian unsigned integer and divides
/// it by `u128::MAX`. Digests within 2^74 of `u128::MAX` round up to exactly `1.0` in `f64`,
/// which happens for one input in 2^54.
pub struct Md5Hasher;

impl Hasher for Md5Hasher {
    fn hash(&self, input: &str) -> f64 {
        let digest = md5::compute(input);
        let value = u128::from_be_bytes(digest.0);
        value as f64 / u128::MAX as f64
    }
}

#[cfg(test)]
pub struct DeterministicHasher(pub std::collections::HashMap<String, f64>);

#[cfg(test)]
impl Hasher for DeterministicHasher {
    fn hash(&self, input: &str) -> f64 {
        self.0.get(input).copied().unwrap_or(0.0)
    }
}
