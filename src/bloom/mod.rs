//! Bloom filter for fast negative point-lookups against an SSTable.
//!
//! Wraps the [`bloomfilter`] crate behind a small, self-describing surface:
//! a filter built from a set of keys can be serialized to bytes and later
//! reconstructed without re-hashing anything, and without re-counting the
//! original key set. No false negatives are possible; false positives are
//! bounded by the configured target rate.

use bloomfilter::Bloom;
use thiserror::Error;

/// Default false-positive rate used when a caller does not specify one.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Errors returned by [`BloomFilter`] construction or decoding.
#[derive(Debug, Error)]
pub enum BloomError {
    /// The filter could not be sized for the requested item count and
    /// false-positive rate.
    #[error("failed to size bloom filter: {0}")]
    Sizing(String),

    /// Serialized bloom filter bytes were malformed.
    #[error("failed to decode bloom filter: {0}")]
    Decode(String),
}

/// A bloom filter over arbitrary byte-string keys.
///
/// Built once from the full key set of an SSTable, serialized alongside
/// the table, and reloaded verbatim on open — the bit array carries its
/// own sizing and hash-seed parameters, so [`BloomFilter::from_bytes`]
/// never needs the original key set or item count.
pub struct BloomFilter {
    inner: Bloom<[u8]>,
}

impl BloomFilter {
    /// Build an empty filter sized for `expected_items` keys at the given
    /// false-positive rate.
    pub fn with_capacity(expected_items: usize, false_positive_rate: f64) -> Result<Self, BloomError> {
        let expected_items = expected_items.max(1);
        let inner = Bloom::new_for_fp_rate(expected_items, false_positive_rate)
            .map_err(|e| BloomError::Sizing(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Build a filter already populated from an iterator of keys.
    pub fn from_keys<'a, I>(keys: I, false_positive_rate: f64) -> Result<Self, BloomError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let keys: Vec<&[u8]> = keys.into_iter().collect();
        let mut filter = Self::with_capacity(keys.len(), false_positive_rate)?;
        for key in keys {
            filter.insert(key);
        }
        Ok(filter)
    }

    /// Record `key` as present.
    pub fn insert(&mut self, key: &[u8]) {
        self.inner.set(key);
    }

    /// Return `true` if `key` may be present. A `false` result is a
    /// definitive guarantee of absence; a `true` result may be a false
    /// positive.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.check(key)
    }

    /// Serialize the filter's bit array and sizing parameters to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.as_slice().to_vec()
    }

    /// Reconstruct a filter from bytes previously produced by [`BloomFilter::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, BloomError> {
        let inner = Bloom::from_slice(data).map_err(|e| BloomError::Decode(e.to_string()))?;
        Ok(Self { inner })
    }
}
