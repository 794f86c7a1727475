//! Bloom filter over message identities.
//!
//! Sized from a target capacity and false-positive rate. Never yields a
//! false negative, including across a `to_bytes`/`from_bytes` round trip.
//!
//! Bit positions use double hashing over a SHA-256 digest of the identity:
//! `h1 + i * h2 (mod m)` for `i in 0..k`.

use sha2::{Digest, Sha256};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"MFBF";
const FORMAT_VERSION: u8 = 1;

/// magic + version + k + m + capacity + rate + word count
const HEADER_LEN: usize = 4 + 1 + 4 + 8 + 8 + 8 + 8;

/// Errors decoding a serialized filter
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("Filter data truncated: {actual} bytes, expected {expected}")]
    Truncated { actual: usize, expected: usize },

    #[error("Not a membership filter (bad magic)")]
    BadMagic,

    #[error("Unsupported filter format version: {0}")]
    UnsupportedVersion(u8),

    #[error("Inconsistent filter parameters: {0}")]
    Inconsistent(String),
}

/// Probabilistic set of delivered identities
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    capacity: u64,
    false_positive_rate: f64,
}

impl MembershipFilter {
    /// Size a filter for `capacity` items at `false_positive_rate`
    pub fn with_estimates(capacity: u64, false_positive_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let rate = if false_positive_rate > 0.0 && false_positive_rate < 1.0 {
            false_positive_rate
        } else {
            0.001
        };

        let num_bits = optimal_bits(capacity, rate);
        let num_hashes = optimal_hashes(num_bits, capacity);
        let word_count = words_for(num_bits);

        Self {
            words: vec![0; word_count],
            num_bits,
            num_hashes,
            capacity,
            false_positive_rate: rate,
        }
    }

    /// Insert an identity. Returns true if it was not already (probably) present.
    pub fn insert(&mut self, item: &str) -> bool {
        let mut added = false;
        for bit in self.positions(item) {
            let (word, mask) = locate(bit);
            if self.words[word] & mask == 0 {
                self.words[word] |= mask;
                added = true;
            }
        }
        added
    }

    /// Membership test: certain for inserted items, probabilistic otherwise
    pub fn contains(&self, item: &str) -> bool {
        self.positions(item).all(|bit| {
            let (word, mask) = locate(bit);
            self.words[word] & mask != 0
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn false_positive_rate(&self) -> f64 {
        self.false_positive_rate
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Serialized size in bytes
    pub fn size_bytes(&self) -> usize {
        HEADER_LEN + self.words.len() * 8
    }

    /// Self-describing little-endian encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_bytes());
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&self.num_hashes.to_le_bytes());
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        out.extend_from_slice(&self.capacity.to_le_bytes());
        out.extend_from_slice(&self.false_positive_rate.to_le_bytes());
        out.extend_from_slice(&(self.words.len() as u64).to_le_bytes());
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, FilterError> {
        if data.len() < HEADER_LEN {
            return Err(FilterError::Truncated {
                actual: data.len(),
                expected: HEADER_LEN,
            });
        }
        if &data[..4] != MAGIC {
            return Err(FilterError::BadMagic);
        }
        if data[4] != FORMAT_VERSION {
            return Err(FilterError::UnsupportedVersion(data[4]));
        }

        let num_hashes = u32::from_le_bytes(fixed(&data[5..9]));
        let num_bits = u64::from_le_bytes(fixed(&data[9..17]));
        let capacity = u64::from_le_bytes(fixed(&data[17..25]));
        let false_positive_rate = f64::from_le_bytes(fixed(&data[25..33]));
        let word_count = u64::from_le_bytes(fixed(&data[33..41]));

        if num_bits == 0 || num_hashes == 0 {
            return Err(FilterError::Inconsistent(format!(
                "{} bits, {} hashes",
                num_bits, num_hashes
            )));
        }
        if word_count != words_for(num_bits) as u64 {
            return Err(FilterError::Inconsistent(format!(
                "{} words for {} bits",
                word_count, num_bits
            )));
        }

        let expected = (word_count as usize)
            .checked_mul(8)
            .and_then(|body| body.checked_add(HEADER_LEN))
            .unwrap_or(usize::MAX);
        if data.len() != expected {
            return Err(FilterError::Truncated {
                actual: data.len(),
                expected,
            });
        }

        let words = data[HEADER_LEN..]
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(fixed(chunk)))
            .collect();

        Ok(Self {
            words,
            num_bits,
            num_hashes,
            capacity,
            false_positive_rate,
        })
    }

    fn positions(&self, item: &str) -> impl Iterator<Item = u64> {
        let digest = Sha256::digest(item.as_bytes());
        let h1 = u64::from_le_bytes(fixed(&digest[..8]));
        // Odd step so successive probes never collapse onto one bit
        let h2 = u64::from_le_bytes(fixed(&digest[8..16])) | 1;
        let num_bits = self.num_bits;

        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
    }
}

/// m = -n ln p / (ln 2)^2
fn optimal_bits(capacity: u64, rate: f64) -> u64 {
    let ln2 = std::f64::consts::LN_2;
    let bits = -(capacity as f64) * rate.ln() / (ln2 * ln2);
    (bits.ceil() as u64).max(64)
}

/// k = (m / n) ln 2
fn optimal_hashes(num_bits: u64, capacity: u64) -> u32 {
    let k = (num_bits as f64 / capacity as f64) * std::f64::consts::LN_2;
    (k.round() as u32).max(1)
}

fn words_for(num_bits: u64) -> usize {
    (num_bits / 64 + u64::from(num_bits % 64 != 0)) as usize
}

fn locate(bit: u64) -> (usize, u64) {
    ((bit / 64) as usize, 1u64 << (bit % 64))
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing_follows_estimates() {
        let filter = MembershipFilter::with_estimates(100_000, 0.001);
        // ~14.4 bits per item and 10 hashes at 0.1%
        assert!(filter.num_bits() > 1_400_000 && filter.num_bits() < 1_500_000);
        assert_eq!(filter.num_hashes(), 10);
        assert_eq!(filter.capacity(), 100_000);
    }

    #[test]
    fn test_degenerate_parameters_are_clamped() {
        let filter = MembershipFilter::with_estimates(0, 2.0);
        assert_eq!(filter.capacity(), 1);
        assert_eq!(filter.false_positive_rate(), 0.001);
        assert!(filter.num_bits() >= 64);
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = MembershipFilter::with_estimates(1_000, 0.01);
        let ids: Vec<String> = (0..5_000).map(|i| format!("<{}@example.com>", i)).collect();

        for id in &ids {
            filter.insert(id);
        }
        // Over capacity the rate degrades but inserted items stay present
        assert!(ids.iter().all(|id| filter.contains(id)));
    }

    #[test]
    fn test_insert_reports_first_insertion() {
        let mut filter = MembershipFilter::with_estimates(100, 0.001);
        assert!(filter.insert("a@example.com"));
        assert!(!filter.insert("a@example.com"));
        assert!(filter.contains("a@example.com"));
    }

    #[test]
    fn test_bytes_round_trip_preserves_members() {
        let mut filter = MembershipFilter::with_estimates(1_000, 0.001);
        for i in 0..500 {
            filter.insert(&format!("id-{}", i));
        }

        let restored = MembershipFilter::from_bytes(&filter.to_bytes()).unwrap();
        assert_eq!(restored, filter);
        assert!((0..500).all(|i| restored.contains(&format!("id-{}", i))));
    }

    #[test]
    fn test_rejects_malformed_bytes() {
        let filter = MembershipFilter::with_estimates(10, 0.01);
        let bytes = filter.to_bytes();

        assert!(matches!(
            MembershipFilter::from_bytes(&bytes[..10]),
            Err(FilterError::Truncated { .. })
        ));
        assert!(matches!(
            MembershipFilter::from_bytes(&bytes[..bytes.len() - 1]),
            Err(FilterError::Truncated { .. })
        ));

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert_eq!(MembershipFilter::from_bytes(&bad_magic), Err(FilterError::BadMagic));

        let mut bad_version = bytes;
        bad_version[4] = 9;
        assert_eq!(
            MembershipFilter::from_bytes(&bad_version),
            Err(FilterError::UnsupportedVersion(9))
        );
    }
}
