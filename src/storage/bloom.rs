use sha2::{Digest, Sha256};

/// Membership filter over the digests stored in one subset.
///
/// `k` bit indices per item are derived from a single sha256 digest with the
/// Kirsch-Mitzenmacher construction: two 64-bit halves `h1`/`h2` combined as
/// `h1 + i * h2` modulo the (power of two) bit count. Filters are rebuilt
/// from the subset index files at startup; the reconstructed filter is
/// authoritative.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    hashers: u32,
    words: Vec<u64>,
}

impl BloomFilter {
    /// Sizes the filter for `expected_items` at the target false positive
    /// rate: `m = -n * ln(p) / ln(2)^2` rounded up to a power of two, and
    /// `k = (m / n) * ln(2)`.
    pub fn with_rate(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil() as usize;
        let bits = m.max(64).next_power_of_two();
        let k = ((bits as f64 / n) * ln2).round().clamp(1.0, 30.0) as u32;
        Self {
            hashers: k,
            words: vec![0u64; bits / 64],
        }
    }

    pub fn bits(&self) -> usize {
        self.words.len() * 64
    }

    pub fn insert(&mut self, item: &[u8]) {
        for index in self.indices(item) {
            self.words[(index / 64) as usize] |= 1u64 << (index % 64);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.indices(item)
            .all(|index| self.words[(index / 64) as usize] & (1u64 << (index % 64)) != 0)
    }

    fn indices(&self, item: &[u8]) -> impl Iterator<Item = u64> {
        let digest = Sha256::digest(item);
        let h1 = u64::from_be_bytes(digest[0..8].try_into().expect("digest is 32 bytes"));
        let mut h2 = u64::from_be_bytes(digest[8..16].try_into().expect("digest is 32 bytes"));
        // A zero second hash would collapse every probe onto h1.
        h2 |= 1;
        let mask = (self.bits() - 1) as u64;
        (0..self.hashers as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) & mask)
    }
}
