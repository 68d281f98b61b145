//! Bloom filter over user keys, probed before touching SSTable blocks.
//!
//! # Serialized Format
//!
//! ```text
//! +----------------------+------------------+
//! | filter bits          | num_hashes (u8)  |
//! +----------------------+------------------+
//! ```
//!
//! The bit array holds `round_up_mul8(num_keys * bits_per_key)` bits with
//! a 64-bit minimum. Probing uses double hashing: a 64-bit murmur-style
//! hash produces `h1`, a second hash seeded with `h1` produces `h2`, and
//! the `i`th probe sets or tests bit `(h1 + i * h2) mod num_bits`.
//!
//! An empty filter serializes to the single `num_hashes` byte and answers
//! `may_contain` with true for every key.

use crate::corruption;
use crate::error::Result;

/// 64-bit MurmurHash-style hash.
fn murmur64(data: &[u8], seed: u64) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let mut h = seed ^ (data.len() as u64).wrapping_mul(M);

    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut k = u64::from_le_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u64 = 0;
        for (i, &byte) in tail.iter().enumerate() {
            k ^= (byte as u64) << (8 * i);
        }
        k = k.wrapping_mul(M);
        h ^= k;
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;
    h
}

/// The two base hashes combined for k probe positions.
fn hash_pair(key: &[u8]) -> (u64, u64) {
    let h1 = murmur64(key, 0);
    let h2 = murmur64(key, h1);
    (h1, h2)
}

/// Bloom filter sizing policy.
///
/// 10 bits/key gives roughly a 1% false positive rate, 15 bits/key
/// roughly 0.1%.
#[derive(Debug, Clone, Copy)]
pub struct BloomPolicy {
    /// Filter bits allocated per key (default: 10).
    pub bits_per_key: usize,
}

impl Default for BloomPolicy {
    fn default() -> Self {
        Self { bits_per_key: 10 }
    }
}

impl BloomPolicy {
    pub fn new(bits_per_key: usize) -> Self {
        Self { bits_per_key }
    }

    /// Optimal number of hash functions: `bits_per_key * ln 2`, rounded
    /// and clamped to [1, 30].
    pub fn num_hashes(&self) -> u32 {
        let k = (self.bits_per_key as f64 * std::f64::consts::LN_2).round() as u32;
        k.clamp(1, 30)
    }

    /// Expected false positive rate for this policy.
    pub fn estimated_fpr(&self) -> f64 {
        let k = self.num_hashes() as f64;
        (1.0 - (-k / self.bits_per_key as f64).exp()).powf(k)
    }
}

/// Accumulates key hashes and serializes the finished filter.
pub struct BloomFilterBuilder {
    policy: BloomPolicy,
    hashes: Vec<(u64, u64)>,
}

impl BloomFilterBuilder {
    pub fn new(policy: BloomPolicy) -> Self {
        Self {
            policy,
            hashes: Vec::new(),
        }
    }

    /// Adds a key. Only the two base hashes are retained.
    pub fn add_key(&mut self, key: &[u8]) {
        self.hashes.push(hash_pair(key));
    }

    pub fn num_keys(&self) -> usize {
        self.hashes.len()
    }

    /// Serializes the filter: bit array followed by the hash count byte.
    pub fn finish(&self) -> Vec<u8> {
        let num_hashes = self.policy.num_hashes();
        if self.hashes.is_empty() {
            return vec![num_hashes as u8];
        }

        let mut bits = self.hashes.len() * self.policy.bits_per_key;
        bits = (bits + 7) / 8 * 8;
        bits = bits.max(64);

        let num_bytes = bits / 8;
        let mut data = vec![0u8; num_bytes + 1];
        for &(h1, h2) in &self.hashes {
            for i in 0..num_hashes as u64 {
                let bit = h1.wrapping_add(i.wrapping_mul(h2)) % bits as u64;
                data[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
        data[num_bytes] = num_hashes as u8;
        data
    }

    /// Clears accumulated keys for reuse.
    pub fn reset(&mut self) {
        self.hashes.clear();
    }
}

/// Probes a serialized filter without taking ownership of the bytes.
pub struct BloomFilterReader<'a> {
    data: &'a [u8],
    num_bits: u64,
    num_hashes: u32,
}

impl<'a> BloomFilterReader<'a> {
    /// Parses a serialized filter. Rejects empty input and hash counts
    /// outside [1, 30].
    pub fn new(filter: &'a [u8]) -> Result<Self> {
        let Some((&num_hashes, bits)) = filter.split_last() else {
            return Err(corruption!("empty bloom filter"));
        };
        if num_hashes == 0 || num_hashes > 30 {
            return Err(corruption!("bloom filter hash count {num_hashes} out of range"));
        }
        Ok(Self {
            data: bits,
            num_bits: bits.len() as u64 * 8,
            num_hashes: num_hashes as u32,
        })
    }

    /// False means the key is definitely absent; true means it may exist.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.num_bits == 0 {
            return true;
        }
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            if self.data[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }
}

/// A bloom filter that owns its serialized bytes.
pub struct BloomFilter {
    data: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Wraps serialized filter bytes, validating the trailer.
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let reader = BloomFilterReader::new(&data)?;
        let (num_bits, num_hashes) = (reader.num_bits(), reader.num_hashes());
        Ok(Self {
            data,
            num_bits,
            num_hashes,
        })
    }

    /// Builds a filter over `keys` in one step.
    pub fn build<K: AsRef<[u8]>>(keys: &[K], policy: BloomPolicy) -> Self {
        let mut builder = BloomFilterBuilder::new(policy);
        for key in keys {
            builder.add_key(key.as_ref());
        }
        Self::new(builder.finish()).expect("builder output is always well-formed")
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.num_bits == 0 {
            return true;
        }
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            if self.data[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}
