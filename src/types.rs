//! Core types shared across the write path: sequence numbers, value
//! kinds, internal keys, and lookup results.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::corruption;
use crate::error::Result;

/// Monotonically increasing identifier assigned to each write. Defines a
/// total order on writes and is used for snapshot reads.
pub type SequenceNumber = u64;

/// The largest possible sequence number. Seeking at this snapshot sees
/// every version.
pub const MAX_SEQUENCE: SequenceNumber = u64::MAX;

/// Length of the packed `(sequence << 8) | kind` trailer appended to a
/// user key to form an internal key.
pub const INTERNAL_KEY_TRAILER: usize = 8;

/// Distinguishes live values from tombstones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueKind {
    /// A regular key-value entry.
    Value = 0x01,
    /// A deletion marker. Masks older versions of the same user key.
    Deletion = 0x02,
}

impl ValueKind {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0x01 => Ok(ValueKind::Value),
            0x02 => Ok(ValueKind::Deletion),
            other => Err(corruption!("unknown value kind {other:#x}")),
        }
    }
}

/// A versioned key: `(user_key, sequence, kind)`.
///
/// Ordering is user key ascending, then sequence *descending*, so the
/// newest version of a key sorts first among its versions. The kind only
/// participates as a final tie break to keep the ordering total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub sequence: SequenceNumber,
    pub kind: ValueKind,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, sequence: SequenceNumber, kind: ValueKind) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            kind,
        }
    }

    /// Encodes as `user_key || LE((sequence << 8) | kind)`, the form
    /// stored in SSTable blocks.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.user_key.len() + INTERNAL_KEY_TRAILER);
        buf.extend_from_slice(&self.user_key);
        let mut trailer = [0u8; INTERNAL_KEY_TRAILER];
        LittleEndian::write_u64(&mut trailer, pack_trailer(self.sequence, self.kind));
        buf.extend_from_slice(&trailer);
        buf
    }

    /// Decodes the block-encoded form produced by [`InternalKey::encode`].
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        if encoded.len() < INTERNAL_KEY_TRAILER {
            return Err(corruption!(
                "internal key too short: {} bytes",
                encoded.len()
            ));
        }
        let split = encoded.len() - INTERNAL_KEY_TRAILER;
        let packed = LittleEndian::read_u64(&encoded[split..]);
        Ok(Self {
            user_key: encoded[..split].to_vec(),
            sequence: packed >> 8,
            kind: ValueKind::from_u8((packed & 0xff) as u8)?,
        })
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Packs a sequence number and value kind into the 8-byte internal key
/// trailer: `(sequence << 8) | kind`. The top 8 bits of the sequence do
/// not fit the trailer and wrap away.
pub fn pack_trailer(sequence: SequenceNumber, kind: ValueKind) -> u64 {
    sequence.wrapping_shl(8) | kind as u64
}

/// Compares two block-encoded internal keys: user key ascending, then
/// sequence descending. Keys too short to carry a trailer fall back to a
/// plain byte comparison.
pub fn compare_encoded_internal(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() < INTERNAL_KEY_TRAILER || b.len() < INTERNAL_KEY_TRAILER {
        return a.cmp(b);
    }
    let (a_user, a_trailer) = a.split_at(a.len() - INTERNAL_KEY_TRAILER);
    let (b_user, b_trailer) = b.split_at(b.len() - INTERNAL_KEY_TRAILER);
    let a_packed = LittleEndian::read_u64(a_trailer);
    let b_packed = LittleEndian::read_u64(b_trailer);
    a_user
        .cmp(b_user)
        .then_with(|| (b_packed >> 8).cmp(&(a_packed >> 8)))
        .then_with(|| (a_packed & 0xff).cmp(&(b_packed & 0xff)))
}

/// Outcome of probing a memtable (or a stack of them) for a user key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// No version of the key is visible at the snapshot.
    NotFound,
    /// The newest visible version is a live value.
    Found(Vec<u8>),
    /// The newest visible version is a tombstone.
    Deleted,
}

impl LookupResult {
    /// Whether the probe resolved the key, positively or as a tombstone.
    /// A resolved result stops the newest-to-oldest memtable scan.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, LookupResult::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_value_kind_tags() {
        assert_eq!(ValueKind::Value as u8, 0x01);
        assert_eq!(ValueKind::Deletion as u8, 0x02);
        assert_eq!(ValueKind::from_u8(0x01).unwrap(), ValueKind::Value);
        assert_eq!(ValueKind::from_u8(0x02).unwrap(), ValueKind::Deletion);
        assert!(matches!(
            ValueKind::from_u8(0x03),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_internal_key_ordering() {
        let a1 = InternalKey::new(b"a".to_vec(), 1, ValueKind::Value);
        let a9 = InternalKey::new(b"a".to_vec(), 9, ValueKind::Value);
        let b1 = InternalKey::new(b"b".to_vec(), 1, ValueKind::Value);

        // User keys ascending.
        assert!(a1 < b1);
        assert!(a9 < b1);
        // Same user key: newer sequence sorts first.
        assert!(a9 < a1);
    }

    #[test]
    fn test_internal_key_encode_decode() {
        let key = InternalKey::new(b"user_key".to_vec(), 42, ValueKind::Deletion);
        let encoded = key.encode();
        assert_eq!(encoded.len(), 8 + INTERNAL_KEY_TRAILER);

        // Trailer is (seq << 8) | kind, little-endian.
        let packed = u64::from_le_bytes(encoded[8..].try_into().unwrap());
        assert_eq!(packed, (42 << 8) | 0x02);

        let decoded = InternalKey::decode(&encoded).expect("Failed to decode internal key");
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_internal_key_decode_too_short() {
        assert!(matches!(
            InternalKey::decode(b"short"),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_compare_encoded_internal() {
        let a4 = InternalKey::new(b"a".to_vec(), 4, ValueKind::Value).encode();
        let a1 = InternalKey::new(b"a".to_vec(), 1, ValueKind::Value).encode();
        let b2 = InternalKey::new(b"b".to_vec(), 2, ValueKind::Value).encode();

        // Newest version of a key sorts first.
        assert_eq!(compare_encoded_internal(&a4, &a1), Ordering::Less);
        assert_eq!(compare_encoded_internal(&a1, &b2), Ordering::Less);
        assert_eq!(compare_encoded_internal(&a4, &a4), Ordering::Equal);
    }

    #[test]
    fn test_lookup_result_resolution() {
        assert!(!LookupResult::NotFound.is_resolved());
        assert!(LookupResult::Found(b"v".to_vec()).is_resolved());
        assert!(LookupResult::Deleted.is_resolved());
    }
}
