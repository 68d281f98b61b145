//! Immutable on-disk sorted table (SSTable) format and writer.
//!
//! # File Layout
//!
//! ```text
//! +--------------------+
//! | Data Block 1       |  prefix-compressed entries + restart array,
//! +--------------------+  each followed by a 5-byte (type, crc) trailer
//! | ...                |
//! +--------------------+
//! | Data Block N       |
//! +--------------------+
//! | Index Block        |  last internal key of each data block -> handle
//! +--------------------+
//! | Bloom Filter       |  raw filter bytes, optional, no block trailer
//! +--------------------+
//! | Footer             |  handles + stats + key range, ends with magic
//! +--------------------+
//! ```
//!
//! Keys inside blocks are internal keys: the user key followed by an
//! 8-byte little-endian `(sequence << 8) | kind` trailer. All entries in
//! a file are strictly ascending in internal key order.

pub mod block;
pub mod writer;

pub use writer::{TableWriter, WriteStats};

use crate::corruption;
use crate::encoding::{get_varint64, put_fixed32, put_fixed64, put_varint64};
use crate::error::Result;
use crate::types::SequenceNumber;

use byteorder::{ByteOrder, LittleEndian};

/// Trailing magic: "SSTable1".
pub const TABLE_MAGIC: u64 = 0x5353_5461_626C_6531;

/// Minimum footer size; the footer is padded up to this when its
/// variable-length content allows.
pub const FOOTER_SIZE: usize = 64;

/// Per-block trailer: type byte plus CRC32.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Discriminates block trailers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Data = 0x00,
    Index = 0x01,
}

/// Location of a block within the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// The null handle marks an absent section (e.g. no bloom filter).
    pub fn is_null(&self) -> bool {
        self.offset == 0 && self.size == 0
    }

    /// Two varint64s: offset then size.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        put_varint64(&mut buf, self.offset);
        put_varint64(&mut buf, self.size);
        buf
    }

    /// Decodes a handle from the front of `buf`, returning it with the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        let (offset, n) =
            get_varint64(buf).ok_or_else(|| corruption!("block handle offset truncated"))?;
        let (size, m) = get_varint64(&buf[n..])
            .ok_or_else(|| corruption!("block handle size truncated"))?;
        Ok((Self { offset, size }, n + m))
    }
}

/// Table footer: section handles, entry statistics, and the user-key
/// range, ending with [`TABLE_MAGIC`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footer {
    pub index_handle: BlockHandle,
    pub bloom_handle: BlockHandle,
    pub num_entries: u64,
    pub min_sequence: SequenceNumber,
    pub max_sequence: SequenceNumber,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
}

impl Footer {
    /// Serializes the footer, zero-padding the variable content up to 56
    /// bytes before the 8-byte magic.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);

        let index = self.index_handle.encode();
        put_fixed32(&mut buf, index.len() as u32);
        buf.extend_from_slice(&index);

        let bloom = self.bloom_handle.encode();
        put_fixed32(&mut buf, bloom.len() as u32);
        buf.extend_from_slice(&bloom);

        put_fixed64(&mut buf, self.num_entries);
        put_fixed64(&mut buf, self.min_sequence);
        put_fixed64(&mut buf, self.max_sequence);

        put_fixed32(&mut buf, self.min_key.len() as u32);
        buf.extend_from_slice(&self.min_key);
        put_fixed32(&mut buf, self.max_key.len() as u32);
        buf.extend_from_slice(&self.max_key);

        while buf.len() < FOOTER_SIZE - 8 {
            buf.push(0);
        }
        put_fixed64(&mut buf, TABLE_MAGIC);
        buf
    }

    /// Decodes a footer from its exact serialized bytes, validating the
    /// trailing magic.
    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < FOOTER_SIZE {
            return Err(corruption!(
                "footer too short: {} bytes, need at least {FOOTER_SIZE}",
                input.len()
            ));
        }

        let magic = LittleEndian::read_u64(&input[input.len() - 8..]);
        if magic != TABLE_MAGIC {
            return Err(corruption!("bad table magic {magic:#018x}"));
        }

        let mut pos = 0;
        let index_len = read_fixed32(input, &mut pos)? as usize;
        let index_bytes = read_slice(input, &mut pos, index_len)?;
        let (index_handle, _) = BlockHandle::decode(index_bytes)?;

        let bloom_len = read_fixed32(input, &mut pos)? as usize;
        let bloom_bytes = read_slice(input, &mut pos, bloom_len)?;
        let (bloom_handle, _) = BlockHandle::decode(bloom_bytes)?;

        let num_entries = read_fixed64(input, &mut pos)?;
        let min_sequence = read_fixed64(input, &mut pos)?;
        let max_sequence = read_fixed64(input, &mut pos)?;

        let min_key_len = read_fixed32(input, &mut pos)? as usize;
        let min_key = read_slice(input, &mut pos, min_key_len)?.to_vec();
        let max_key_len = read_fixed32(input, &mut pos)? as usize;
        let max_key = read_slice(input, &mut pos, max_key_len)?.to_vec();

        Ok(Self {
            index_handle,
            bloom_handle,
            num_entries,
            min_sequence,
            max_sequence,
            min_key,
            max_key,
        })
    }
}

fn read_fixed32(input: &[u8], pos: &mut usize) -> Result<u32> {
    let bytes = read_slice(input, pos, 4)?;
    Ok(LittleEndian::read_u32(bytes))
}

fn read_fixed64(input: &[u8], pos: &mut usize) -> Result<u64> {
    let bytes = read_slice(input, pos, 8)?;
    Ok(LittleEndian::read_u64(bytes))
}

fn read_slice<'a>(input: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= input.len())
        .ok_or_else(|| corruption!("footer field truncated at offset {pos}"))?;
    let slice = &input[*pos..end];
    *pos = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_block_handle_roundtrip() {
        for handle in [
            BlockHandle::new(0, 0),
            BlockHandle::new(1, 4096),
            BlockHandle::new(u64::MAX, u64::MAX),
        ] {
            let encoded = handle.encode();
            let (decoded, consumed) =
                BlockHandle::decode(&encoded).expect("Failed to decode handle");
            assert_eq!(decoded, handle);
            assert_eq!(consumed, encoded.len());
        }
        assert!(BlockHandle::new(0, 0).is_null());
        assert!(!BlockHandle::new(0, 1).is_null());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            index_handle: BlockHandle::new(1024, 256),
            bloom_handle: BlockHandle::new(1280, 64),
            num_entries: 1000,
            min_sequence: 7,
            max_sequence: 1006,
            min_key: b"aaa".to_vec(),
            max_key: b"zzz".to_vec(),
        };

        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_SIZE);
        assert_eq!(
            LittleEndian::read_u64(&encoded[encoded.len() - 8..]),
            TABLE_MAGIC
        );

        let decoded = Footer::decode(&encoded).expect("Failed to decode footer");
        assert_eq!(decoded, footer);
    }

    #[test]
    fn test_footer_magic_bytes() {
        // "SSTable1" in little-endian byte order.
        let encoded = Footer::default().encode();
        assert_eq!(&encoded[encoded.len() - 8..], b"1elbaTSS");
    }

    #[test]
    fn test_footer_tampered_magic_fails() {
        let encoded = Footer::default().encode();
        for i in encoded.len() - 8..encoded.len() {
            let mut tampered = encoded.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(Footer::decode(&tampered), Err(Error::Corruption(_))),
                "tampered magic byte {i} went undetected"
            );
        }
    }

    #[test]
    fn test_footer_too_short() {
        assert!(matches!(
            Footer::decode(&[0u8; FOOTER_SIZE - 1]),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_footer_grows_past_minimum_for_long_keys() {
        let footer = Footer {
            min_key: vec![b'a'; 40],
            max_key: vec![b'z'; 40],
            ..Footer::default()
        };
        let encoded = footer.encode();
        assert!(encoded.len() > FOOTER_SIZE);
        let decoded = Footer::decode(&encoded).expect("Failed to decode footer");
        assert_eq!(decoded, footer);
    }
}
