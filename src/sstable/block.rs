//! Prefix-compressed sorted blocks with restart points.
//!
//! # Entry Format
//!
//! ```text
//! +----------------+------------------+-----------------+-------------+-------+
//! | shared:varint32| unshared:varint32| value_len:varint| key[shared..]| value |
//! +----------------+------------------+-----------------+-------------+-------+
//! ```
//!
//! Every `restart_interval` entries the full key is stored (`shared = 0`)
//! and the entry's offset is recorded in the restart array, which is
//! appended after the last entry as `u32 LE[]` followed by a `u32 LE`
//! count. Restart points bound how far a reader must scan to reconstruct
//! a key.
//!
//! Finished blocks are wrapped with a `(type, crc32)` trailer before
//! hitting the file; the checksum covers the block contents plus the
//! type byte.

use byteorder::{ByteOrder, LittleEndian};

use crate::corruption;
use crate::encoding::{crc32, get_varint32, put_fixed32, put_varint32};
use crate::error::Result;

use super::{BlockHandle, BlockKind, BLOCK_TRAILER_SIZE};

/// Builds one prefix-compressed block.
///
/// Keys must be added in the table's sort order (internal keys: user key
/// ascending, sequence descending); ordering is enforced by the table
/// writer. Prefix compression and restart bookkeeping are themselves
/// order-agnostic.
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    last_key: Vec<u8>,
    restart_interval: usize,
    counter: usize,
    finished: bool,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);
        Self {
            buffer: Vec::new(),
            restarts: vec![0],
            last_key: Vec::new(),
            restart_interval,
            counter: 0,
            finished: false,
        }
    }

    /// Appends an entry. Panics when the block is already finished.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(!self.finished, "add after finish");
        debug_assert!(
            self.buffer.is_empty() || key != self.last_key.as_slice(),
            "duplicate block key"
        );

        let shared = if self.counter < self.restart_interval {
            self.last_key
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        } else {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };
        let unshared = key.len() - shared;

        put_varint32(&mut self.buffer, shared as u32);
        put_varint32(&mut self.buffer, unshared as u32);
        put_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Appends the restart array and count; the returned slice is the
    /// complete block contents.
    pub fn finish(&mut self) -> &[u8] {
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        &self.buffer
    }

    /// Size the block would occupy if finished now.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Returns to the initial state for the next block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0);
        self.last_key.clear();
        self.counter = 0;
        self.finished = false;
    }
}

/// Builds the index block: the last internal key of each data block
/// mapped to that block's handle. Restart interval 1, so every key is
/// stored in full.
pub struct IndexBlockBuilder {
    block: BlockBuilder,
    entry_count: usize,
}

impl IndexBlockBuilder {
    pub fn new() -> Self {
        Self {
            block: BlockBuilder::new(1),
            entry_count: 0,
        }
    }

    pub fn add_entry(&mut self, last_key: &[u8], handle: &BlockHandle) {
        self.block.add(last_key, &handle.encode());
        self.entry_count += 1;
    }

    pub fn finish(&mut self) -> &[u8] {
        self.block.finish()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn reset(&mut self) {
        self.block.reset();
        self.entry_count = 0;
    }
}

impl Default for IndexBlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps finished block contents with the `(type, crc32)` trailer.
pub fn add_trailer(contents: &[u8], kind: BlockKind) -> Vec<u8> {
    let mut result = Vec::with_capacity(contents.len() + BLOCK_TRAILER_SIZE);
    result.extend_from_slice(contents);
    result.push(kind as u8);
    let crc = crc32(&result);
    put_fixed32(&mut result, crc);
    result
}

/// Verifies a block's trailer and returns the bare contents.
pub fn verify_trailer(data: &[u8], expected: BlockKind) -> Result<&[u8]> {
    if data.len() < BLOCK_TRAILER_SIZE {
        return Err(corruption!("block of {} bytes has no trailer", data.len()));
    }
    let contents_len = data.len() - BLOCK_TRAILER_SIZE;
    let kind = data[contents_len];
    if kind != expected as u8 {
        return Err(corruption!(
            "block type {kind:#x}, expected {:#x}",
            expected as u8
        ));
    }

    let stored_crc = LittleEndian::read_u32(&data[contents_len + 1..]);
    let computed_crc = crc32(&data[..contents_len + 1]);
    if stored_crc != computed_crc {
        return Err(corruption!("block crc mismatch"));
    }
    Ok(&data[..contents_len])
}

/// A decoded block: entry region plus parsed restart array.
pub struct Block {
    data: Vec<u8>,
    restarts: Vec<u32>,
}

impl Block {
    /// Parses bare block contents (no trailer).
    pub fn new(contents: Vec<u8>) -> Result<Self> {
        if contents.len() < 4 {
            return Err(corruption!("block too short: {} bytes", contents.len()));
        }

        let num_restarts_offset = contents.len() - 4;
        let num_restarts = LittleEndian::read_u32(&contents[num_restarts_offset..]) as usize;

        let restart_array_size = num_restarts
            .checked_mul(4)
            .filter(|&size| size <= num_restarts_offset)
            .ok_or_else(|| corruption!("restart array overruns block"))?;
        let restart_offset = num_restarts_offset - restart_array_size;

        let mut restarts = Vec::with_capacity(num_restarts);
        for i in 0..num_restarts {
            let pos = restart_offset + i * 4;
            restarts.push(LittleEndian::read_u32(&contents[pos..pos + 4]));
        }

        let mut data = contents;
        data.truncate(restart_offset);
        Ok(Self { data, restarts })
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            block: self,
            pos: 0,
            last_key: Vec::new(),
        }
    }

    pub fn num_restarts(&self) -> usize {
        self.restarts.len()
    }

    pub fn restart_offset(&self, index: usize) -> u32 {
        self.restarts[index]
    }
}

/// Sequential decoder over a block's entries.
pub struct BlockIter<'a> {
    block: &'a Block,
    pos: usize,
    last_key: Vec<u8>,
}

impl Iterator for BlockIter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.block.data.len() {
            return None;
        }
        Some(self.decode_entry())
    }
}

impl BlockIter<'_> {
    fn decode_entry(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
        let data = &self.block.data;
        let mut pos = self.pos;

        let (shared, n) = get_varint32(&data[pos..])
            .ok_or_else(|| corruption!("block entry shared length truncated"))?;
        pos += n;
        let (unshared, n) = get_varint32(&data[pos..])
            .ok_or_else(|| corruption!("block entry unshared length truncated"))?;
        pos += n;
        let (value_len, n) = get_varint32(&data[pos..])
            .ok_or_else(|| corruption!("block entry value length truncated"))?;
        pos += n;

        let (shared, unshared, value_len) = (shared as usize, unshared as usize, value_len as usize);
        if shared > self.last_key.len() || pos + unshared + value_len > data.len() {
            // Poison the iterator so it terminates.
            self.pos = data.len();
            return Err(corruption!("block entry out of bounds"));
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&data[pos..pos + unshared]);
        pos += unshared;

        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        self.pos = pos;
        self.last_key = key.clone();
        Ok((key, value))
    }
}
