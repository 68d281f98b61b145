//! Streams sorted entries into an SSTable file: data blocks, index
//! block, bloom filter, footer.
//!
//! The writer owns its file descriptor from `open` until `finish` (fsync
//! + close) or `abandon` (close + unlink). Dropping an unfinished writer
//! abandons the partial file, so a failed flush never leaves a truncated
//! table behind.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::bloom::BloomFilterBuilder;
use crate::config::TableOptions;
use crate::encoding::put_fixed64;
use crate::error::Result;
use crate::memtable::Memtable;
use crate::types::{
    compare_encoded_internal, pack_trailer, SequenceNumber, ValueKind, INTERNAL_KEY_TRAILER,
    MAX_SEQUENCE,
};
use crate::{invalid_argument, Error};

use super::block::{add_trailer, BlockBuilder, IndexBlockBuilder};
use super::{BlockHandle, BlockKind, Footer};

/// Statistics accumulated while writing one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStats {
    pub data_size: usize,
    pub index_size: usize,
    pub bloom_size: usize,
    pub num_entries: usize,
    pub num_data_blocks: usize,
    pub raw_key_size: usize,
    pub raw_value_size: usize,
    pub min_sequence: SequenceNumber,
    pub max_sequence: SequenceNumber,
}

impl Default for WriteStats {
    fn default() -> Self {
        Self {
            data_size: 0,
            index_size: 0,
            bloom_size: 0,
            num_entries: 0,
            num_data_blocks: 0,
            raw_key_size: 0,
            raw_value_size: 0,
            min_sequence: MAX_SEQUENCE,
            max_sequence: 0,
        }
    }
}

/// Writes one immutable table. Entries must arrive in strictly
/// ascending internal key order.
pub struct TableWriter {
    path: PathBuf,
    options: TableOptions,
    file: Option<File>,
    offset: u64,
    data_block: BlockBuilder,
    index_block: IndexBlockBuilder,
    bloom: BloomFilterBuilder,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    stats: WriteStats,
    finished: bool,
}

impl TableWriter {
    /// Creates the table file.
    pub fn open(path: impl AsRef<Path>, options: TableOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let data_block = BlockBuilder::new(options.restart_interval);
        let bloom = BloomFilterBuilder::new(options.bloom_policy);
        Ok(Self {
            path,
            options,
            file: Some(file),
            offset: 0,
            data_block,
            index_block: IndexBlockBuilder::new(),
            bloom,
            first_key: Vec::new(),
            last_key: Vec::new(),
            stats: WriteStats::default(),
            finished: false,
        })
    }

    /// Appends one entry. Internal keys must strictly increase.
    pub fn add(
        &mut self,
        user_key: &[u8],
        value: &[u8],
        seq: SequenceNumber,
        kind: ValueKind,
    ) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::Io("table writer is closed".to_string()));
        }

        let mut internal_key = Vec::with_capacity(user_key.len() + INTERNAL_KEY_TRAILER);
        internal_key.extend_from_slice(user_key);
        put_fixed64(&mut internal_key, pack_trailer(seq, kind));

        if !self.last_key.is_empty()
            && compare_encoded_internal(&internal_key, &self.last_key)
                != std::cmp::Ordering::Greater
        {
            return Err(invalid_argument!(
                "internal keys must be strictly increasing"
            ));
        }

        if self.stats.num_entries == 0 {
            self.first_key = internal_key.clone();
        }
        self.last_key = internal_key.clone();

        self.stats.min_sequence = self.stats.min_sequence.min(seq);
        self.stats.max_sequence = self.stats.max_sequence.max(seq);
        self.stats.num_entries += 1;
        self.stats.raw_key_size += user_key.len();
        self.stats.raw_value_size += value.len();

        self.data_block.add(&internal_key, value);
        if self.options.use_bloom_filter {
            self.bloom.add_key(user_key);
        }

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    /// Writes the remaining blocks and the footer, then fsyncs and
    /// closes the file.
    pub fn finish(&mut self) -> Result<WriteStats> {
        if self.file.is_none() {
            return Err(Error::Io("table writer is closed".to_string()));
        }

        if !self.data_block.is_empty() {
            self.flush_data_block()?;
        }

        // Index block, framed like a data block.
        let index_contents = self.index_block.finish().to_vec();
        let index_wrapped = add_trailer(&index_contents, BlockKind::Index);
        let index_handle = BlockHandle::new(self.offset, index_wrapped.len() as u64);
        self.stats.index_size = index_wrapped.len();
        self.write_raw(&index_wrapped)?;

        // Raw bloom bytes, no block framing; a null handle marks absence.
        let bloom_handle = if self.options.use_bloom_filter && self.bloom.num_keys() > 0 {
            let bloom_bytes = self.bloom.finish();
            let handle = BlockHandle::new(self.offset, bloom_bytes.len() as u64);
            self.stats.bloom_size = bloom_bytes.len();
            self.write_raw(&bloom_bytes)?;
            handle
        } else {
            BlockHandle::default()
        };

        let footer = Footer {
            index_handle,
            bloom_handle,
            num_entries: self.stats.num_entries as u64,
            min_sequence: self.stats.min_sequence,
            max_sequence: self.stats.max_sequence,
            min_key: user_key_of(&self.first_key).to_vec(),
            max_key: user_key_of(&self.last_key).to_vec(),
        };
        let footer_bytes = footer.encode();
        self.write_raw(&footer_bytes)?;

        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        self.finished = true;

        tracing::debug!(
            path = %self.path.display(),
            entries = self.stats.num_entries,
            data_blocks = self.stats.num_data_blocks,
            bytes = self.offset,
            "finished sstable"
        );
        Ok(self.stats.clone())
    }

    /// Closes the descriptor and unlinks the partial file. Safe to call
    /// any time before a successful `finish`.
    pub fn abandon(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            let _ = std::fs::remove_file(&self.path);
        }
        self.finished = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_entries(&self) -> usize {
        self.stats.num_entries
    }

    /// Streams an entire memtable into a new table at `path`.
    pub fn flush_memtable(
        path: impl AsRef<Path>,
        memtable: &Memtable,
        options: TableOptions,
    ) -> Result<WriteStats> {
        let mut writer = Self::open(path, options)?;

        let mut iter = memtable.iter();
        iter.seek_to_first();
        while iter.valid() {
            let result = writer.add(iter.user_key(), iter.value(), iter.sequence(), iter.kind());
            if let Err(err) = result {
                writer.abandon();
                return Err(err);
            }
            iter.next();
        }

        writer.finish()
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }

        let contents = self.data_block.finish().to_vec();
        let wrapped = add_trailer(&contents, BlockKind::Data);
        let handle = BlockHandle::new(self.offset, wrapped.len() as u64);
        self.write_raw(&wrapped)?;

        self.index_block.add_entry(self.data_block.last_key(), &handle);
        self.stats.data_size += wrapped.len();
        self.stats.num_data_blocks += 1;
        self.data_block.reset();
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Io("table writer is closed".to_string()))?;
        file.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(())
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.abandon();
        }
    }
}

/// Strips the 8-byte trailer off an encoded internal key.
fn user_key_of(internal_key: &[u8]) -> &[u8] {
    if internal_key.len() < INTERNAL_KEY_TRAILER {
        return internal_key;
    }
    &internal_key[..internal_key.len() - INTERNAL_KEY_TRAILER]
}
