//! Sequential reader for one WAL segment, used during recovery.
//!
//! The segment is memory-mapped read-only and advised for sequential
//! access. Any framing violation (short header, payload overrunning the
//! file, checksum mismatch, non-`Full` record type) surfaces as
//! `Corruption`; the recovery loop in the WAL manager decides whether
//! that means a torn tail or a hard failure.

use std::fs::File;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use crate::corruption;
use crate::error::Result;

use super::{record_checksum, RecordKind, WalEntry, RECORD_HEADER_SIZE};

/// Replays one segment from the start.
pub struct WalReader {
    path: PathBuf,
    mmap: Option<Mmap>,
    pos: usize,
}

impl WalReader {
    /// Maps the segment read-only. An empty segment is valid and yields
    /// immediate EOF.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();

        let mmap = if len == 0 {
            None
        } else {
            let mmap = unsafe { Mmap::map(&file)? };
            #[cfg(unix)]
            let _ = mmap.advise(memmap2::Advice::Sequential);
            Some(mmap)
        };

        Ok(Self { path, mmap, pos: 0 })
    }

    /// Returns the next record payload, `None` at EOF, or `Corruption`.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(mmap) = &self.mmap else {
            return Ok(None);
        };
        let data = &mmap[..];

        if self.pos >= data.len() {
            return Ok(None);
        }
        if self.pos + RECORD_HEADER_SIZE > data.len() {
            return Err(corruption!(
                "truncated record header at offset {} in {}",
                self.pos,
                self.path.display()
            ));
        }

        let header = &data[self.pos..];
        let stored_crc = LittleEndian::read_u32(&header[0..4]);
        let length = LittleEndian::read_u16(&header[4..6]) as usize;

        if self.pos + RECORD_HEADER_SIZE + length > data.len() {
            return Err(corruption!(
                "truncated record payload at offset {} in {}",
                self.pos,
                self.path.display()
            ));
        }

        let computed_crc =
            record_checksum(&header[6..RECORD_HEADER_SIZE + length], &header[4..6]);
        if stored_crc != computed_crc {
            return Err(corruption!(
                "crc mismatch at offset {} in {}",
                self.pos,
                self.path.display()
            ));
        }

        if header[6] != RecordKind::Full as u8 {
            return Err(corruption!(
                "unexpected record type {:#x} at offset {} in {}",
                header[6],
                self.pos,
                self.path.display()
            ));
        }

        let payload = header[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + length].to_vec();
        self.pos += RECORD_HEADER_SIZE + length;
        Ok(Some(payload))
    }

    /// Returns the next decoded entry, `None` at EOF, or `Corruption`.
    pub fn read_entry(&mut self) -> Result<Option<WalEntry>> {
        match self.read_record()? {
            Some(payload) => Ok(Some(WalEntry::decode(&payload)?)),
            None => Ok(None),
        }
    }

    /// Iterates decoded entries until EOF or the first error.
    pub fn entries(&mut self) -> Entries<'_> {
        Entries { reader: self }
    }

    /// Rewinds to the start of the segment.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Current byte offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Total segment size in bytes.
    pub fn len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Entry iterator; stops after yielding the first error.
pub struct Entries<'a> {
    reader: &'a mut WalReader,
}

impl Iterator for Entries<'_> {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                // Park the cursor at the end so iteration terminates.
                self.reader.pos = self.reader.len();
                Some(Err(err))
            }
        }
    }
}
