//! Directory of numbered WAL segments: rotation, recovery, and
//! obsolete-segment cleanup.
//!
//! Segments are named `log.NNNNNN` under `<db_path>/wal/`. Opening the
//! manager always starts a fresh segment numbered one past the highest
//! on disk, even when that segment is empty; small leftover segments are
//! retired by [`WalManager::mark_flushed`] once their contents have been
//! persisted to an SSTable.
//!
//! Recovery replays every segment in ascending order. Corruption at or
//! past the first bad record in a segment is treated as a torn tail from
//! a crash mid-write: the valid prefix is kept and replay continues with
//! the next segment. Any non-corruption error aborts recovery.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::WalOptions;
use crate::error::Result;
use crate::memtable::Memtable;
use crate::types::SequenceNumber;
use crate::Error;

use super::reader::WalReader;
use super::writer::WalWriter;
use super::{WalEntry, WalEntryKind};

/// Counters collected while replaying segments into a memtable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records_read: usize,
    pub bytes_read: usize,
    pub puts: usize,
    pub deletes: usize,
    pub max_sequence: SequenceNumber,
    pub duration: Duration,
}

struct ManagerInner {
    current_log_number: u64,
    writer: Option<WalWriter>,
}

/// Owns the WAL directory and at most one open segment writer.
pub struct WalManager {
    db_path: PathBuf,
    options: WalOptions,
    inner: Mutex<ManagerInner>,
}

impl WalManager {
    /// Creates the `wal/` directory if needed, scans existing segments,
    /// and opens a new segment numbered one past the highest observed.
    pub fn open(db_path: impl AsRef<Path>, options: WalOptions) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let manager = Self {
            db_path,
            options,
            inner: Mutex::new(ManagerInner {
                current_log_number: 0,
                writer: None,
            }),
        };

        std::fs::create_dir_all(manager.wal_dir())?;

        let mut inner = manager.inner.lock()?;
        if let Some(&highest) = manager.list_log_files()?.last() {
            inner.current_log_number = highest;
        }
        manager.open_new_log(&mut inner)?;
        drop(inner);

        Ok(manager)
    }

    /// Appends one entry, rotating first when the current segment is
    /// full.
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if inner
            .writer
            .as_ref()
            .is_some_and(|writer| writer.should_rotate())
        {
            self.rotate_locked(&mut inner)?;
        }
        match &inner.writer {
            Some(writer) => writer.append(entry),
            None => Err(Error::Io("wal manager is closed".to_string())),
        }
    }

    pub fn append_put(&self, seq: SequenceNumber, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(&WalEntry::put(seq, key, value))
    }

    pub fn append_delete(&self, seq: SequenceNumber, key: &[u8]) -> Result<()> {
        self.append(&WalEntry::delete(seq, key))
    }

    /// Forces an fsync on the current segment.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock()?;
        match &inner.writer {
            Some(writer) => writer.sync(),
            None => Ok(()),
        }
    }

    /// Syncs and closes the current segment, then opens the next one.
    pub fn rotate(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        self.rotate_locked(&mut inner)
    }

    /// Replays every segment in ascending order into `memtable`.
    ///
    /// A segment that cannot be opened is skipped with a warning;
    /// corruption mid-segment keeps the valid prefix and moves on to the
    /// next segment.
    pub fn recover(&self, memtable: &Memtable) -> Result<RecoveryStats> {
        let _inner = self.inner.lock()?;
        let start = Instant::now();
        let mut stats = RecoveryStats::default();

        for log_number in self.list_log_files()? {
            let path = self.log_path(log_number);
            let mut reader = match WalReader::open(&path) {
                Ok(reader) => reader,
                Err(err) => {
                    tracing::warn!(
                        segment = log_number,
                        error = %err,
                        "skipping unreadable wal segment"
                    );
                    continue;
                }
            };

            loop {
                match reader.read_entry() {
                    Ok(Some(entry)) => {
                        stats.records_read += 1;
                        match entry.kind {
                            WalEntryKind::Put => {
                                memtable.put(entry.sequence, &entry.key, &entry.value)?;
                                stats.puts += 1;
                            }
                            WalEntryKind::Delete => {
                                memtable.delete(entry.sequence, &entry.key)?;
                                stats.deletes += 1;
                            }
                        }
                        stats.max_sequence = stats.max_sequence.max(entry.sequence);
                    }
                    Ok(None) => break,
                    Err(Error::Corruption(msg)) => {
                        // Torn tail from a crash mid-write; the valid
                        // prefix stands.
                        tracing::warn!(
                            segment = log_number,
                            offset = reader.position(),
                            reason = %msg,
                            "wal segment has a torn tail, continuing with next segment"
                        );
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            stats.bytes_read += reader.len();
        }

        stats.duration = start.elapsed();
        tracing::info!(
            records = stats.records_read,
            puts = stats.puts,
            deletes = stats.deletes,
            max_sequence = stats.max_sequence,
            bytes = stats.bytes_read,
            duration_us = stats.duration.as_micros() as u64,
            "wal recovery complete"
        );
        Ok(stats)
    }

    /// Unlinks every segment numbered below `flushed_log_number`.
    pub fn mark_flushed(&self, flushed_log_number: u64) -> Result<()> {
        let _inner = self.inner.lock()?;
        for log_number in self.list_log_files()? {
            if log_number >= flushed_log_number {
                continue;
            }
            let path = self.log_path(log_number);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(segment = log_number, "removed obsolete wal segment");
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub fn current_log_number(&self) -> u64 {
        self.inner
            .lock()
            .map(|inner| inner.current_log_number)
            .unwrap_or(0)
    }

    /// Segment numbers currently on disk, ascending.
    pub fn log_numbers(&self) -> Result<Vec<u64>> {
        let _inner = self.inner.lock()?;
        self.list_log_files()
    }

    /// Closes the current segment writer. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        if let Some(mut writer) = inner.writer.take() {
            writer.close()?;
        }
        Ok(())
    }

    fn wal_dir(&self) -> PathBuf {
        self.db_path.join("wal")
    }

    fn log_path(&self, log_number: u64) -> PathBuf {
        self.wal_dir().join(format!("log.{log_number:06}"))
    }

    fn list_log_files(&self) -> Result<Vec<u64>> {
        let entries = match std::fs::read_dir(self.wal_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut numbers = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix("log.") else {
                continue;
            };
            if suffix.len() == 6 && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(number) = suffix.parse::<u64>() {
                    numbers.push(number);
                }
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn open_new_log(&self, inner: &mut ManagerInner) -> Result<()> {
        inner.current_log_number += 1;
        let path = self.log_path(inner.current_log_number);
        inner.writer = Some(WalWriter::open(path, self.options.clone())?);
        tracing::debug!(segment = inner.current_log_number, "opened wal segment");
        Ok(())
    }

    fn rotate_locked(&self, inner: &mut ManagerInner) -> Result<()> {
        if let Some(mut writer) = inner.writer.take() {
            writer.sync()?;
            writer.close()?;
        }
        self.open_new_log(inner)
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemtableOptions;
    use crate::types::{LookupResult, MAX_SEQUENCE};
    use std::io::Write;
    use tempfile::TempDir;

    fn create_temp_dir() -> TempDir {
        TempDir::new().expect("Failed to create temporary directory")
    }

    fn create_memtable() -> Memtable {
        Memtable::new(MemtableOptions::default())
    }

    #[test]
    fn test_open_creates_directory_and_first_segment() {
        let dir = create_temp_dir();
        let manager =
            WalManager::open(dir.path(), WalOptions::default()).expect("Failed to open manager");

        assert_eq!(manager.current_log_number(), 1);
        assert!(dir.path().join("wal").join("log.000001").exists());
        assert_eq!(manager.log_numbers().expect("Listing failed"), vec![1]);
    }

    #[test]
    fn test_reopen_always_starts_a_new_segment() {
        let dir = create_temp_dir();
        {
            let manager = WalManager::open(dir.path(), WalOptions::default())
                .expect("Failed to open manager");
            manager.append_put(1, b"k", b"v").expect("Append failed");
        }

        // Even though log.000001 could be reused, a fresh segment is
        // always allocated.
        let manager =
            WalManager::open(dir.path(), WalOptions::default()).expect("Failed to reopen");
        assert_eq!(manager.current_log_number(), 2);
        assert_eq!(manager.log_numbers().expect("Listing failed"), vec![1, 2]);
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = create_temp_dir();
        let options = WalOptions::default().max_file_size(64);
        let manager = WalManager::open(dir.path(), options).expect("Failed to open manager");

        for seq in 0..10 {
            manager
                .append_put(seq, b"key", b"value")
                .expect("Append failed");
        }
        assert!(manager.current_log_number() > 1);
        assert!(manager.log_numbers().expect("Listing failed").len() > 1);
    }

    #[test]
    fn test_explicit_rotate() {
        let dir = create_temp_dir();
        let manager =
            WalManager::open(dir.path(), WalOptions::default()).expect("Failed to open manager");
        manager.rotate().expect("Rotation failed");
        assert_eq!(manager.current_log_number(), 2);
    }

    #[test]
    fn test_recover_replays_all_segments() {
        let dir = create_temp_dir();
        {
            let manager = WalManager::open(dir.path(), WalOptions::default())
                .expect("Failed to open manager");
            manager.append_put(1, b"k1", b"v1").expect("Append failed");
            manager.append_put(2, b"k2", b"v2").expect("Append failed");
            manager.rotate().expect("Rotation failed");
            manager.append_put(3, b"k1", b"v1b").expect("Append failed");
            manager.append_delete(4, b"k2").expect("Append failed");
        }

        let manager =
            WalManager::open(dir.path(), WalOptions::default()).expect("Failed to reopen");
        let memtable = create_memtable();
        let stats = manager.recover(&memtable).expect("Recovery failed");

        assert_eq!(stats.records_read, 4);
        assert_eq!(stats.puts, 3);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.max_sequence, 4);
        assert!(stats.bytes_read > 0);

        assert_eq!(
            memtable.get(b"k1", 10),
            LookupResult::Found(b"v1b".to_vec())
        );
        assert_eq!(memtable.get(b"k2", 10), LookupResult::Deleted);
    }

    #[test]
    fn test_recover_tolerates_torn_tail() {
        let dir = create_temp_dir();
        {
            let manager = WalManager::open(dir.path(), WalOptions::default())
                .expect("Failed to open manager");
            manager.append_put(1, b"k1", b"v1").expect("Append failed");
            manager.append_put(2, b"k2", b"v2").expect("Append failed");
            manager.append_put(3, b"k1", b"v1b").expect("Append failed");
            manager.append_delete(4, b"k2").expect("Append failed");
        }

        // Simulate a crash mid-write by appending garbage to the segment.
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("wal").join("log.000001"))
            .expect("Failed to reopen segment");
        file.write_all(&[0x5au8; 20]).expect("Failed to append garbage");
        drop(file);

        let manager =
            WalManager::open(dir.path(), WalOptions::default()).expect("Failed to reopen");
        let memtable = create_memtable();
        let stats = manager.recover(&memtable).expect("Recovery failed");

        assert_eq!(stats.records_read, 4);
        assert_eq!(stats.puts, 3);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.max_sequence, 4);
        assert_eq!(
            memtable.get(b"k1", MAX_SEQUENCE),
            LookupResult::Found(b"v1b".to_vec())
        );
        assert_eq!(memtable.get(b"k2", MAX_SEQUENCE), LookupResult::Deleted);
    }

    #[test]
    fn test_recover_continues_past_corrupt_segment() {
        let dir = create_temp_dir();
        {
            let manager = WalManager::open(dir.path(), WalOptions::default())
                .expect("Failed to open manager");
            manager.append_put(1, b"a", b"1").expect("Append failed");
            manager.rotate().expect("Rotation failed");
            manager.append_put(2, b"b", b"2").expect("Append failed");
        }

        // Corrupt the first segment entirely; the second must still
        // replay.
        std::fs::write(
            dir.path().join("wal").join("log.000001"),
            [0xffu8; 32],
        )
        .expect("Failed to overwrite segment");

        let manager =
            WalManager::open(dir.path(), WalOptions::default()).expect("Failed to reopen");
        let memtable = create_memtable();
        let stats = manager.recover(&memtable).expect("Recovery failed");

        assert_eq!(stats.records_read, 1);
        assert_eq!(
            memtable.get(b"b", MAX_SEQUENCE),
            LookupResult::Found(b"2".to_vec())
        );
        assert_eq!(memtable.get(b"a", MAX_SEQUENCE), LookupResult::NotFound);
    }

    #[test]
    fn test_mark_flushed_removes_old_segments() {
        let dir = create_temp_dir();
        let manager =
            WalManager::open(dir.path(), WalOptions::default()).expect("Failed to open manager");
        manager.append_put(1, b"k", b"v").expect("Append failed");
        manager.rotate().expect("Rotation failed");
        manager.append_put(2, b"k", b"v2").expect("Append failed");
        manager.rotate().expect("Rotation failed");
        assert_eq!(manager.log_numbers().expect("Listing failed"), vec![1, 2, 3]);

        manager.mark_flushed(3).expect("mark_flushed failed");
        assert_eq!(manager.log_numbers().expect("Listing failed"), vec![3]);
        assert!(!dir.path().join("wal").join("log.000001").exists());
        assert!(!dir.path().join("wal").join("log.000002").exists());

        // Already-removed segments are not an error.
        manager.mark_flushed(3).expect("mark_flushed failed");
    }

    #[test]
    fn test_write_path_composition_recovers_identically() {
        use crate::memtable::MemtableManager;

        let dir = create_temp_dir();
        {
            let memtables = MemtableManager::new(MemtableOptions::default());
            let wal = WalManager::open(dir.path(), WalOptions::default())
                .expect("Failed to open manager");

            // Each write carries one sequence number into both the
            // memtable and the log.
            let seq = memtables.put(b"a", b"1").expect("Put failed");
            wal.append_put(seq, b"a", b"1").expect("Append failed");
            let seq = memtables.put(b"b", b"2").expect("Put failed");
            wal.append_put(seq, b"b", b"2").expect("Append failed");
            let seq = memtables.delete(b"a").expect("Delete failed");
            wal.append_delete(seq, b"a").expect("Append failed");

            assert_eq!(memtables.get(b"a"), LookupResult::Deleted);
            assert_eq!(memtables.get(b"b"), LookupResult::Found(b"2".to_vec()));
        }

        // Replay into a fresh memtable and observe the same outcomes.
        let wal = WalManager::open(dir.path(), WalOptions::default())
            .expect("Failed to reopen manager");
        let memtable = create_memtable();
        let stats = wal.recover(&memtable).expect("Recovery failed");
        assert_eq!(stats.records_read, 3);

        assert_eq!(memtable.get(b"a", MAX_SEQUENCE), LookupResult::Deleted);
        assert_eq!(
            memtable.get(b"b", MAX_SEQUENCE),
            LookupResult::Found(b"2".to_vec())
        );
        assert_eq!(memtable.get(b"c", MAX_SEQUENCE), LookupResult::NotFound);
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = create_temp_dir();
        let manager =
            WalManager::open(dir.path(), WalOptions::default()).expect("Failed to open manager");
        manager.close().expect("Close failed");
        assert!(matches!(
            manager.append_put(1, b"k", b"v"),
            Err(Error::Io(_))
        ));
    }
}
