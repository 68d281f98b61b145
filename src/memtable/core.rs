//! In-memory multi-version sorted write buffer.
//!
//! Entries are `(InternalKey, value)` pairs in a skip list ordered by
//! user key ascending, then sequence descending, so the newest version of
//! a key is the first one a seek lands on. Entries are never removed or
//! mutated after insertion; space is reclaimed when the whole memtable is
//! dropped at its last reference.
//!
//! Writes are single-writer (the manager serializes them); reads are
//! wait-free and may run concurrently with the writer. Shared ownership
//! between the manager's queue and in-flight readers is expressed with
//! `Arc`, so destruction happens deterministically at the last release.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::config::MemtableOptions;
use crate::error::Result;
use crate::types::{InternalKey, LookupResult, SequenceNumber, ValueKind, MAX_SEQUENCE};
use crate::Error;

use super::skiplist::{Comparator, SkipList, SkipListIter};

/// One versioned entry: the internal key plus the value bytes. The value
/// is empty for tombstones.
pub struct MemtableEntry {
    key: InternalKey,
    value: Vec<u8>,
}

/// Orders entries by user key ascending, then sequence descending.
struct EntryComparator;

impl Comparator<MemtableEntry> for EntryComparator {
    fn compare(&self, a: &MemtableEntry, b: &MemtableEntry) -> CmpOrdering {
        a.key.cmp(&b.key)
    }
}

/// A reference-counted, multi-version sorted buffer. Immutable once the
/// manager freezes it during rotation.
pub struct Memtable {
    options: MemtableOptions,
    list: SkipList<MemtableEntry, EntryComparator>,
    frozen: AtomicBool,
    entry_count: AtomicUsize,
    approximate_usage: AtomicUsize,
    min_sequence: AtomicU64,
    max_sequence: AtomicU64,
}

impl Memtable {
    pub fn new(options: MemtableOptions) -> Self {
        let list = SkipList::new(
            EntryComparator,
            options.max_height,
            options.branching_factor,
        );
        Self {
            options,
            list,
            frozen: AtomicBool::new(false),
            entry_count: AtomicUsize::new(0),
            approximate_usage: AtomicUsize::new(0),
            min_sequence: AtomicU64::new(MAX_SEQUENCE),
            max_sequence: AtomicU64::new(0),
        }
    }

    /// Inserts a live value. `seq` must be strictly greater than every
    /// sequence previously inserted into this memtable (the manager
    /// enforces this); single-writer only.
    pub fn put(&self, seq: SequenceNumber, key: &[u8], value: &[u8]) -> Result<()> {
        self.add(seq, ValueKind::Value, key, value)
    }

    /// Inserts a tombstone for `key`. Same contract as [`Memtable::put`].
    pub fn delete(&self, seq: SequenceNumber, key: &[u8]) -> Result<()> {
        self.add(seq, ValueKind::Deletion, key, &[])
    }

    fn add(&self, seq: SequenceNumber, kind: ValueKind, key: &[u8], value: &[u8]) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }

        let entry_size = key.len()
            + value.len()
            + std::mem::size_of::<MemtableEntry>()
            + std::mem::size_of::<SequenceNumber>()
            + std::mem::size_of::<ValueKind>();
        self.approximate_usage
            .fetch_add(entry_size, Ordering::Relaxed);
        self.list.insert(MemtableEntry {
            key: InternalKey::new(key.to_vec(), seq, kind),
            value: value.to_vec(),
        });
        self.entry_count.fetch_add(1, Ordering::Relaxed);

        let mut observed = self.min_sequence.load(Ordering::Relaxed);
        while seq < observed {
            match self.min_sequence.compare_exchange_weak(
                observed,
                seq,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => observed = current,
            }
        }

        let mut observed = self.max_sequence.load(Ordering::Relaxed);
        while seq > observed {
            match self.max_sequence.compare_exchange_weak(
                observed,
                seq,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => observed = current,
            }
        }

        Ok(())
    }

    /// Looks up the newest version of `key` visible at `snapshot`.
    ///
    /// Versions of a key sort newest-first, so seeking to
    /// `(key, snapshot, Value)` lands on the first visible version if one
    /// exists. Safe under concurrent readers.
    pub fn get(&self, key: &[u8], snapshot: SequenceNumber) -> LookupResult {
        let lookup = MemtableEntry {
            key: InternalKey::new(key.to_vec(), snapshot, ValueKind::Value),
            value: Vec::new(),
        };

        let mut iter = self.list.iter();
        iter.seek(&lookup);
        if iter.valid() {
            let entry = iter.key();
            if entry.key.user_key == key {
                return match entry.key.kind {
                    ValueKind::Deletion => LookupResult::Deleted,
                    ValueKind::Value => LookupResult::Found(entry.value.clone()),
                };
            }
        }
        LookupResult::NotFound
    }

    /// A restartable forward/backward cursor over all entries.
    pub fn iter(&self) -> MemtableIter<'_> {
        MemtableIter {
            iter: self.list.iter(),
        }
    }

    /// Whether the buffer has reached its configured size threshold.
    pub fn should_flush(&self) -> bool {
        self.approximate_memory_usage() >= self.options.max_size
    }

    /// Marks the memtable read-only. Further writes fail with `ReadOnly`,
    /// as does freezing twice.
    pub fn freeze(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    /// Accumulated per-entry footprint: key and value bytes plus fixed
    /// entry overhead. A fresh memtable reports zero.
    pub fn approximate_memory_usage(&self) -> usize {
        self.approximate_usage.load(Ordering::Relaxed)
    }

    /// Smallest sequence inserted, or [`MAX_SEQUENCE`] when empty.
    pub fn min_sequence(&self) -> SequenceNumber {
        self.min_sequence.load(Ordering::Relaxed)
    }

    /// Largest sequence inserted, or 0 when empty.
    pub fn max_sequence(&self) -> SequenceNumber {
        self.max_sequence.load(Ordering::Relaxed)
    }
}

/// Cursor over memtable entries in internal key order.
pub struct MemtableIter<'a> {
    iter: SkipListIter<'a, MemtableEntry, EntryComparator>,
}

impl MemtableIter<'_> {
    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    pub fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    /// Positions at the first entry with internal key >= `target`.
    pub fn seek(&mut self, target: &InternalKey) {
        self.iter.seek(&MemtableEntry {
            key: target.clone(),
            value: Vec::new(),
        });
    }

    pub fn next(&mut self) {
        self.iter.next();
    }

    pub fn prev(&mut self) {
        self.iter.prev();
    }

    pub fn user_key(&self) -> &[u8] {
        &self.iter.key().key.user_key
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.iter.key().key.sequence
    }

    pub fn kind(&self) -> ValueKind {
        self.iter.key().key.kind
    }

    pub fn value(&self) -> &[u8] {
        &self.iter.key().value
    }

    pub fn internal_key(&self) -> &InternalKey {
        &self.iter.key().key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_memtable() -> Memtable {
        Memtable::new(MemtableOptions::default())
    }

    #[test]
    fn test_put_and_get() {
        let memtable = create_memtable();
        memtable.put(1, b"key1", b"value1").expect("Put failed");
        memtable.put(2, b"key2", b"value2").expect("Put failed");

        assert_eq!(
            memtable.get(b"key1", MAX_SEQUENCE),
            LookupResult::Found(b"value1".to_vec())
        );
        assert_eq!(
            memtable.get(b"key2", MAX_SEQUENCE),
            LookupResult::Found(b"value2".to_vec())
        );
        assert_eq!(memtable.get(b"key3", MAX_SEQUENCE), LookupResult::NotFound);
    }

    #[test]
    fn test_tombstone_masks_older_value() {
        let memtable = create_memtable();
        memtable.put(1, b"key", b"value").expect("Put failed");
        memtable.delete(2, b"key").expect("Delete failed");

        assert_eq!(memtable.get(b"key", MAX_SEQUENCE), LookupResult::Deleted);
        // The older version stays visible at an older snapshot.
        assert_eq!(
            memtable.get(b"key", 1),
            LookupResult::Found(b"value".to_vec())
        );
    }

    #[test]
    fn test_snapshot_visibility() {
        let memtable = create_memtable();
        memtable.put(1, b"k", b"v1").expect("Put failed");
        memtable.put(5, b"k", b"v5").expect("Put failed");
        memtable.put(10, b"k", b"v10").expect("Put failed");

        assert_eq!(memtable.get(b"k", 3), LookupResult::Found(b"v1".to_vec()));
        assert_eq!(memtable.get(b"k", 7), LookupResult::Found(b"v5".to_vec()));
        assert_eq!(memtable.get(b"k", 15), LookupResult::Found(b"v10".to_vec()));
        assert_eq!(memtable.get(b"k", 0), LookupResult::NotFound);
    }

    #[test]
    fn test_freeze_rejects_writes() {
        let memtable = create_memtable();
        memtable.put(1, b"key", b"value").expect("Put failed");
        memtable.freeze().expect("Failed to freeze");

        assert!(matches!(memtable.put(2, b"key2", b"v"), Err(Error::ReadOnly)));
        assert!(matches!(memtable.delete(2, b"key"), Err(Error::ReadOnly)));
        assert!(matches!(memtable.freeze(), Err(Error::ReadOnly)));
        assert!(memtable.is_frozen());

        // Reads still work.
        assert_eq!(
            memtable.get(b"key", MAX_SEQUENCE),
            LookupResult::Found(b"value".to_vec())
        );
    }

    #[test]
    fn test_iteration_newest_version_first() {
        let memtable = create_memtable();
        memtable.put(1, b"a", b"a1").expect("Put failed");
        memtable.put(3, b"a", b"a3").expect("Put failed");
        memtable.put(2, b"b", b"b2").expect("Put failed");

        let mut iter = memtable.iter();
        iter.seek_to_first();

        // Versions of "a" in descending sequence order, then "b".
        assert_eq!((iter.user_key(), iter.sequence()), (&b"a"[..], 3));
        iter.next();
        assert_eq!((iter.user_key(), iter.sequence()), (&b"a"[..], 1));
        iter.next();
        assert_eq!((iter.user_key(), iter.sequence()), (&b"b"[..], 2));
        iter.next();
        assert!(!iter.valid());
    }

    #[test]
    fn test_iterator_seek_and_prev() {
        let memtable = create_memtable();
        memtable.put(1, b"a", b"1").expect("Put failed");
        memtable.put(2, b"c", b"2").expect("Put failed");
        memtable.put(3, b"e", b"3").expect("Put failed");

        let mut iter = memtable.iter();
        iter.seek(&InternalKey::new(b"b".to_vec(), MAX_SEQUENCE, ValueKind::Value));
        assert!(iter.valid());
        assert_eq!(iter.user_key(), b"c");

        iter.prev();
        assert!(iter.valid());
        assert_eq!(iter.user_key(), b"a");

        iter.seek_to_last();
        assert_eq!(iter.user_key(), b"e");
        assert_eq!(iter.kind(), ValueKind::Value);
        assert_eq!(iter.value(), b"3");
    }

    #[test]
    fn test_counters() {
        let memtable = create_memtable();
        assert_eq!(memtable.entry_count(), 0);
        assert_eq!(memtable.min_sequence(), MAX_SEQUENCE);
        assert_eq!(memtable.max_sequence(), 0);

        memtable.put(5, b"a", b"hello").expect("Put failed");
        memtable.put(3, b"b", b"world").expect("Put failed");
        memtable.delete(9, b"a").expect("Delete failed");

        assert_eq!(memtable.entry_count(), 3);
        assert_eq!(memtable.min_sequence(), 3);
        assert_eq!(memtable.max_sequence(), 9);
        assert!(memtable.approximate_memory_usage() > 0);
    }

    #[test]
    fn test_should_flush_threshold() {
        let memtable = Memtable::new(MemtableOptions::default().max_size(64));
        assert!(!memtable.should_flush());
        // Entry overhead alone exceeds a 64-byte budget.
        memtable.put(1, b"key", b"value").expect("Put failed");
        assert!(memtable.should_flush());
    }
}
