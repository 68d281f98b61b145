//! Rotation and read fan-out over one active memtable plus a queue of
//! immutables.
//!
//! The manager owns the write path's ordering guarantees: the exclusive
//! lock is held across sequence allocation and the skip list insert, so
//! for any two visible writes `A` and `B`, `seq(A) < seq(B)` exactly when
//! `A` linearized first. Readers take the shared side and probe the
//! active memtable, then each immutable from newest to oldest.
//!
//! Rotation freezes the active memtable, hands its reference to the back
//! of the immutables queue, and installs a fresh buffer. A flush worker
//! later drains the queue front via [`MemtableManager::oldest_immutable`]
//! and [`MemtableManager::remove_flushed_memtable`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::MemtableOptions;
use crate::error::Result;
use crate::types::{LookupResult, SequenceNumber, ValueKind};

use super::core::Memtable;

/// Invoked synchronously inside the rotation critical section with the
/// just-frozen memtable. Must not block on the manager's lock; typically
/// it clones the `Arc` to pin the table and wakes a flush worker.
pub type FlushCallback = Box<dyn Fn(&Arc<Memtable>) + Send + Sync>;

struct ManagerState {
    active: Arc<Memtable>,
    immutables: VecDeque<Arc<Memtable>>,
    flush_callback: Option<FlushCallback>,
}

/// A consistent read fan-out: every memtable that existed at `snapshot`,
/// newest first, pinned for the lifetime of the set.
pub struct MemtableSet {
    pub snapshot: SequenceNumber,
    /// Active memtable first, then immutables newest to oldest. Dropping
    /// the set releases every pin.
    pub tables: Vec<Arc<Memtable>>,
}

/// Serializes writers, issues sequence numbers, and coordinates rotation
/// with flush workers.
pub struct MemtableManager {
    options: MemtableOptions,
    state: RwLock<ManagerState>,
    current_sequence: AtomicU64,
    immutable_count: AtomicUsize,
    flush_lock: Mutex<()>,
    flush_cv: Condvar,
}

impl MemtableManager {
    pub fn new(options: MemtableOptions) -> Self {
        let active = Arc::new(Memtable::new(options.clone()));
        Self {
            options,
            state: RwLock::new(ManagerState {
                active,
                immutables: VecDeque::new(),
                flush_callback: None,
            }),
            current_sequence: AtomicU64::new(0),
            immutable_count: AtomicUsize::new(0),
            flush_lock: Mutex::new(()),
            flush_cv: Condvar::new(),
        }
    }

    /// Writes a live value, rotating first if the active memtable is
    /// full. Returns the assigned sequence number.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<SequenceNumber> {
        self.write(ValueKind::Value, key, value)
    }

    /// Writes a tombstone for `key`. Returns the assigned sequence number.
    pub fn delete(&self, key: &[u8]) -> Result<SequenceNumber> {
        self.write(ValueKind::Deletion, key, &[])
    }

    fn write(&self, kind: ValueKind, key: &[u8], value: &[u8]) -> Result<SequenceNumber> {
        let mut state = self.state.write()?;

        if state.active.should_flush() {
            self.rotate_locked(&mut state)?;
        }

        let seq = self.current_sequence.fetch_add(1, Ordering::AcqRel);
        match kind {
            ValueKind::Value => state.active.put(seq, key, value)?,
            ValueKind::Deletion => state.active.delete(seq, key)?,
        }
        Ok(seq)
    }

    /// Reads at the current sequence.
    pub fn get(&self, key: &[u8]) -> LookupResult {
        let snapshot = self.current_sequence.load(Ordering::Acquire);
        self.get_at(key, snapshot)
    }

    /// Reads at an explicit snapshot: only versions with
    /// `sequence <= snapshot` are visible. Probes the active memtable,
    /// then immutables newest to oldest, returning the first resolved
    /// outcome.
    pub fn get_at(&self, key: &[u8], snapshot: SequenceNumber) -> LookupResult {
        let state = match self.state.read() {
            Ok(state) => state,
            Err(_) => return LookupResult::NotFound,
        };

        let result = state.active.get(key, snapshot);
        if result.is_resolved() {
            return result;
        }

        for memtable in state.immutables.iter().rev() {
            let result = memtable.get(key, snapshot);
            if result.is_resolved() {
                return result;
            }
        }

        LookupResult::NotFound
    }

    /// Issues a unique, monotonically increasing sequence number.
    pub fn allocate_sequence(&self) -> SequenceNumber {
        self.current_sequence.fetch_add(1, Ordering::AcqRel)
    }

    /// The next sequence number that will be issued; doubles as the
    /// default read snapshot.
    pub fn current_sequence(&self) -> SequenceNumber {
        self.current_sequence.load(Ordering::Acquire)
    }

    /// Rotates the active memtable regardless of its size.
    pub fn force_rotation(&self) -> Result<()> {
        let mut state = self.state.write()?;
        self.rotate_locked(&mut state)
    }

    /// Pops the oldest immutable after a flush worker has persisted it,
    /// releasing the queue's reference and waking one flush waiter.
    pub fn remove_flushed_memtable(&self) -> Result<()> {
        let mut state = self.state.write()?;
        if let Some(oldest) = state.immutables.pop_front() {
            self.immutable_count.fetch_sub(1, Ordering::SeqCst);
            drop(oldest);

            // Taking the flush lock orders the count update before the
            // wakeup, so a waiter checking the count cannot miss it.
            let _guard = self.flush_lock.lock()?;
            self.flush_cv.notify_one();
        }
        Ok(())
    }

    /// The oldest immutable with an added pin, or None when the queue is
    /// empty.
    pub fn oldest_immutable(&self) -> Option<Arc<Memtable>> {
        let state = self.state.read().ok()?;
        state.immutables.front().cloned()
    }

    /// Pins every current memtable for a consistent multi-table read.
    pub fn current_memtables(&self) -> Result<MemtableSet> {
        let state = self.state.read()?;
        let snapshot = self.current_sequence.load(Ordering::Acquire);

        let mut tables = Vec::with_capacity(1 + state.immutables.len());
        tables.push(Arc::clone(&state.active));
        for memtable in state.immutables.iter().rev() {
            tables.push(Arc::clone(memtable));
        }

        Ok(MemtableSet { snapshot, tables })
    }

    /// Blocks until fewer than `max_immutables` are queued or the timeout
    /// elapses. Returns whether the condition was met.
    pub fn wait_for_flush(&self, max_immutables: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = match self.flush_lock.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        loop {
            if self.immutable_count.load(Ordering::SeqCst) < max_immutables {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.flush_cv.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => guard = g,
                Err(_) => return false,
            }
        }
    }

    /// Installs the rotation callback.
    pub fn set_flush_callback(&self, callback: FlushCallback) -> Result<()> {
        let mut state = self.state.write()?;
        state.flush_callback = Some(callback);
        Ok(())
    }

    pub fn immutable_count(&self) -> usize {
        self.immutable_count.load(Ordering::SeqCst)
    }

    /// Combined approximate usage of the active memtable and the queue.
    pub fn total_memory_usage(&self) -> usize {
        let state = match self.state.read() {
            Ok(state) => state,
            Err(_) => return 0,
        };
        state.active.approximate_memory_usage()
            + state
                .immutables
                .iter()
                .map(|m| m.approximate_memory_usage())
                .sum::<usize>()
    }

    pub fn active_memory_usage(&self) -> usize {
        self.state
            .read()
            .map(|state| state.active.approximate_memory_usage())
            .unwrap_or(0)
    }

    fn rotate_locked(&self, state: &mut ManagerState) -> Result<()> {
        let fresh = Arc::new(Memtable::new(self.options.clone()));
        let frozen = std::mem::replace(&mut state.active, fresh);
        frozen.freeze()?;

        tracing::debug!(
            entries = frozen.entry_count(),
            bytes = frozen.approximate_memory_usage(),
            queued = state.immutables.len() + 1,
            "rotated memtable"
        );

        state.immutables.push_back(Arc::clone(&frozen));
        self.immutable_count.fetch_add(1, Ordering::SeqCst);

        if let Some(callback) = &state.flush_callback {
            callback(&frozen);
        }
        Ok(())
    }
}
