//! Write-path core of a log-structured merge key-value store.
//!
//! Writes land in a sorted in-memory buffer ([`memtable::Memtable`])
//! coordinated by a [`memtable::MemtableManager`], are made durable by a
//! write-ahead log ([`wal::WalManager`]), and are eventually persisted as
//! immutable sorted tables by [`sstable::TableWriter`].
//!
//! The manager and the WAL are deliberately independent. The manager
//! assigns each write its sequence number while holding the write lock;
//! the caller then logs the same sequence to the WAL. A write is
//! therefore visible to `get` before it is durable: after a crash,
//! writes whose records never reached the log, or were not yet synced
//! under the `Batched`, `Periodic`, or `Never` policies, are lost.
//! `PerWrite` narrows that window to the gap between the memtable
//! insert and the logged, synced append.

pub mod bloom;
pub mod config;
pub mod encoding;
pub mod error;
pub mod memtable;
pub mod sstable;
pub mod types;
pub mod wal;

pub use config::{MemtableOptions, SyncPolicy, TableOptions, WalOptions};
pub use error::{Error, Result};
pub use memtable::{Memtable, MemtableManager};
pub use sstable::{TableWriter, WriteStats};
pub use types::{InternalKey, LookupResult, SequenceNumber, ValueKind};
pub use wal::{RecoveryStats, WalManager, WalReader, WalWriter};
