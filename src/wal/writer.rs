//! Append-only writer for one WAL segment.
//!
//! A single mutex guards the file descriptor and counters; every append
//! serializes behind it and issues one `write` of header plus payload to
//! limit the surface a crash can tear. Durability is governed by the
//! configured [`SyncPolicy`]; the `Periodic` policy runs a background
//! thread parked on a condvar with a timeout and a "sync requested" flag
//! so bursts of appends coalesce into one fsync.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::{SyncPolicy, WalOptions};
use crate::encoding::put_fixed16;
use crate::error::Result;
use crate::types::SequenceNumber;
use crate::{invalid_argument, Error};

use super::{record_checksum, RecordKind, WalEntry, MAX_PAYLOAD_SIZE, RECORD_HEADER_SIZE};

struct Inner {
    file: Option<File>,
    bytes_since_sync: usize,
    closed: bool,
    sync_requested: bool,
}

impl Inner {
    fn sync(&mut self) -> Result<()> {
        if let Some(file) = &self.file {
            if self.bytes_since_sync > 0 {
                file.sync_all()?;
                self.bytes_since_sync = 0;
            }
        }
        Ok(())
    }
}

struct Shared {
    inner: Mutex<Inner>,
    sync_cv: Condvar,
    file_size: AtomicU64,
}

/// Writer for a single append-mode segment file.
pub struct WalWriter {
    path: PathBuf,
    options: WalOptions,
    shared: Arc<Shared>,
    sync_thread: Option<JoinHandle<()>>,
}

impl WalWriter {
    /// Opens or creates the segment in append mode. Starts the
    /// background sync thread iff the policy is `Periodic`.
    pub fn open(path: impl AsRef<Path>, options: WalOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let file_size = file.metadata()?.len();

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                file: Some(file),
                bytes_since_sync: 0,
                closed: false,
                sync_requested: false,
            }),
            sync_cv: Condvar::new(),
            file_size: AtomicU64::new(file_size),
        });

        let sync_thread = if options.sync_policy == SyncPolicy::Periodic {
            let shared = Arc::clone(&shared);
            let interval = options.sync_interval;
            Some(std::thread::spawn(move || run_sync_thread(shared, interval)))
        } else {
            None
        };

        Ok(Self {
            path,
            options,
            shared,
            sync_thread,
        })
    }

    /// Appends one entry as a `Full` record.
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        self.append_record(&entry.encode())
    }

    pub fn append_put(&self, seq: SequenceNumber, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(&WalEntry::put(seq, key, value))
    }

    pub fn append_delete(&self, seq: SequenceNumber, key: &[u8]) -> Result<()> {
        self.append(&WalEntry::delete(seq, key))
    }

    /// Forces an fsync iff unsynced bytes are pending.
    pub fn sync(&self) -> Result<()> {
        self.shared.inner.lock()?.sync()
    }

    /// Current segment size in bytes.
    pub fn file_size(&self) -> u64 {
        self.shared.file_size.load(Ordering::Relaxed)
    }

    /// Whether the segment has reached its configured maximum size.
    pub fn should_rotate(&self) -> bool {
        self.file_size() >= self.options.max_file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops the sync thread if any, then fsyncs and closes the file.
    /// Idempotent.
    pub fn close(&mut self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock()?;
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
        }
        self.shared.sync_cv.notify_all();

        if let Some(thread) = self.sync_thread.take() {
            let _ = thread.join();
        }

        let mut inner = self.shared.inner.lock()?;
        if let Some(file) = inner.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn append_record(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(invalid_argument!(
                "wal payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE} byte record limit",
                payload.len()
            ));
        }

        // crc placeholder | length | type | payload
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        record.extend_from_slice(&[0u8; 4]);
        put_fixed16(&mut record, payload.len() as u16);
        record.push(RecordKind::Full as u8);
        record.extend_from_slice(payload);

        let crc = record_checksum(&record[6..], &record[4..6]);
        LittleEndian::write_u32(&mut record[0..4], crc);

        let mut inner = self.shared.inner.lock()?;
        let Some(file) = &mut inner.file else {
            return Err(Error::Io("wal segment is closed".to_string()));
        };

        // One write call for the whole record.
        file.write_all(&record)?;
        self.shared
            .file_size
            .fetch_add(record.len() as u64, Ordering::Relaxed);
        inner.bytes_since_sync += record.len();

        match self.options.sync_policy {
            SyncPolicy::PerWrite => inner.sync()?,
            SyncPolicy::Batched => {
                if inner.bytes_since_sync >= self.options.sync_batch_size {
                    inner.sync()?;
                }
            }
            SyncPolicy::Periodic => {
                inner.sync_requested = true;
                self.shared.sync_cv.notify_one();
            }
            SyncPolicy::Never => {}
        }
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run_sync_thread(shared: Arc<Shared>, interval: Duration) {
    let Ok(mut inner) = shared.inner.lock() else {
        return;
    };
    while !inner.closed {
        let result = shared
            .sync_cv
            .wait_timeout_while(inner, interval, |inner| {
                !inner.closed && !inner.sync_requested
            });
        match result {
            Ok((guard, _)) => inner = guard,
            Err(_) => return,
        }
        if inner.closed {
            return;
        }
        if let Err(err) = inner.sync() {
            tracing::warn!(error = %err, "periodic wal sync failed");
        }
        inner.sync_requested = false;
    }
}
