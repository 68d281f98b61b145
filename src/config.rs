use std::time::Duration;

use crate::bloom::BloomPolicy;

/// Configuration for a memtable and its skip list.
#[derive(Debug, Clone)]
pub struct MemtableOptions {
    /// Size threshold at which the memtable reports it should be flushed
    /// (default: 4MB).
    pub max_size: usize,

    /// Maximum skip list height (default: 12).
    pub max_height: usize,

    /// Skip list branching factor: a node is promoted one level with
    /// probability 1/branching_factor (default: 4).
    pub branching_factor: u32,
}

impl Default for MemtableOptions {
    fn default() -> Self {
        Self {
            max_size: 4 * 1024 * 1024,
            max_height: 12,
            branching_factor: 4,
        }
    }
}

impl MemtableOptions {
    /// Set the flush size threshold.
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the maximum skip list height.
    pub fn max_height(mut self, height: usize) -> Self {
        self.max_height = height;
        self
    }

    /// Set the skip list branching factor.
    pub fn branching_factor(mut self, factor: u32) -> Self {
        self.branching_factor = factor;
        self
    }
}

/// When the WAL writer forces its data to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// fsync before returning from every append. Safest, slowest.
    PerWrite,
    /// fsync once the bytes written since the last sync reach
    /// `sync_batch_size`.
    Batched,
    /// A background thread fsyncs on request or every `sync_interval`.
    Periodic,
    /// Never fsync automatically; the OS decides. An explicit `sync()`
    /// still forces one.
    Never,
}

/// Configuration for WAL segments.
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Durability policy applied after each append (default: PerWrite).
    pub sync_policy: SyncPolicy,

    /// Byte threshold for `SyncPolicy::Batched` (default: 1MB).
    pub sync_batch_size: usize,

    /// Wakeup interval for `SyncPolicy::Periodic` (default: 100ms).
    pub sync_interval: Duration,

    /// Segment size at which the writer reports it should be rotated
    /// (default: 64MB).
    pub max_file_size: u64,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::PerWrite,
            sync_batch_size: 1024 * 1024,
            sync_interval: Duration::from_millis(100),
            max_file_size: 64 * 1024 * 1024,
        }
    }
}

impl WalOptions {
    /// Set the sync policy.
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Set the batched-sync byte threshold.
    pub fn sync_batch_size(mut self, size: usize) -> Self {
        self.sync_batch_size = size;
        self
    }

    /// Set the periodic-sync wakeup interval.
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the segment rotation threshold.
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }
}

/// Configuration for SSTable files.
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Target uncompressed size of a data block (default: 4KB).
    pub block_size: usize,

    /// Entries between full-key restart points in a data block
    /// (default: 16).
    pub restart_interval: usize,

    /// Verify block checksums when reading blocks back (default: true).
    pub verify_checksums: bool,

    /// Build a bloom filter over user keys (default: true).
    pub use_bloom_filter: bool,

    /// Bloom filter sizing policy (default: 10 bits/key).
    pub bloom_policy: BloomPolicy,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            block_size: 4096,
            restart_interval: 16,
            verify_checksums: true,
            use_bloom_filter: true,
            bloom_policy: BloomPolicy::default(),
        }
    }
}

impl TableOptions {
    /// Set the target data block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the restart interval.
    pub fn restart_interval(mut self, interval: usize) -> Self {
        self.restart_interval = interval;
        self
    }

    /// Enable or disable checksum verification on reads.
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Enable or disable the bloom filter.
    pub fn use_bloom_filter(mut self, enabled: bool) -> Self {
        self.use_bloom_filter = enabled;
        self
    }

    /// Set the bloom filter policy.
    pub fn bloom_policy(mut self, policy: BloomPolicy) -> Self {
        self.bloom_policy = policy;
        self
    }
}
