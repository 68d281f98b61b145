//! Bump-pointer arena backing skip list nodes.
//!
//! Allocations are served from the tail of the current block; requests
//! larger than a quarter block get a dedicated block so the remainder of
//! the current block is not wasted. Memory is only reclaimed when the
//! arena is dropped, which is what makes wait-free skip list reads
//! possible: a node pointer obtained by a reader stays valid for as long
//! as the owning memtable is alive.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a standard arena block.
pub const BLOCK_SIZE: usize = 4096;

/// A single-owner bump allocator.
///
/// Allocation is not thread-safe: only the memtable's single writer may
/// call [`Arena::alloc`] or [`Arena::alloc_aligned`]. [`Arena::memory_usage`]
/// is safe from any thread.
pub struct Arena {
    core: UnsafeCell<Core>,
    memory_usage: AtomicUsize,
}

struct Core {
    alloc_ptr: *mut u8,
    alloc_remaining: usize,
    blocks: Vec<(*mut u8, Layout)>,
}

// Readers only touch the atomic usage counter; the single-writer contract
// covers the allocation side.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new() -> Self {
        Self {
            core: UnsafeCell::new(Core {
                alloc_ptr: std::ptr::null_mut(),
                alloc_remaining: 0,
                blocks: Vec::new(),
            }),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Allocates `bytes` with no alignment guarantee beyond 1.
    ///
    /// # Safety
    ///
    /// Caller must be the arena's single writer.
    pub unsafe fn alloc(&self, bytes: usize) -> *mut u8 {
        debug_assert!(bytes > 0);
        let core = &mut *self.core.get();
        if bytes <= core.alloc_remaining {
            let result = core.alloc_ptr;
            core.alloc_ptr = core.alloc_ptr.add(bytes);
            core.alloc_remaining -= bytes;
            return result;
        }
        self.alloc_fallback(core, bytes)
    }

    /// Allocates `bytes` aligned to `align`, which must be a power of two.
    ///
    /// # Safety
    ///
    /// Caller must be the arena's single writer.
    pub unsafe fn alloc_aligned(&self, bytes: usize, align: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two());
        let core = &mut *self.core.get();

        let current = core.alloc_ptr as usize;
        let padding = current.wrapping_neg() & (align - 1);
        let needed = bytes + padding;

        let block_align = align.max(std::mem::align_of::<usize>());
        let result = if needed <= core.alloc_remaining {
            let result = core.alloc_ptr.add(padding);
            core.alloc_ptr = core.alloc_ptr.add(needed);
            core.alloc_remaining -= needed;
            result
        } else if bytes > BLOCK_SIZE / 4 {
            self.new_block(core, bytes, block_align)
        } else {
            // Fresh blocks start aligned, so no padding is needed.
            let block = self.new_block(core, BLOCK_SIZE, block_align);
            core.alloc_ptr = block.add(bytes);
            core.alloc_remaining = BLOCK_SIZE - bytes;
            block
        };

        debug_assert_eq!(result as usize & (align - 1), 0);
        result
    }

    /// Total bytes reserved from the system. Monotonically non-decreasing.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    unsafe fn alloc_fallback(&self, core: &mut Core, bytes: usize) -> *mut u8 {
        if bytes > BLOCK_SIZE / 4 {
            // Serve oversized requests from their own block so the current
            // block's tail stays usable.
            return self.new_block(core, bytes, std::mem::align_of::<usize>());
        }

        let block = self.new_block(core, BLOCK_SIZE, std::mem::align_of::<usize>());
        core.alloc_ptr = block.add(bytes);
        core.alloc_remaining = BLOCK_SIZE - bytes;
        block
    }

    unsafe fn new_block(&self, core: &mut Core, bytes: usize, align: usize) -> *mut u8 {
        let layout = Layout::from_size_align(bytes, align).expect("invalid arena layout");
        let block = alloc(layout);
        assert!(!block.is_null(), "arena allocation failed");
        core.blocks.push((block, layout));
        self.memory_usage.fetch_add(
            bytes + std::mem::size_of::<(*mut u8, Layout)>(),
            Ordering::Relaxed,
        );
        block
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        for &(block, layout) in &core.blocks {
            unsafe { dealloc(block, layout) };
        }
    }
}
