//! Arena-backed skip list with wait-free reads.
//!
//! ```text
//! Level 3:  HEAD ----------------------------> 50 ----------> NIL
//! Level 2:  HEAD ----------> 20 -------------> 50 ----------> NIL
//! Level 1:  HEAD --> 10 --> 20 ----> 35 -----> 50 --> 60 ---> NIL
//! Level 0:  HEAD --> 10 --> 20 --> 25 --> 35 > 50 --> 60 --> 70 > NIL
//! ```
//!
//! # Concurrency
//!
//! Inserts require a single writer: the caller must guarantee no two
//! inserts run concurrently (the memtable manager serializes writers with
//! its exclusive lock). Reads are wait-free and may run concurrently with
//! the writer: a new node's next pointers are initialized with relaxed
//! stores before the node is published bottom-up with release stores on
//! the predecessors' next pointers, and readers acquire-load every next
//! pointer. The observed maximum height is raised with a plain store
//! after the lower levels are linked; a reader that sees the new height
//! before the node is reachable simply falls through empty upper levels.
//!
//! Node memory comes from the owning memtable's [`Arena`], which outlives
//! every reader that can hold a node reference.

use std::cmp::Ordering as CmpOrdering;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use rand::Rng;

use super::arena::Arena;

/// Hard cap on skip list height.
pub const MAX_HEIGHT: usize = 12;

/// Three-way comparison over skip list keys.
pub trait Comparator<K> {
    fn compare(&self, a: &K, b: &K) -> CmpOrdering;
}

#[repr(C)]
struct Node<K> {
    key: MaybeUninit<K>,
    // Declared with one slot; nodes are allocated with `height` slots and
    // the extra pointers live directly past the struct.
    next: [AtomicPtr<Node<K>>; 1],
}

impl<K> Node<K> {
    unsafe fn key(&self) -> &K {
        self.key.assume_init_ref()
    }

    unsafe fn next_slot(&self, level: usize) -> &AtomicPtr<Node<K>> {
        &*self.next.as_ptr().add(level)
    }

    unsafe fn next(&self, level: usize) -> *mut Node<K> {
        self.next_slot(level).load(Ordering::Acquire)
    }

    unsafe fn set_next(&self, level: usize, node: *mut Node<K>) {
        self.next_slot(level).store(node, Ordering::Release);
    }

    unsafe fn next_relaxed(&self, level: usize) -> *mut Node<K> {
        self.next_slot(level).load(Ordering::Relaxed)
    }

    unsafe fn set_next_relaxed(&self, level: usize, node: *mut Node<K>) {
        self.next_slot(level).store(node, Ordering::Relaxed);
    }
}

/// Probabilistic ordered container: O(log n) seeks, single-writer
/// inserts, wait-free concurrent reads. Owns the arena its nodes live in.
pub struct SkipList<K, C> {
    comparator: C,
    arena: Arena,
    head: *mut Node<K>,
    max_height: AtomicUsize,
    height_cap: usize,
    branching: u32,
}

unsafe impl<K: Send, C: Send> Send for SkipList<K, C> {}
unsafe impl<K: Send + Sync, C: Sync> Sync for SkipList<K, C> {}

impl<K, C: Comparator<K>> SkipList<K, C> {
    /// Creates an empty list. `height_cap` is clamped to
    /// [`MAX_HEIGHT`]; `branching` is the inverse promotion probability.
    pub fn new(comparator: C, height_cap: usize, branching: u32) -> Self {
        let height_cap = height_cap.clamp(1, MAX_HEIGHT);
        let branching = branching.max(2);
        let arena = Arena::new();

        // The head carries no key; its slot stays uninitialized and is
        // never read or dropped.
        let head = unsafe { Self::raw_node(&arena, height_cap) };
        for level in 0..height_cap {
            unsafe { (*head).set_next_relaxed(level, ptr::null_mut()) };
        }

        Self {
            comparator,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            height_cap,
            branching,
        }
    }

    /// Inserts `key`. The key must not already be present.
    ///
    /// Caller contract: no concurrent `insert` calls. Readers may run
    /// concurrently.
    pub fn insert(&self, key: K) {
        let mut prev = [ptr::null_mut(); MAX_HEIGHT];
        let node = self.find_greater_or_equal(&key, Some(&mut prev));
        debug_assert!(
            node.is_null()
                || self.comparator.compare(unsafe { (*node).key() }, &key) != CmpOrdering::Equal,
            "duplicate skip list key"
        );

        let height = self.random_height();
        let max_height = self.max_height();
        if height > max_height {
            for slot in prev.iter_mut().take(height).skip(max_height) {
                *slot = self.head;
            }
            // Plain store: a racing reader that observes the new height
            // before the node links below just walks empty levels.
            self.max_height.store(height, Ordering::Relaxed);
        }

        unsafe {
            let node = self.new_node(key, height);
            for (level, &prev_node) in prev.iter().enumerate().take(height) {
                (*node).set_next_relaxed(level, (*prev_node).next_relaxed(level));
                (*prev_node).set_next(level, node);
            }
        }
    }

    /// Whether a key comparing equal to `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        let node = self.find_greater_or_equal(key, None);
        !node.is_null()
            && self.comparator.compare(unsafe { (*node).key() }, key) == CmpOrdering::Equal
    }

    pub fn iter(&self) -> SkipListIter<'_, K, C> {
        SkipListIter {
            list: self,
            node: ptr::null_mut(),
        }
    }

    /// Bytes reserved for nodes, reported by the owning arena.
    pub fn memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    fn max_height(&self) -> usize {
        self.max_height.load(Ordering::Relaxed)
    }

    fn random_height(&self) -> usize {
        let mut rng = rand::thread_rng();
        let mut height = 1;
        while height < self.height_cap && rng.gen_range(0..self.branching) == 0 {
            height += 1;
        }
        height
    }

    fn key_is_after_node(&self, key: &K, node: *mut Node<K>) -> bool {
        !node.is_null()
            && self.comparator.compare(unsafe { (*node).key() }, key) == CmpOrdering::Less
    }

    /// First node with key >= `key`, or null. Fills `prev` with the
    /// per-level predecessors when provided.
    fn find_greater_or_equal(
        &self,
        key: &K,
        mut prev: Option<&mut [*mut Node<K>; MAX_HEIGHT]>,
    ) -> *mut Node<K> {
        let mut node = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if self.key_is_after_node(key, next) {
                node = next;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = node;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Last node with key < `key`, or the head when none exists.
    fn find_less_than(&self, key: &K) -> *mut Node<K> {
        let mut node = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if next.is_null()
                || self.comparator.compare(unsafe { (*next).key() }, key) != CmpOrdering::Less
            {
                if level == 0 {
                    return node;
                }
                level -= 1;
            } else {
                node = next;
            }
        }
    }

    /// Last node in the list, or the head when empty.
    fn find_last(&self) -> *mut Node<K> {
        let mut node = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*node).next(level) };
            if next.is_null() {
                if level == 0 {
                    return node;
                }
                level -= 1;
            } else {
                node = next;
            }
        }
    }

    unsafe fn new_node(&self, key: K, height: usize) -> *mut Node<K> {
        let node = Self::raw_node(&self.arena, height);
        (*node).key.write(key);
        for level in 0..height {
            (*node).set_next_relaxed(level, ptr::null_mut());
        }
        node
    }

    unsafe fn raw_node(arena: &Arena, height: usize) -> *mut Node<K> {
        let size = std::mem::size_of::<Node<K>>()
            + (height - 1) * std::mem::size_of::<AtomicPtr<Node<K>>>();
        arena.alloc_aligned(size, std::mem::align_of::<Node<K>>()) as *mut Node<K>
    }
}

impl<K, C> Drop for SkipList<K, C> {
    fn drop(&mut self) {
        // Level 0 links every node; drop each key in place. The node
        // memory itself belongs to the arena.
        unsafe {
            let mut node = (*self.head).next_relaxed(0);
            while !node.is_null() {
                let next = (*node).next_relaxed(0);
                ptr::drop_in_place((*node).key.as_mut_ptr());
                node = next;
            }
        }
    }
}

/// Restartable cursor over a skip list. Safe to use concurrently with the
/// single writer; entries inserted after a seek may or may not be
/// observed.
pub struct SkipListIter<'a, K, C> {
    list: &'a SkipList<K, C>,
    node: *mut Node<K>,
}

impl<'a, K, C: Comparator<K>> SkipListIter<'a, K, C> {
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Key at the current position. Panics when invalid.
    pub fn key(&self) -> &'a K {
        assert!(self.valid());
        unsafe { (*self.node).key() }
    }

    pub fn next(&mut self) {
        assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    pub fn prev(&mut self) {
        assert!(self.valid());
        let node = self.list.find_less_than(unsafe { (*self.node).key() });
        self.node = if node == self.list.head {
            ptr::null_mut()
        } else {
            node
        };
    }

    /// Positions at the first entry with key >= `target`.
    pub fn seek(&mut self, target: &K) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    pub fn seek_to_last(&mut self) {
        let node = self.list.find_last();
        self.node = if node == self.list.head {
            ptr::null_mut()
        } else {
            node
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    struct U64Comparator;

    impl Comparator<u64> for U64Comparator {
        fn compare(&self, a: &u64, b: &u64) -> CmpOrdering {
            a.cmp(b)
        }
    }

    fn create_list() -> SkipList<u64, U64Comparator> {
        SkipList::new(U64Comparator, MAX_HEIGHT, 4)
    }

    #[test]
    fn test_insert_and_contains() {
        let list = create_list();
        for key in [7u64, 3, 11, 1, 9] {
            list.insert(key);
        }
        for key in [1u64, 3, 7, 9, 11] {
            assert!(list.contains(&key));
        }
        assert!(!list.contains(&2));
        assert!(!list.contains(&100));
    }

    #[test]
    fn test_iteration_is_sorted() {
        let list = create_list();
        let mut keys: Vec<u64> = (0..500).map(|i| (i * 7919) % 1000).collect();
        keys.sort_unstable();
        keys.dedup();
        // Insert in scrambled order.
        for &key in keys.iter().rev() {
            list.insert(key);
        }

        let mut iter = list.iter();
        iter.seek_to_first();
        let mut observed = Vec::new();
        while iter.valid() {
            observed.push(*iter.key());
            iter.next();
        }
        assert_eq!(observed, keys);
    }

    #[test]
    fn test_seek() {
        let list = create_list();
        for key in [10u64, 20, 30, 40] {
            list.insert(key);
        }

        let mut iter = list.iter();
        iter.seek(&20);
        assert!(iter.valid());
        assert_eq!(*iter.key(), 20);

        iter.seek(&25);
        assert!(iter.valid());
        assert_eq!(*iter.key(), 30);

        iter.seek(&41);
        assert!(!iter.valid());
    }

    #[test]
    fn test_prev_and_seek_to_last() {
        let list = create_list();
        for key in [1u64, 2, 3] {
            list.insert(key);
        }

        let mut iter = list.iter();
        iter.seek_to_last();
        assert_eq!(*iter.key(), 3);
        iter.prev();
        assert_eq!(*iter.key(), 2);
        iter.prev();
        assert_eq!(*iter.key(), 1);
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_empty_list() {
        let list = create_list();
        let mut iter = list.iter();
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        assert!(!list.contains(&1));
    }

    #[test]
    fn test_memory_usage_grows() {
        let list = create_list();
        let before = list.memory_usage();
        for key in 0..100u64 {
            list.insert(key);
        }
        assert!(list.memory_usage() > before);
    }

    #[test]
    fn test_concurrent_readers_with_single_writer() {
        let list = Arc::new(create_list());
        let done = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let list = Arc::clone(&list);
            let done = Arc::clone(&done);
            readers.push(std::thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let mut iter = list.iter();
                    iter.seek_to_first();
                    let mut last: Option<u64> = None;
                    while iter.valid() {
                        let key = *iter.key();
                        if let Some(prev) = last {
                            assert!(prev < key, "out-of-order read: {prev} then {key}");
                        }
                        last = Some(key);
                        iter.next();
                    }
                }
            }));
        }

        // Single writer.
        for key in 0..2000u64 {
            list.insert(key);
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().expect("reader panicked");
        }
        assert!(list.contains(&1999));
    }
}
