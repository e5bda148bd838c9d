//! Harris–Michael singly linked list (spec §4.2, C2), keyed by a
//! comparable key, with ABA protection from the GC pointer's 31-bit
//! counter. Grounded on
//! `examples/original_source/src/common/w_lockfree_list.h`.
//!
//! Entries are allocated from a [`GcPoolForest`] (C1) and returned to it on
//! `remove` — deallocation at the object level is a no-op; whole
//! generations retire later once no transaction can still observe them.

use crate::gcpool::{AtomicGcPointer, GcPoolForest, GcPointer, TlsCursor};
use std::sync::atomic::Ordering;

/// Every entry type stored in a [`LockFreeList`] must expose its key and
/// its intrusive `next` pointer, mirroring the original's convention that
/// `T` defines `key` and `next: GcPointer<T>` members.
pub trait ListEntry<K>: Default {
    fn key(&self) -> K;
    fn set_key(&self, key: K);
    fn next(&self) -> &AtomicGcPointer<Self>
    where
        Self: Sized;
}

struct Window<T> {
    predecessor: GcPointer<T>,
    current: GcPointer<T>,
}

/// A lock-free set/map keyed by `K`, used for hash-bucket chains (lock
/// queues keyed by lockid, in C5).
pub struct LockFreeList<T: ListEntry<K>, K: Copy + PartialEq + PartialOrd> {
    pool: std::sync::Arc<GcPoolForest<T>>,
    head: AtomicGcPointer<T>,
    // the sentinel head node itself lives in the pool so `next()` works
    // uniformly; its key is never looked up.
    head_ptr: GcPointer<T>,
}

impl<T: ListEntry<K>, K: Copy + PartialOrd + PartialEq> LockFreeList<T, K> {
    pub fn new(pool: std::sync::Arc<GcPoolForest<T>>, thread_id: u64) -> Self {
        let mut cursor = TlsCursor::default();
        let head_ptr = pool.allocate(&mut cursor, thread_id).expect("initial sentinel alloc");
        LockFreeList {
            pool,
            head: AtomicGcPointer::new(head_ptr),
            head_ptr,
        }
    }

    fn deref(&self, ptr: GcPointer<T>) -> Option<crate::gcpool::GenRef<T>> {
        self.pool.resolve(ptr)
    }

    /// Traverses the list, physically unlinking marked-for-death nodes it
    /// passes over, and returns the predecessor/current window for `key`.
    fn find(&self, key: K, thread_id: u64) -> Window<T> {
        'retry: loop {
            let mut pred_ptr = self.head_ptr;
            let mut pred = self.deref(pred_ptr).expect("sentinel always resolvable");
            let mut curr_ptr = pred.next().load(Ordering::Acquire);

            loop {
                if curr_ptr.is_null() {
                    return Window { predecessor: pred_ptr, current: curr_ptr };
                }
                let curr = self.deref(curr_ptr).expect("live node must resolve");
                let succ_ptr = curr.next().load(Ordering::Acquire);

                if succ_ptr.is_marked() {
                    // curr is logically deleted; help physically unlink it.
                    let unmarked_succ = succ_ptr.with_mark(false);
                    let expected = curr_ptr;
                    if pred
                        .next()
                        .compare_exchange(
                            expected,
                            unmarked_succ,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        let _ = thread_id;
                        continue 'retry;
                    }
                    curr_ptr = unmarked_succ;
                    continue;
                }

                let curr_key = curr.key();
                if curr_key >= key {
                    return Window { predecessor: pred_ptr, current: curr_ptr };
                }
                pred_ptr = curr_ptr;
                pred = curr;
                curr_ptr = succ_ptr;
            }
        }
    }

    /// Returns the entry for `key`, creating it if absent. Never returns
    /// null.
    pub fn get_or_add(
        &self,
        key: K,
        cursor: &mut TlsCursor<T>,
        thread_id: u64,
    ) -> crate::gcpool::GenRef<T> {
        loop {
            let window = self.find(key, thread_id);
            if !window.current.is_null() {
                if let Some(curr) = self.deref(window.current) {
                    if curr.key() == key {
                        return curr;
                    }
                }
            }
            let new_ptr = self
                .pool
                .allocate(cursor, thread_id)
                .expect("gc pool allocation never blocks");
            {
                let new_entry = self.deref(new_ptr).expect("just allocated");
                new_entry.set_key(key);
                new_entry.next().store(window.current, Ordering::Release);
            }
            let pred = self.deref(window.predecessor).expect("predecessor resolvable");
            if pred
                .next()
                .compare_exchange(
                    window.current,
                    new_ptr,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return self.deref(new_ptr).expect("inserted node resolvable");
            }
            // CAS failed; the allocated node is simply abandoned (object-level
            // deallocation is a no-op per spec §4.1) and we retry.
        }
    }

    pub fn get(&self, key: K, thread_id: u64) -> Option<crate::gcpool::GenRef<T>> {
        let window = self.find(key, thread_id);
        if window.current.is_null() {
            return None;
        }
        let curr = self.deref(window.current)?;
        if curr.key() == key {
            Some(curr)
        } else {
            None
        }
    }

    /// Wait-free membership test: does not help unlink marked nodes.
    pub fn contains(&self, key: K) -> bool {
        let mut curr_ptr = self
            .deref(self.head_ptr)
            .map(|h| h.next().load(Ordering::Acquire))
            .unwrap_or_else(GcPointer::null);
        while !curr_ptr.is_null() {
            if let Some(curr) = self.deref(curr_ptr) {
                if curr.key() == key {
                    return !curr.next().load(Ordering::Acquire).is_marked();
                }
                curr_ptr = curr.next().load(Ordering::Acquire).with_mark(false);
            } else {
                break;
            }
        }
        false
    }

    /// Marks `key`'s node for death and best-effort physically delinks it.
    pub fn remove(&self, key: K, thread_id: u64) -> bool {
        loop {
            let window = self.find(key, thread_id);
            if window.current.is_null() {
                return false;
            }
            let curr = match self.deref(window.current) {
                Some(c) => c,
                None => return false,
            };
            if curr.key() != key {
                return false;
            }
            let succ_old = curr.next().load(Ordering::Acquire);
            if succ_old.is_marked() {
                // someone else is already removing it concurrently.
                continue;
            }
            let succ_new = succ_old.with_mark(true).with_aba(succ_old.aba() + 1);
            if curr
                .next()
                .compare_exchange(succ_old, succ_new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // best-effort physical delink; a later traversal will clean
                // it up if this CAS loses a race.
                let _ = self.find(key, thread_id);
                return true;
            }
        }
    }

    /// Number of live (unmarked) entries. Not atomic as a whole; intended
    /// for tests/diagnostics.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut curr_ptr = self
            .deref(self.head_ptr)
            .map(|h| h.next().load(Ordering::Acquire))
            .unwrap_or_else(GcPointer::null);
        while !curr_ptr.is_null() {
            match self.deref(curr_ptr) {
                Some(curr) => {
                    let succ = curr.next().load(Ordering::Acquire);
                    if !succ.is_marked() {
                        count += 1;
                    }
                    curr_ptr = succ.with_mark(false);
                }
                None => break,
            }
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
