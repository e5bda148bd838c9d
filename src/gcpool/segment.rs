use super::MAX_SEGMENTS;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A bulk-allocated array of objects owned exclusively by one thread while
/// it is being filled. No atomics are needed on the allocation path itself
/// (grounded on `w_gc_pool_forest.h`'s `GcSegment`).
pub struct Segment<T> {
    objects: Vec<T>,
    owner: AtomicU64,
    allocated_objects: AtomicU32,
}

impl<T: Default> Segment<T> {
    fn new(size: u32) -> Self {
        let mut objects = Vec::with_capacity(size as usize);
        objects.resize_with(size as usize, T::default);
        Segment {
            objects,
            owner: AtomicU64::new(0),
            allocated_objects: AtomicU32::new(0),
        }
    }

    pub fn get(&self, offset: u16) -> &T {
        &self.objects[offset as usize]
    }

    /// Assumes no live transaction still references this segment's objects.
    pub fn recycle(&mut self) {
        self.owner.store(0, Ordering::Relaxed);
        self.allocated_objects.store(0, Ordering::Relaxed);
        for obj in &mut self.objects {
            *obj = T::default();
        }
    }
}

/// A generation of segments, retired together once no active transaction
/// predates its epoch (grounded on `GcGeneration`).
pub struct Generation<T> {
    generation_nowrap: u32,
    total_segments: usize,
    segment_size: u32,
    segments: Vec<Mutex<Option<Box<Segment<T>>>>>,
    allocated_segments: AtomicU32,
    pub retire_suggested: std::sync::atomic::AtomicBool,
}

impl<T: Default> Generation<T> {
    pub fn new(generation_nowrap: u32, total_segments: usize, segment_size: u32) -> Self {
        assert!(total_segments <= MAX_SEGMENTS);
        let mut segments = Vec::with_capacity(total_segments);
        segments.resize_with(total_segments, || Mutex::new(None));
        Generation {
            generation_nowrap,
            total_segments,
            segment_size,
            segments,
            allocated_segments: AtomicU32::new(0),
            retire_suggested: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn generation_nowrap(&self) -> u32 {
        self.generation_nowrap
    }

    pub fn wrapped_id(&self) -> u8 {
        // generation 0 is reserved as the null sentinel; wrap starting at 1.
        (((self.generation_nowrap - 1) % 255) + 1) as u8
    }

    pub fn free_count(&self) -> u32 {
        self.total_segments as u32 - self.allocated_segments.load(Ordering::Acquire)
    }

    /// Atomically claims the next free segment slot for `thread_id`,
    /// lazily bulk-allocating it. Returns the segment index.
    pub fn occupy_segment(&self, thread_id: u64) -> Result<u8> {
        loop {
            let current = self.allocated_segments.load(Ordering::Acquire);
            if current as usize >= self.total_segments {
                return Err(Error::OutOfMemory(
                    "generation has no free segments".into(),
                ));
            }
            if self
                .allocated_segments
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let mut slot = self.segments[current as usize].lock();
                if slot.is_none() {
                    *slot = Some(Box::new(Segment::new(self.segment_size)));
                }
                slot.as_ref().unwrap().owner.store(thread_id, Ordering::Relaxed);
                return Ok(current as u8);
            }
        }
    }

    pub fn resolve(&self, segment: u8, offset: u16) -> &T {
        // Safety of the unsafe cell bypass: the object's owning segment is
        // never freed before the generation itself retires, and `resolve`
        // is only ever called while the caller's own epoch guarantees the
        // generation is still alive. We hand back a reference scoped to
        // `&self` instead of the mutex guard's lifetime by re-borrowing the
        // boxed segment directly.
        let guard = self.segments[segment as usize].lock();
        let seg = guard.as_ref().expect("segment resolved before allocation");
        let ptr = seg.get(offset) as *const T;
        drop(guard);
        // SAFETY: objects are bulk-allocated once per segment and never
        // moved or freed until the whole generation recycles, which cannot
        // happen while this pointer's epoch is still observable.
        unsafe { &*ptr }
    }

    pub fn recycle(&mut self, new_generation_nowrap: u32) {
        self.generation_nowrap = new_generation_nowrap;
        self.retire_suggested.store(false, Ordering::Relaxed);
        for slot in &mut self.segments {
            if let Some(seg) = slot.get_mut() {
                seg.recycle();
            }
        }
        self.allocated_segments.store(0, Ordering::Relaxed);
    }
}

