use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// A portable logical pointer: `{ status (mark-for-death + 31-bit ABA
/// counter), 8-bit generation, 8-bit segment, 16-bit offset }` packed into a
/// single `u64` word so it can be CAS'd atomically (spec §3 "GC Pointer",
/// grounded on `w_gc_pool_forest.h`'s `gc_pointer_raw`).
///
/// A zero generation means null.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcPointer<T> {
    word: u64,
    _marker: PhantomData<fn() -> T>,
}

const MARK_BIT: u32 = 0x8000_0000;
const ABA_MASK: u32 = 0x7FFF_FFFF;

impl<T> std::fmt::Debug for GcPointer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcPointer")
            .field("generation", &self.generation())
            .field("segment", &self.segment())
            .field("offset", &self.offset())
            .field("marked", &self.is_marked())
            .field("aba", &self.aba())
            .finish()
    }
}

impl<T> GcPointer<T> {
    const fn from_word(word: u64) -> Self {
        GcPointer {
            word,
            _marker: PhantomData,
        }
    }

    pub fn null() -> Self {
        GcPointer::from_word(0)
    }

    pub fn new(generation: u8, segment: u8, offset: u16) -> Self {
        Self::with_status(generation, segment, offset, 0, false)
    }

    fn with_status(generation: u8, segment: u8, offset: u16, aba: u32, marked: bool) -> Self {
        let status: u32 = (aba & ABA_MASK) | if marked { MARK_BIT } else { 0 };
        let word = (status as u64)
            | ((generation as u64) << 32)
            | ((segment as u64) << 40)
            | ((offset as u64) << 48);
        GcPointer::from_word(word)
    }

    pub fn is_null(self) -> bool {
        self.generation() == 0
    }

    pub fn generation(self) -> u8 {
        ((self.word >> 32) & 0xFF) as u8
    }

    pub fn segment(self) -> u8 {
        ((self.word >> 40) & 0xFF) as u8
    }

    pub fn offset(self) -> u16 {
        ((self.word >> 48) & 0xFFFF) as u16
    }

    fn status(self) -> u32 {
        (self.word & 0xFFFF_FFFF) as u32
    }

    pub fn is_marked(self) -> bool {
        self.status() & MARK_BIT != 0
    }

    pub fn aba(self) -> u32 {
        self.status() & ABA_MASK
    }

    pub fn with_mark(self, on: bool) -> Self {
        Self::with_status(self.generation(), self.segment(), self.offset(), self.aba(), on)
    }

    pub fn with_aba(self, aba: u32) -> Self {
        Self::with_status(self.generation(), self.segment(), self.offset(), aba, self.is_marked())
    }

    /// Compares only the address part (generation/segment/offset), ignoring
    /// the mark and ABA counter.
    pub fn is_equal_address(self, other: Self) -> bool {
        self.generation() == other.generation()
            && self.segment() == other.segment()
            && self.offset() == other.offset()
    }

    pub fn raw(self) -> u64 {
        self.word
    }
}

/// An atomic cell holding a [`GcPointer<T>`], supporting the CAS/swap
/// operations the lock-free list (C2) needs.
pub struct AtomicGcPointer<T> {
    inner: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AtomicGcPointer<T> {
    pub fn new(value: GcPointer<T>) -> Self {
        AtomicGcPointer {
            inner: AtomicU64::new(value.word),
            _marker: PhantomData,
        }
    }

    pub fn load(&self, order: Ordering) -> GcPointer<T> {
        GcPointer::from_word(self.inner.load(order))
    }

    pub fn store(&self, value: GcPointer<T>, order: Ordering) {
        self.inner.store(value.word, order);
    }

    pub fn compare_exchange(
        &self,
        current: GcPointer<T>,
        new: GcPointer<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<GcPointer<T>, GcPointer<T>> {
        self.inner
            .compare_exchange(current.word, new.word, success, failure)
            .map(GcPointer::from_word)
            .map_err(GcPointer::from_word)
    }

    pub fn swap(&self, value: GcPointer<T>, order: Ordering) -> GcPointer<T> {
        GcPointer::from_word(self.inner.swap(value.word, order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let p: GcPointer<u32> = GcPointer::new(3, 7, 1200);
        assert_eq!(p.generation(), 3);
        assert_eq!(p.segment(), 7);
        assert_eq!(p.offset(), 1200);
        assert!(!p.is_marked());
        assert_eq!(p.aba(), 0);
    }

    #[test]
    fn mark_and_aba_are_independent_of_address() {
        let p: GcPointer<u32> = GcPointer::new(3, 7, 1200);
        let marked = p.with_mark(true).with_aba(42);
        assert!(marked.is_marked());
        assert_eq!(marked.aba(), 42);
        assert!(marked.is_equal_address(p));
    }

    #[test]
    fn zero_generation_is_null() {
        assert!(GcPointer::<u32>::null().is_null());
        assert!(!GcPointer::<u32>::new(1, 0, 0).is_null());
    }
}
