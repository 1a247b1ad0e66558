use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

// ── Public API types ──────────────────────────────────────────────────

/// Function that computes the byte size of a heap object.
///
/// Given a pointer to a heap object (whose first bytes are an
/// [`object::Header`]), returns the object's total allocation size in
/// bytes, *not* rounded to alignment.
///
/// # Safety
///
/// `obj` must point to a valid heap object with a valid
/// [`object::Header`].
pub type SizeFn = unsafe fn(obj: *const u8) -> usize;

/// Alignment of every allocation handed out by a [`Space`]. Reference
/// tagging needs the low bits of addresses free.
pub const OBJECT_ALIGNMENT: usize = 8;

#[inline]
pub const fn align_object_size(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

// ── Space ─────────────────────────────────────────────────────────────

/// A fixed-capacity bump-allocated region of heap objects.
///
/// This is deliberately the smallest allocator a persistence pipeline can
/// be written against: raw allocation, address containment queries, and a
/// linear walk over everything allocated so far. There is no collector;
/// a `Space` lives exactly as long as the program it backs.
pub struct Space {
    start: NonNull<u8>,
    capacity: usize,
    top: Mutex<usize>,
    // mirror of `top` readable without taking the lock
    used: AtomicUsize,
}

// SAFETY: the bump pointer is guarded by the mutex; the region itself is
// plain memory.
unsafe impl Send for Space {}
// SAFETY: see above
unsafe impl Sync for Space {}

impl Space {
    /// Reserve a zeroed region of `capacity` bytes (rounded up to object
    /// alignment).
    pub fn new(capacity: usize) -> Self {
        let capacity = align_object_size(capacity.max(OBJECT_ALIGNMENT));
        let layout = Layout::from_size_align(capacity, OBJECT_ALIGNMENT)
            .expect("space layout");
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let start = NonNull::new(ptr)
            .unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self {
            start,
            capacity,
            top: Mutex::new(0),
            used: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.start
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes allocated so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Is `addr` inside the allocated portion of this space?
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        let base = self.start.as_ptr() as u64;
        addr >= base && addr < base + self.used() as u64
    }

    /// Bump-allocate `layout.size()` bytes, rounded up to object
    /// alignment. Panics when the space is exhausted — the VM is out of
    /// memory and there is no collector to appeal to.
    pub fn allocate(&self, layout: Layout) -> NonNull<u8> {
        assert!(
            layout.align() <= OBJECT_ALIGNMENT,
            "over-aligned allocation: {}",
            layout.align()
        );
        let size = align_object_size(layout.size().max(OBJECT_ALIGNMENT));

        let mut top = self.top.lock();
        if *top + size > self.capacity {
            panic!(
                "space out of memory: {} bytes requested, {} of {} used",
                size, *top, self.capacity
            );
        }
        let offset = *top;
        *top += size;
        self.used.store(*top, Ordering::Release);

        // SAFETY: offset stays within the reserved region
        unsafe { NonNull::new_unchecked(self.start.as_ptr().add(offset)) }
    }

    /// Walk every object allocated in this space in address order.
    ///
    /// # Safety
    ///
    /// Every allocation must have been initialized as a heap object whose
    /// size `size_fn` can compute, and `f` must not allocate into this
    /// space.
    pub unsafe fn walk(&self, size_fn: SizeFn, mut f: impl FnMut(*mut u8)) {
        let base = self.start.as_ptr();
        let used = self.used();
        let mut offset = 0;
        while offset < used {
            // SAFETY: offset < used, inside the region
            let obj = unsafe { base.add(offset) };
            f(obj);
            // SAFETY: obj is an initialized object by contract
            let size = unsafe { size_fn(obj) };
            assert!(size > 0, "object with zero size at offset {offset}");
            offset += align_object_size(size);
        }
        assert_eq!(offset, used, "object walk overran the allocated region");
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(self.capacity, OBJECT_ALIGNMENT)
                .expect("space layout");
        // SAFETY: allocated in `new` with the same layout
        unsafe { alloc::dealloc(self.start.as_ptr(), layout) };
    }
}

impl core::fmt::Debug for Space {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Space")
            .field("base", &self.start)
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}
