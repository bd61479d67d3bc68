//! Fixed-size data mempool
//!
//! Fast-path allocations (hashmap nodes, IO channel buffers) come from
//! preallocated pools so the hook dispatch path never touches the
//! system allocator. A pool is one contiguous slab of `num_elems`
//! cells plus a lock-free free list; `alloc` pops a cell or returns
//! null, it never blocks and never grows.

use crossbeam::queue::ArrayQueue;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Alignment of every pool cell.
const ELEM_ALIGN: usize = 8;

/// A fixed-capacity pool of equally sized, zero-initialized cells.
pub struct Mempool {
    base: NonNull<u8>,
    elem_size: usize,
    num_elems: usize,
    free: ArrayQueue<usize>,
}

// The slab is only handed out cell-by-cell through raw pointers; the
// free list serializes ownership of each cell.
unsafe impl Send for Mempool {}
unsafe impl Sync for Mempool {}

impl Mempool {
    /// Create a pool of `num_elems` cells of `elem_size` bytes each.
    ///
    /// Returns `None` when either dimension is zero or the slab cannot
    /// be allocated.
    pub fn new(num_elems: usize, elem_size: usize) -> Option<Self> {
        if num_elems == 0 || elem_size == 0 {
            return None;
        }
        let cell = elem_size.div_ceil(ELEM_ALIGN) * ELEM_ALIGN;
        let layout = Layout::from_size_align(cell.checked_mul(num_elems)?, ELEM_ALIGN).ok()?;
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        let free = ArrayQueue::new(num_elems);
        for i in 0..num_elems {
            free.push(i).expect("free list sized to num_elems");
        }
        Some(Self {
            base,
            elem_size: cell,
            num_elems,
            free,
        })
    }

    /// Pop one zeroed cell, or null when the pool is exhausted.
    pub fn alloc(&self) -> *mut u8 {
        match self.free.pop() {
            Some(idx) => {
                let ptr = unsafe { self.base.as_ptr().add(idx * self.elem_size) };
                unsafe { std::ptr::write_bytes(ptr, 0, self.elem_size) };
                ptr
            }
            None => std::ptr::null_mut(),
        }
    }

    /// Return a cell to the pool. Pointers that did not come from this
    /// pool are dropped on the floor.
    pub fn free(&self, ptr: *mut u8) {
        if !self.contains(ptr) {
            debug_assert!(false, "foreign pointer returned to mempool");
            return;
        }
        let offset = (ptr as usize) - (self.base.as_ptr() as usize);
        debug_assert_eq!(offset % self.elem_size, 0, "misaligned pointer");
        if self.free.push(offset / self.elem_size).is_err() {
            debug_assert!(false, "double free into mempool");
        }
    }

    /// Whether `ptr` points into this pool's slab.
    pub fn contains(&self, ptr: *mut u8) -> bool {
        let base = self.base.as_ptr() as usize;
        let p = ptr as usize;
        p >= base && p < base + self.num_elems * self.elem_size
    }

    /// Number of cells currently available.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total number of cells.
    pub fn capacity(&self) -> usize {
        self.num_elems
    }

    /// Cell size in bytes (rounded up to alignment).
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }
}

impl Drop for Mempool {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(self.elem_size * self.num_elems, ELEM_ALIGN).expect("layout");
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}
