//! Thread registration
//!
//! Every host thread that enters a hook needs a dense small-integer id:
//! it indexes the thread's epoch record, its per-thread map slots and
//! its perf histogram slot. Ids come from a lock-free bitmap;
//! thread-local state carries the id plus the per-thread RNG and the
//! runtime-threshold cells consulted by helpers.

use crate::config::MAX_REG_THREADS;
use crate::runtime;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU32, Ordering};

const BITS_PER_WORD: usize = u32::BITS as usize;

/// Lock-free bitmap of allocated ids.
pub struct Bitmap {
    words: Box<[AtomicU32]>,
    size: usize,
}

impl Bitmap {
    /// Bitmap tracking `size` ids, all initially free.
    pub fn new(size: usize) -> Self {
        let words = (0..size.div_ceil(BITS_PER_WORD))
            .map(|_| AtomicU32::new(0))
            .collect();
        Self { words, size }
    }

    /// Claim the lowest free bit, or `None` when all are taken.
    pub fn allocate(&self) -> Option<usize> {
        for bit in 0..self.size {
            let word = &self.words[bit / BITS_PER_WORD];
            let mask = 1u32 << (bit % BITS_PER_WORD);
            let mut old = word.load(Ordering::Relaxed);
            while old & mask == 0 {
                match word.compare_exchange_weak(
                    old,
                    old | mask,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(bit),
                    Err(current) => old = current,
                }
            }
        }
        None
    }

    /// Release a previously claimed bit.
    pub fn free(&self, bit: usize) {
        if bit >= self.size {
            return;
        }
        let mask = 1u32 << (bit % BITS_PER_WORD);
        self.words[bit / BITS_PER_WORD].fetch_and(!mask, Ordering::AcqRel);
    }

    /// Whether a bit is currently claimed.
    pub fn is_set(&self, bit: usize) -> bool {
        if bit >= self.size {
            return false;
        }
        let mask = 1u32 << (bit % BITS_PER_WORD);
        self.words[bit / BITS_PER_WORD].load(Ordering::Acquire) & mask != 0
    }

    /// Number of claimed bits.
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}

struct ThreadState {
    id: Cell<i32>,
    rng: RefCell<Option<SmallRng>>,
    runtime_threshold: Cell<u64>,
    runtime_mark: Cell<u64>,
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        // Thread exit releases the id even without an explicit cleanup.
        let id = self.id.get();
        if id >= 0 {
            runtime::global().threads.free(id as usize);
        }
    }
}

thread_local! {
    static TLS: ThreadState = ThreadState {
        id: Cell::new(-1),
        rng: RefCell::new(None),
        runtime_threshold: Cell::new(0),
        runtime_mark: Cell::new(0),
    };
}

/// Register the calling thread for hook dispatch.
///
/// Idempotent; returns the thread's dense id, or `None` when all
/// [`MAX_REG_THREADS`] slots are taken. A thread that fails to register
/// must not dispatch.
pub fn register_thread() -> Option<usize> {
    TLS.with(|tls| {
        let id = tls.id.get();
        if id >= 0 {
            return Some(id as usize);
        }
        match runtime::global().threads.allocate() {
            Some(id) => {
                tls.id.set(id as i32);
                *tls.rng.borrow_mut() = Some(SmallRng::from_entropy());
                Some(id)
            }
            None => {
                log::error!(
                    "thread could not be registered, all {MAX_REG_THREADS} slots are in use"
                );
                None
            }
        }
    })
}

/// Id of the calling thread, if registered.
pub fn current_thread_id() -> Option<usize> {
    TLS.with(|tls| {
        let id = tls.id.get();
        (id >= 0).then_some(id as usize)
    })
}

/// Release the calling thread's id. Idempotent.
pub fn cleanup_thread() {
    TLS.with(|tls| {
        let id = tls.id.get();
        if id >= 0 {
            runtime::global().threads.free(id as usize);
            tls.id.set(-1);
            *tls.rng.borrow_mut() = None;
        }
    });
}

/// Stamp the runtime threshold of the codelet about to run.
#[inline]
pub fn set_runtime_threshold(ns: u64) {
    TLS.with(|tls| tls.runtime_threshold.set(ns));
}

/// Threshold stamped by the dispatcher for the running codelet.
#[inline]
pub fn runtime_threshold() -> u64 {
    TLS.with(|tls| tls.runtime_threshold.get())
}

/// Record the codelet's own start-of-run timestamp.
#[inline]
pub fn set_runtime_mark(ticks: u64) {
    TLS.with(|tls| tls.runtime_mark.set(ticks));
}

/// Timestamp stored by `mark_runtime_init`.
#[inline]
pub fn runtime_mark() -> u64 {
    TLS.with(|tls| tls.runtime_mark.get())
}

/// Draw from the per-thread RNG. Registers the thread's RNG lazily so
/// the helper works even before the first dispatch.
pub fn rand_u32() -> u32 {
    TLS.with(|tls| {
        let mut rng = tls.rng.borrow_mut();
        rng.get_or_insert_with(SmallRng::from_entropy).gen()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_allocates_lowest_free() {
        let bitmap = Bitmap::new(64);
        assert_eq!(bitmap.allocate(), Some(0));
        assert_eq!(bitmap.allocate(), Some(1));
        bitmap.free(0);
        assert_eq!(bitmap.allocate(), Some(0));
        assert_eq!(bitmap.count(), 2);
    }

    #[test]
    fn test_bitmap_exhaustion() {
        let bitmap = Bitmap::new(3);
        for i in 0..3 {
            assert_eq!(bitmap.allocate(), Some(i));
        }
        assert_eq!(bitmap.allocate(), None);
        bitmap.free(1);
        assert_eq!(bitmap.allocate(), Some(1));
    }

    #[test]
    fn test_bitmap_concurrent_allocation_is_unique() {
        let bitmap = std::sync::Arc::new(Bitmap::new(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let b = bitmap.clone();
            handles.push(std::thread::spawn(move || {
                (0..8).filter_map(|_| b.allocate()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let len = all.len();
        all.dedup();
        assert_eq!(all.len(), len, "duplicate id handed out");
        assert_eq!(len, 64);
    }

    #[test]
    fn test_register_is_idempotent() {
        let first = register_thread().unwrap();
        let second = register_thread().unwrap();
        assert_eq!(first, second);
        assert_eq!(current_thread_id(), Some(first));
    }

    #[test]
    fn test_runtime_threshold_cells() {
        set_runtime_threshold(5_000);
        assert_eq!(runtime_threshold(), 5_000);
        set_runtime_mark(77);
        assert_eq!(runtime_mark(), 77);
    }

    #[test]
    fn test_rand_works_without_registration() {
        // Draws must not require an id; two draws rarely collide.
        let a = rand_u32();
        let b = rand_u32();
        let c = rand_u32();
        assert!(a != b || b != c);
    }
}
