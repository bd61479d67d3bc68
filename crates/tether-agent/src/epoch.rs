//! Epoch-based safe memory reclamation
//!
//! Hook codelet lists and hashmap nodes are read on the dispatch fast
//! path without locks, so freeing a replaced structure has to wait
//! until every registered thread has left its read-side section. Each
//! registered thread owns one record; readers bracket hook dispatch
//! with `begin`/`end`, writers either `synchronize` before freeing
//! inline or `defer` the release and let the maintenance task `poll`
//! it out once the grace period has passed.
//!
//! The scheme is the classic three-epoch design: an object retired at
//! global epoch E may be released once the global epoch has reached
//! E + 2, because every reader active at retirement pins epoch E (or
//! earlier) and blocks both advances.

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Grace distance between retirement and release.
const GRACE_EPOCHS: usize = 2;

/// The process-wide reclamation domain shared by hooks and maps.
pub fn domain() -> &'static EpochDomain {
    &crate::runtime::global().epoch
}

type DeferredFn = Box<dyn FnOnce() + Send>;

struct Deferred {
    epoch: usize,
    release: DeferredFn,
}

/// Per-thread epoch record.
///
/// `state` packs the thread's local epoch in the upper bits with an
/// active flag in bit 0.
pub struct EpochRecord {
    state: AtomicUsize,
    deferred: Mutex<Vec<Deferred>>,
}

impl EpochRecord {
    fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            deferred: Mutex::new(Vec::new()),
        }
    }
}

/// A reclamation domain with a fixed set of per-thread records.
pub struct EpochDomain {
    global: CachePadded<AtomicUsize>,
    records: Box<[CachePadded<EpochRecord>]>,
}

impl EpochDomain {
    /// Create a domain with `num_records` thread slots.
    pub fn new(num_records: usize) -> Self {
        let records = (0..num_records)
            .map(|_| CachePadded::new(EpochRecord::new()))
            .collect();
        Self {
            global: CachePadded::new(AtomicUsize::new(GRACE_EPOCHS)),
            records,
        }
    }

    /// Enter a read-side critical section on record `idx`.
    ///
    /// Pointers loaded between `begin` and `end` stay valid until the
    /// matching `end`, regardless of concurrent unlinks.
    #[inline]
    pub fn begin(&self, idx: usize) {
        let rec = &self.records[idx];
        let epoch = self.global.load(Ordering::Relaxed);
        rec.state.store((epoch << 1) | 1, Ordering::Relaxed);
        // Publish the active flag before any protected load.
        fence(Ordering::SeqCst);
    }

    /// Leave the read-side critical section on record `idx`.
    #[inline]
    pub fn end(&self, idx: usize) {
        let rec = &self.records[idx];
        let state = rec.state.load(Ordering::Relaxed);
        rec.state.store(state & !1, Ordering::Release);
    }

    /// Queue `release` to run once the grace period for the current
    /// epoch has elapsed. The closure runs on whichever thread later
    /// polls or barriers this record.
    pub fn defer(&self, idx: usize, release: DeferredFn) {
        let epoch = self.global.load(Ordering::SeqCst);
        self.records[idx].deferred.lock().push(Deferred { epoch, release });
    }

    /// Try to advance the global epoch once. Fails while any active
    /// record still pins an older epoch.
    fn try_advance(&self) -> bool {
        let epoch = self.global.load(Ordering::SeqCst);
        for rec in self.records.iter() {
            let state = rec.state.load(Ordering::SeqCst);
            if state & 1 == 1 && state >> 1 != epoch {
                return false;
            }
        }
        self.global
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Wait until every thread registered with the domain has passed
    /// through a quiescent point. On return, any pointer unlinked
    /// before the call is unreachable from all read-side sections.
    ///
    /// The calling thread must not be inside a read-side section.
    pub fn synchronize(&self) {
        let target = self.global.load(Ordering::SeqCst) + GRACE_EPOCHS;
        while self.global.load(Ordering::SeqCst) < target {
            if !self.try_advance() {
                std::thread::yield_now();
            }
        }
    }

    /// Run deferred releases on record `idx` whose grace period has
    /// elapsed. Called on the maintenance cadence.
    pub fn poll(&self, idx: usize) {
        // Nudge the epoch forward so an idle system still makes
        // reclamation progress.
        self.try_advance();
        let epoch = self.global.load(Ordering::SeqCst);
        let ready = {
            let mut queue = self.records[idx].deferred.lock();
            let mut ready = Vec::new();
            queue.retain_mut(|entry| {
                if entry.epoch + GRACE_EPOCHS <= epoch {
                    ready.push(std::mem::replace(
                        &mut entry.release,
                        Box::new(|| {}),
                    ));
                    false
                } else {
                    true
                }
            });
            ready
        };
        for release in ready {
            release();
        }
    }

    /// Synchronize, then drain every record's deferred queue.
    pub fn barrier(&self) {
        self.synchronize();
        for idx in 0..self.records.len() {
            self.poll(idx);
        }
    }

    /// Number of deferred entries currently queued across all records.
    pub fn pending(&self) -> usize {
        self.records
            .iter()
            .map(|rec| rec.deferred.lock().len())
            .sum()
    }

    /// Number of records in the domain.
    pub fn num_records(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_defer_runs_after_barrier() {
        let domain = EpochDomain::new(4);
        let freed = Arc::new(AtomicBool::new(false));
        let f = freed.clone();
        domain.defer(0, Box::new(move || f.store(true, Ordering::SeqCst)));
        assert!(!freed.load(Ordering::SeqCst));
        domain.barrier();
        assert!(freed.load(Ordering::SeqCst));
        assert_eq!(domain.pending(), 0);
    }

    #[test]
    fn test_poll_respects_grace_period() {
        let domain = EpochDomain::new(2);
        let freed = Arc::new(AtomicBool::new(false));
        let f = freed.clone();
        domain.defer(0, Box::new(move || f.store(true, Ordering::SeqCst)));
        // A single poll advances at most one epoch; the entry needs two.
        domain.poll(0);
        assert!(!freed.load(Ordering::SeqCst));
        domain.poll(0);
        domain.poll(0);
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_active_reader_blocks_synchronize() {
        let domain = Arc::new(EpochDomain::new(2));
        domain.begin(1);

        let d = domain.clone();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let waiter = std::thread::spawn(move || {
            d.synchronize();
            done2.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!done.load(Ordering::SeqCst), "synchronize returned early");

        domain.end(1);
        waiter.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reader_sees_object_until_section_ends() {
        // A reader inside a section must observe its loaded pointer as
        // live even after the writer unlinks it; the deferred free only
        // runs after the section closes.
        let domain = Arc::new(EpochDomain::new(2));
        let freed = Arc::new(AtomicBool::new(false));

        domain.begin(0);
        let f = freed.clone();
        domain.defer(1, Box::new(move || f.store(true, Ordering::SeqCst)));

        let d = domain.clone();
        let reclaimer = std::thread::spawn(move || d.barrier());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(!freed.load(Ordering::SeqCst));

        domain.end(0);
        reclaimer.join().unwrap();
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_repeated_sections_make_progress() {
        let domain = EpochDomain::new(1);
        for _ in 0..100 {
            domain.begin(0);
            domain.end(0);
        }
        domain.barrier();
        assert_eq!(domain.pending(), 0);
    }
}
