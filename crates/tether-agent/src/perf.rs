//! Per-hook latency measurement
//!
//! Every hook owns a slab of per-thread histogram slots updated
//! without locks on the dispatch path. On the maintenance cadence the
//! slab is swapped for a fresh one, an epoch barrier freezes the old
//! snapshot, and the per-thread slots are reduced into one report per
//! hook which is handed to codelets on the built-in `report_stats`
//! hook.

use crate::config::MAX_REG_THREADS;
use crate::epoch;
use crate::hook::{Hook, HookType};
use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;

/// Number of histogram bins; bin `k` counts latencies with
/// `floor(log2(ns)) == k`, the last bin absorbs overflow.
pub const NUM_HIST_BINS: usize = 64;

/// Name of the built-in hook receiving perf reports.
pub const REPORT_STATS_HOOK_NAME: &str = "report_stats";

/// The `report_stats` agent hook. Codelets attached here receive a
/// [`StatsReport`] context on every aggregation pass.
pub static REPORT_STATS: Hook = Hook::new(REPORT_STATS_HOOK_NAME, HookType::Monitoring);

/// One thread's latency accumulator.
#[derive(Clone, Copy)]
pub struct PerfData {
    /// Number of recorded dispatches.
    pub num: u64,
    /// Minimum latency in nanoseconds (0 until the first record).
    pub min: u64,
    /// Maximum latency in nanoseconds.
    pub max: u64,
    /// log2 histogram of latencies.
    pub hist: [u32; NUM_HIST_BINS],
}

impl Default for PerfData {
    fn default() -> Self {
        Self {
            num: 0,
            min: 0,
            max: 0,
            hist: [0; NUM_HIST_BINS],
        }
    }
}

/// Per-thread slots of one hook's measurement window.
pub struct PerfSlab {
    slots: Box<[CachePadded<UnsafeCell<PerfData>>]>,
}

// Each slot is written only by the thread owning that id; the slab
// pointer itself is swapped atomically by the aggregator.
unsafe impl Send for PerfSlab {}
unsafe impl Sync for PerfSlab {}

impl PerfSlab {
    /// Allocate a zeroed slab.
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_REG_THREADS)
                .map(|_| CachePadded::new(UnsafeCell::new(PerfData::default())))
                .collect(),
        }
    }

    /// Histogram bin for a latency.
    #[inline]
    pub fn bin_index(elapsed_ns: u64) -> usize {
        (elapsed_ns.max(1).ilog2() as usize).min(NUM_HIST_BINS - 1)
    }

    /// Record one dispatch latency into the calling thread's slot.
    ///
    /// Lock-free: `thread_id` is the caller's dense id, so the slot is
    /// exclusively ours.
    #[inline]
    pub fn record(&self, thread_id: usize, elapsed_ns: u64) {
        let Some(slot) = self.slots.get(thread_id) else {
            return;
        };
        let data = unsafe { &mut *slot.get() };
        data.num += 1;
        if elapsed_ns < data.min || data.min == 0 {
            data.min = elapsed_ns;
        }
        if elapsed_ns > data.max {
            data.max = elapsed_ns;
        }
        data.hist[Self::bin_index(elapsed_ns)] += 1;
    }

    /// Reduce all thread slots into one accumulator.
    pub fn reduce(&self) -> PerfData {
        let mut total = PerfData::default();
        for slot in self.slots.iter() {
            let data = unsafe { &*slot.get() };
            if total.min == 0 || (data.min > 0 && data.min < total.min) {
                total.min = data.min;
            }
            if data.max > total.max {
                total.max = data.max;
            }
            total.num += data.num;
            for (acc, value) in total.hist.iter_mut().zip(data.hist.iter()) {
                *acc += value;
            }
        }
        total
    }
}

impl Default for PerfSlab {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregated measurements of one hook over one window.
#[derive(Clone)]
pub struct PerfReport {
    /// Hook the measurements belong to.
    pub hook_name: String,
    /// Reduced accumulator across all threads.
    pub data: PerfData,
}

/// Context passed to `report_stats` codelets.
pub struct StatsReport {
    /// Measurement period in microseconds.
    pub period_us: u64,
    /// One report per hook that saw dispatches.
    pub reports: Vec<PerfReport>,
}

/// Swap every hook's slab, freeze the snapshots behind an epoch
/// barrier and fire `report_stats` with the reduced reports.
///
/// The stats hook itself is excluded, a codelet measuring the reporter
/// would feed back into its own report.
pub fn report_perf_stats(hooks: &[&'static Hook], period_us: u64) {
    let mut snapshots = Vec::new();
    for hook in hooks {
        if hook.name() == REPORT_STATS_HOOK_NAME {
            continue;
        }
        if let Some(slab) = hook.rotate_perf() {
            snapshots.push((hook.name().to_string(), slab));
        }
    }
    if snapshots.is_empty() {
        return;
    }

    // In-flight dispatches may still hold the old slabs.
    epoch::domain().barrier();

    let reports = snapshots
        .into_iter()
        .map(|(hook_name, slab)| PerfReport {
            hook_name,
            data: slab.reduce(),
        })
        .collect();

    let mut ctx = StatsReport { period_us, reports };
    REPORT_STATS.dispatch(&mut ctx);
}
