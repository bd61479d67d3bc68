//! Time sources for dispatch measurement and codelet helpers
//!
//! Two clocks exist. `wall_clock_ns` is realtime and only feeds the
//! `time_get_ns` helper. The measurement clock behind
//! `start_time`/`stop_time` is monotonic: by default it is a raw
//! monotonic nanosecond reading; with the `perf-opt` feature on x86_64
//! it switches to serialized cycle-counter reads calibrated once at
//! agent init. `diff_ns` treats `end < start` as counter wrap-around,
//! never as a negative interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

static MONOTONIC_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Calibrated ticks-per-nanosecond ratio, stored as f64 bits. Zero
/// means "uncalibrated", in which case ticks are taken to be
/// nanoseconds already (true for the default clock).
static TICKS_PER_NS_BITS: AtomicU64 = AtomicU64::new(0);

#[inline]
fn monotonic_ns() -> u64 {
    MONOTONIC_EPOCH.elapsed().as_nanos() as u64
}

/// Wall-clock nanoseconds since the UNIX epoch.
pub fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(all(feature = "perf-opt", target_arch = "x86_64"))]
#[inline]
fn raw_start_ticks() -> u64 {
    // Fences stop earlier work from drifting past the counter read.
    unsafe {
        std::arch::x86_64::_mm_mfence();
        std::arch::x86_64::_mm_lfence();
        std::arch::x86_64::_rdtsc()
    }
}

#[cfg(all(feature = "perf-opt", target_arch = "x86_64"))]
#[inline]
fn raw_stop_ticks() -> u64 {
    unsafe {
        let mut aux = 0u32;
        let ticks = std::arch::x86_64::__rdtscp(&mut aux);
        std::arch::x86_64::_mm_lfence();
        ticks
    }
}

#[cfg(not(all(feature = "perf-opt", target_arch = "x86_64")))]
#[inline]
fn raw_start_ticks() -> u64 {
    monotonic_ns()
}

#[cfg(not(all(feature = "perf-opt", target_arch = "x86_64")))]
#[inline]
fn raw_stop_ticks() -> u64 {
    monotonic_ns()
}

/// Read the measurement clock at the start of an interval.
#[inline]
pub fn start_time() -> u64 {
    raw_start_ticks()
}

/// Read the measurement clock at the end of an interval.
#[inline]
pub fn stop_time() -> u64 {
    raw_stop_ticks()
}

/// Calibrate the tick frequency of the measurement clock.
///
/// No-op for the default nanosecond clock. For the cycle counter this
/// samples both clocks across a short sleep and stores the ratio.
pub fn calibrate() {
    LazyLock::force(&MONOTONIC_EPOCH);
    if !cfg!(all(feature = "perf-opt", target_arch = "x86_64")) {
        return;
    }
    let wall_start = Instant::now();
    let tick_start = raw_start_ticks();
    std::thread::sleep(Duration::from_millis(50));
    let tick_end = raw_stop_ticks();
    let elapsed_ns = wall_start.elapsed().as_nanos() as u64;
    if elapsed_ns == 0 || tick_end <= tick_start {
        return;
    }
    let ratio = (tick_end - tick_start) as f64 / elapsed_ns as f64;
    TICKS_PER_NS_BITS.store(ratio.to_bits(), Ordering::Relaxed);
    log::info!("measurement clock calibrated: {ratio:.3} ticks/ns");
}

/// Convert a start/end tick pair to elapsed nanoseconds.
///
/// `end < start` means the counter wrapped; the interval is computed
/// across the wrap rather than reported negative.
pub fn diff_ns(start: u64, end: u64) -> u64 {
    let ticks = if end >= start {
        end - start
    } else {
        u64::MAX - start + end
    };
    let ratio = f64::from_bits(TICKS_PER_NS_BITS.load(Ordering::Relaxed));
    if ratio > 0.0 {
        (ticks as f64 / ratio) as u64
    } else {
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_clock_advances() {
        let start = start_time();
        std::thread::sleep(Duration::from_millis(2));
        let end = stop_time();
        let elapsed = diff_ns(start, end);
        assert!(elapsed >= 1_000_000, "elapsed {elapsed}ns");
        assert!(elapsed < 10_000_000_000, "elapsed {elapsed}ns");
    }

    #[test]
    fn test_diff_handles_wraparound() {
        let start = u64::MAX - 100;
        let end = 50;
        assert_eq!(diff_ns(start, end), 150);
    }

    #[test]
    fn test_diff_zero_interval() {
        assert_eq!(diff_ns(42, 42), 0);
    }

    #[test]
    fn test_wall_clock_is_recent() {
        // Anything after 2020-01-01 counts as a sane realtime reading.
        assert!(wall_clock_ns() > 1_577_836_800_000_000_000);
    }
}
