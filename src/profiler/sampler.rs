//! Per-type adaptive allocation sampling.
//!
//! Each observed class carries a [`SampleStats`] that decides, allocation by
//! allocation, whether to report. The target is a bounded event rate per type
//! (about 100 reports per second) without losing size fidelity: every report
//! carries the bytes of all allocations suppressed since the previous one, so
//! summing `representative_size` over reports recovers the type's true
//! allocated total. Allocations at or above the per-type force-keep threshold
//! always report.

/// Allocations at or above this many bytes report unconditionally unless the
/// host overrides the threshold for the type.
pub const DEFAULT_FORCE_KEEP_BYTES: u64 = 10_000;

/// Length of the rate-estimation window in milliseconds.
const BUCKET_MILLIS: u32 = 16;

/// Never suppress more than this many allocations per report.
const MAX_SAMPLING_RATE: u32 = 1000;

/// Tick deltas are computed in a 31-bit space so the source wrapping at
/// `u32::MAX` still yields small positive differences.
const TICK_WRAP_MASK: u32 = 0x7FFF_FFFF;

/// Outcome of observing one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleDecision {
    /// Within rate budget and below the force-keep threshold; no event.
    Suppress,
    /// Report, carrying the bytes accumulated since the last report
    /// (including this allocation).
    Emit { representative_size: u64 },
}

/// Sampling state for one class.
#[derive(Debug, Clone)]
pub struct SampleStats {
    tick_of_bucket_start: u32,
    alloc_count_in_bucket: u64,
    /// Exponentially weighted average of the allocation rate.
    alloc_per_ms: f32,
    /// Allocations to suppress between reports. Zero means report everything.
    sampling_rate: u32,
    allocs_ignored: u64,
    ignored_bytes: u64,
    force_keep_bytes: u64,
}

impl SampleStats {
    pub fn new(now_ms: u32) -> Self {
        SampleStats {
            tick_of_bucket_start: now_ms,
            alloc_count_in_bucket: 0,
            alloc_per_ms: 0.0,
            sampling_rate: 0,
            allocs_ignored: 0,
            ignored_bytes: 0,
            force_keep_bytes: DEFAULT_FORCE_KEEP_BYTES,
        }
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    pub fn force_keep_bytes(&self) -> u64 {
        self.force_keep_bytes
    }

    /// Set the force-keep threshold. Zero reports every allocation of the type.
    pub fn set_force_keep_bytes(&mut self, bytes: u64) {
        self.force_keep_bytes = bytes;
    }

    /// Bytes accumulated from suppressed allocations since the last report.
    pub fn pending_bytes(&self) -> u64 {
        self.ignored_bytes
    }

    /// Account one allocation of `size` bytes at tick `now_ms` and decide
    /// whether to report it.
    pub fn observe(&mut self, size: u64, now_ms: u32) -> SampleDecision {
        self.allocs_ignored += 1;
        self.ignored_bytes += size;

        if size < self.force_keep_bytes {
            if self.allocs_ignored <= self.sampling_rate as u64 {
                return SampleDecision::Suppress;
            }
            // This one reports; fold the run it closes into the rate estimate.
            self.update_rate(now_ms);
        }

        let representative_size = self.ignored_bytes;
        self.allocs_ignored = 0;
        self.ignored_bytes = 0;
        SampleDecision::Emit { representative_size }
    }

    /// Re-estimate the allocation rate and derive the suppression count.
    ///
    /// Two paths update the average: the normal 16 ms bucket rollover, and a
    /// fast ramp for a burst that outruns the open bucket (the floor estimate
    /// `count / 16` already exceeds the average by 1.5x before 16 ms elapse).
    fn update_rate(&mut self, now_ms: u32) {
        self.alloc_count_in_bucket += self.allocs_ignored;
        let delta_ms = now_ms.wrapping_sub(self.tick_of_bucket_start) & TICK_WRAP_MASK;
        let floor_rate = self.alloc_count_in_bucket / BUCKET_MILLIS as u64;

        if delta_ms >= BUCKET_MILLIS {
            let new_rate = self.alloc_count_in_bucket as f32 / delta_ms as f32;
            self.alloc_per_ms = 0.8 * self.alloc_per_ms + 0.2 * new_rate;
            self.tick_of_bucket_start = now_ms;
            self.alloc_count_in_bucket = 0;
        } else if floor_rate > 2 && floor_rate as f32 > self.alloc_per_ms * 1.5 {
            self.alloc_per_ms = floor_rate as f32;
        } else {
            return;
        }

        // Aim under 100 reports/sec for the type, capped at 1-in-1000. A rate
        // of 1 suppresses nothing, so collapse it to 0.
        self.sampling_rate = ((self.alloc_per_ms * 10.0) as u32).min(MAX_SAMPLING_RATE);
        if self.sampling_rate == 1 {
            self.sampling_rate = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(stats: &mut SampleStats, sizes: &[u64], now_ms: u32) -> Vec<SampleDecision> {
        sizes.iter().map(|&s| stats.observe(s, now_ms)).collect()
    }

    #[test]
    fn test_fresh_state_reports_everything() {
        // sampling_rate starts at 0: nothing is suppressed.
        let mut stats = SampleStats::new(0);
        for size in [8u64, 16, 24] {
            assert_eq!(
                stats.observe(size, 0),
                SampleDecision::Emit {
                    representative_size: size
                }
            );
        }
    }

    #[test]
    fn test_force_keep_zero_reports_with_true_size() {
        let mut stats = SampleStats::new(0);
        stats.set_force_keep_bytes(0);
        for size in [1u64, 100, 10_000] {
            assert_eq!(
                stats.observe(size, 0),
                SampleDecision::Emit {
                    representative_size: size
                }
            );
        }
    }

    #[test]
    fn test_large_allocation_reports_and_leaves_rate_state_alone() {
        let mut stats = SampleStats::new(0);
        let decision = stats.observe(12_000, 3);
        assert_eq!(
            decision,
            SampleDecision::Emit {
                representative_size: 12_000
            }
        );
        assert_eq!(stats.sampling_rate, 0);
        assert_eq!(stats.alloc_count_in_bucket, 0);
        assert_eq!(stats.alloc_per_ms, 0.0);
        assert_eq!(stats.allocs_ignored, 0);
        assert_eq!(stats.ignored_bytes, 0);
    }

    #[test]
    fn test_preset_rate_accumulates_suppressed_bytes() {
        let mut stats = SampleStats::new(0);
        stats.sampling_rate = 4;
        stats.set_force_keep_bytes(u64::MAX);

        let decisions = drain(&mut stats, &[10, 20, 30, 40], 0);
        assert!(decisions.iter().all(|d| *d == SampleDecision::Suppress));
        assert_eq!(stats.allocs_ignored, 4);
        assert_eq!(stats.ignored_bytes, 100);

        assert_eq!(
            stats.observe(50, 0),
            SampleDecision::Emit {
                representative_size: 150
            }
        );
        assert_eq!(stats.allocs_ignored, 0);
        assert_eq!(stats.ignored_bytes, 0);
    }

    #[test]
    fn test_large_allocation_flushes_suppressed_bytes() {
        let mut stats = SampleStats::new(0);
        stats.sampling_rate = 100;
        assert_eq!(stats.observe(64, 0), SampleDecision::Suppress);
        assert_eq!(stats.observe(64, 0), SampleDecision::Suppress);
        assert_eq!(
            stats.observe(20_000, 0),
            SampleDecision::Emit {
                representative_size: 20_128
            }
        );
    }

    #[test]
    fn test_steady_stream_converges_to_bounded_report_rate() {
        // 1000 allocations per millisecond for 100 ms.
        let mut stats = SampleStats::new(0);
        let mut emits_in_tail = 0u64;
        for ms in 0..100u32 {
            for _ in 0..1000 {
                if let SampleDecision::Emit { .. } = stats.observe(24, ms) {
                    if ms >= 80 {
                        emits_in_tail += 1;
                    }
                }
            }
        }
        // Tail window is 20 ms / 20_000 allocations. Converged behavior is
        // between 0.1 and 1 report per millisecond.
        assert!(
            (2..=21).contains(&emits_in_tail),
            "tail emits = {emits_in_tail}"
        );
        assert!(stats.sampling_rate >= 100, "rate = {}", stats.sampling_rate);
        assert!(stats.sampling_rate <= 1000);
    }

    #[test]
    fn test_burst_triggers_fast_ramp_before_bucket_closes() {
        // 10_000 allocations land within a single open bucket (delta < 16 ms).
        let mut stats = SampleStats::new(0);
        let mut emits = 0u64;
        let mut rate_rose_mid_burst = false;
        for i in 0..10_000u64 {
            if let SampleDecision::Emit { .. } = stats.observe(32, 5) {
                emits += 1;
            }
            if i == 500 {
                rate_rose_mid_burst = stats.sampling_rate > 0;
            }
        }
        assert!(rate_rose_mid_burst, "ramp did not fire inside the burst");
        assert!(emits < 500, "burst emitted {emits} of 10000");
    }

    #[test]
    fn test_rate_of_one_collapses_to_zero() {
        let mut stats = SampleStats::new(0);
        // 11 allocations over one 16 ms bucket put the averaged rate at
        // 0.1375/ms, deriving a suppression count of 1, which suppresses
        // nothing and must collapse to 0.
        for _ in 0..10 {
            stats.observe(8, 0);
        }
        stats.observe(8, 16);
        assert!(stats.alloc_per_ms > 0.1);
        assert_eq!(stats.sampling_rate, 0);
    }

    #[test]
    fn test_tick_wraparound_still_rolls_bucket() {
        let mut stats = SampleStats::new(TICK_WRAP_MASK - 5);
        stats.observe(8, TICK_WRAP_MASK - 5);
        // The source wrapped; the masked delta is small but past the bucket.
        stats.observe(8, 20);
        assert_eq!(stats.alloc_count_in_bucket, 0);
        assert!(stats.alloc_per_ms > 0.0);
    }

    proptest! {
        /// Reported bytes plus still-pending bytes always equal the true
        /// total, whatever the interleaving of sizes, ticks, and thresholds.
        #[test]
        fn prop_representative_size_conserves_total_bytes(
            sizes in prop::collection::vec(0u64..20_000, 1..400),
            tick_step in 0u32..40,
            force_keep in prop_oneof![Just(0u64), Just(100), Just(10_000), Just(u64::MAX)],
            preset_rate in 0u32..50,
        ) {
            let mut stats = SampleStats::new(0);
            stats.sampling_rate = preset_rate;
            stats.set_force_keep_bytes(force_keep);

            let mut now = 0u32;
            let mut reported = 0u64;
            for &size in &sizes {
                now = now.wrapping_add(tick_step);
                if let SampleDecision::Emit { representative_size } = stats.observe(size, now) {
                    reported += representative_size;
                }
            }
            let total: u64 = sizes.iter().sum();
            prop_assert_eq!(reported + stats.pending_bytes(), total);
        }

        /// The derived suppression count never exceeds the hard cap.
        #[test]
        fn prop_sampling_rate_never_exceeds_cap(
            sizes in prop::collection::vec(1u64..256, 1..2000),
            tick_step in 0u32..4,
        ) {
            let mut stats = SampleStats::new(0);
            let mut now = 0u32;
            for &size in &sizes {
                now = now.wrapping_add(tick_step);
                stats.observe(size, now);
                prop_assert!(stats.sampling_rate() <= MAX_SAMPLING_RATE);
            }
        }
    }
}
