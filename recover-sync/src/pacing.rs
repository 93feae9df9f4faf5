//! Batch size controller keeping each scan step near a target wall-clock duration.
//!
//! Scan cost grows roughly linearly with the number of blocks requested, so the next batch is
//! the previous one rescaled by `target / elapsed`. The rescale factor is bounded on both sides
//! so that one unusually fast or slow call moves the batch size by at most 20%.

use std::time::Duration;

use getset::CopyGetters;

use crate::primitives::BatchSize;

/// Wall-clock duration each scan step is steered towards
pub const TARGET_CALL_DURATION: Duration = Duration::from_millis(10_000);
/// Lower bound of the per-step rescale factor
pub const MIN_RESCALE: f64 = 0.8;
/// Upper bound of the per-step rescale factor
pub const MAX_RESCALE: f64 = 1.2;

/// Proportional controller for the scan step batch size
#[derive(Debug, Clone, Copy, PartialEq, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct PacingController {
    /// Target duration of a single scan step
    target: Duration,
    /// Batch size of the first scan step
    initial_batch_size: BatchSize,
    /// Lower bound of the rescale factor
    min_rescale: f64,
    /// Upper bound of the rescale factor
    max_rescale: f64,
}

impl PacingController {
    /// Creates a controller.
    ///
    /// Bounds are reordered if given the wrong way round.
    pub fn new(
        target: Duration,
        initial_batch_size: BatchSize,
        min_rescale: f64,
        max_rescale: f64,
    ) -> Self {
        let (min_rescale, max_rescale) = if min_rescale <= max_rescale {
            (min_rescale, max_rescale)
        } else {
            (max_rescale, min_rescale)
        };
        PacingController {
            target,
            initial_batch_size,
            min_rescale,
            max_rescale,
        }
    }

    /// Returns a copy of this controller steering towards a different target duration
    pub fn with_target(self, target: Duration) -> Self {
        PacingController { target, ..self }
    }

    /// Returns a copy of this controller starting from a different batch size
    pub fn with_initial_batch_size(self, initial_batch_size: BatchSize) -> Self {
        PacingController {
            initial_batch_size,
            ..self
        }
    }

    /// Bounded rescale factor for a scan step that took `elapsed`.
    ///
    /// Durations under a millisecond count as one millisecond.
    pub fn rescale(&self, elapsed: Duration) -> f64 {
        let elapsed_ms = elapsed.as_millis().max(1) as f64;
        let rescale = self.target.as_millis() as f64 / elapsed_ms;

        // `f64::clamp` panics on NaN bounds, min/max do not
        rescale.max(self.min_rescale).min(self.max_rescale)
    }

    /// Batch size for the next scan step given the previous batch size and how long it took.
    ///
    /// The product is truncated so fractional results never round a batch up. The result is
    /// never below [`BatchSize::MIN`].
    pub fn next(&self, previous: BatchSize, elapsed: Duration) -> BatchSize {
        let scaled = (f64::from(previous.get()) * self.rescale(elapsed)).trunc();

        // float to int casts saturate, so oversized products cap at `u32::MAX`
        BatchSize::new(scaled as u32)
    }
}

impl Default for PacingController {
    fn default() -> Self {
        PacingController::new(
            TARGET_CALL_DURATION,
            BatchSize::DEFAULT,
            MIN_RESCALE,
            MAX_RESCALE,
        )
    }
}

/// Next batch size using the default target and bounds, in plain integers.
pub fn next_batch_size(previous: u32, elapsed_ms: u64) -> u32 {
    PacingController::default()
        .next(BatchSize::new(previous), Duration::from_millis(elapsed_ms))
        .get()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn on_target_call_keeps_batch_size() {
        assert_eq!(next_batch_size(1_000, 10_000), 1_000);
    }

    #[test]
    fn fast_call_grows_by_at_most_twenty_percent() {
        assert_eq!(next_batch_size(1_000, 5_000), 1_200);
        assert_eq!(next_batch_size(1_000, 1), 1_200);
    }

    #[test]
    fn slow_call_shrinks_by_at_most_twenty_percent() {
        assert_eq!(next_batch_size(1_000, 50_000), 800);
    }

    #[test]
    fn proportional_inside_the_bounds() {
        // 10_000 / 9_000 = 1.111..
        assert_eq!(next_batch_size(1_000, 9_000), 1_111);
        // 10_000 / 12_500 = 0.8 exactly
        assert_eq!(next_batch_size(1_000, 12_500), 800);
    }

    #[test]
    fn zero_elapsed_is_treated_as_one_millisecond() {
        let controller = PacingController::default();
        assert_eq!(controller.rescale(Duration::ZERO), MAX_RESCALE);
        assert_eq!(
            controller.next(BatchSize::new(10), Duration::from_micros(300)),
            BatchSize::new(12)
        );
    }

    #[test]
    fn small_batches_never_truncate_to_zero() {
        // 1 * 0.8 truncates to 0
        assert_eq!(next_batch_size(1, 60_000), 1);
        assert_eq!(next_batch_size(0, 60_000), 1);
    }

    #[test]
    fn huge_batches_saturate() {
        assert_eq!(next_batch_size(u32::MAX, 1), u32::MAX);
    }

    #[test]
    fn swapped_bounds_are_reordered() {
        let controller =
            PacingController::new(TARGET_CALL_DURATION, BatchSize::DEFAULT, 1.2, 0.8);
        assert_eq!(controller.min_rescale(), 0.8);
        assert_eq!(controller.max_rescale(), 1.2);
    }

    #[test]
    fn custom_target() {
        let controller = PacingController::default().with_target(Duration::from_secs(2));
        assert_eq!(
            controller.next(BatchSize::new(500), Duration::from_secs(2)),
            BatchSize::new(500)
        );
        assert_eq!(
            controller.next(BatchSize::new(500), Duration::from_secs(10)),
            BatchSize::new(400)
        );
    }

    proptest! {
        #[test]
        fn next_stays_within_growth_bound(previous in 1u32..=10_000_000, elapsed_ms in 1u64..=1_000_000) {
            let next = next_batch_size(previous, elapsed_ms);
            let ceiling = (u64::from(previous) * 6 + 4) / 5;
            prop_assert!(next >= 1);
            prop_assert!(u64::from(next) <= ceiling);
        }

        #[test]
        fn slow_calls_never_grow_the_batch(previous in 1u32..=10_000_000, elapsed_ms in 10_000u64..=10_000_000) {
            prop_assert!(next_batch_size(previous, elapsed_ms) <= previous);
        }

        #[test]
        fn fast_calls_never_shrink_the_batch(previous in 1u32..=10_000_000, elapsed_ms in 1u64..=10_000) {
            prop_assert!(next_batch_size(previous, elapsed_ms) >= previous);
        }
    }
}
