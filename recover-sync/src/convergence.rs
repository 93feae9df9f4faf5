//! Decides when the scan loop has caught up.
//!
//! The scan service returns the same cursor once there is nothing left to scan, so convergence
//! is exact equality of two successive cursors. Anything else, a cursor moving backwards
//! included, means the scan has not converged yet.

use crate::primitives::ScanCursor;

/// Returns `true` when `previous` exists and equals `current`.
///
/// Always `false` for the first scan step of a run.
pub fn has_converged(previous: Option<ScanCursor>, current: ScanCursor) -> bool {
    previous == Some(current)
}

/// Classification of a cursor against the one before it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorObservation {
    /// First cursor of the run
    First,
    /// Cursor moved forward
    Advanced {
        /// Cursor it moved from
        previous: ScanCursor,
    },
    /// Cursor repeated, the scan is caught up
    Converged,
    /// Cursor moved backwards
    Regressed {
        /// Cursor it moved back from
        previous: ScanCursor,
    },
}

/// Tracks the last cursor of a run
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvergenceDetector {
    previous: Option<ScanCursor>,
}

impl ConvergenceDetector {
    /// Creates a detector that has not seen any cursor
    pub fn new() -> Self {
        Self::default()
    }

    /// Last cursor observed
    pub fn previous(&self) -> Option<ScanCursor> {
        self.previous
    }

    /// Classifies `current` and, unless it converged, remembers it as the previous cursor.
    pub fn observe(&mut self, current: ScanCursor) -> CursorObservation {
        if has_converged(self.previous, current) {
            return CursorObservation::Converged;
        }

        let observation = match self.previous {
            None => CursorObservation::First,
            Some(previous) if current > previous => CursorObservation::Advanced { previous },
            Some(previous) => CursorObservation::Regressed { previous },
        };
        self.previous = Some(current);

        observation
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn repeat_after_advance_converges() {
        let mut detector = ConvergenceDetector::new();
        assert_eq!(
            detector.observe(ScanCursor::from_u32(100)),
            CursorObservation::First
        );
        assert_eq!(
            detector.observe(ScanCursor::from_u32(250)),
            CursorObservation::Advanced {
                previous: ScanCursor::from_u32(100)
            }
        );
        assert_eq!(
            detector.observe(ScanCursor::from_u32(250)),
            CursorObservation::Converged
        );
        assert_eq!(detector.previous(), Some(ScanCursor::from_u32(250)));
    }

    #[test]
    fn regression_is_remembered_and_not_converged() {
        let mut detector = ConvergenceDetector::new();
        detector.observe(ScanCursor::from_u32(300));
        assert_eq!(
            detector.observe(ScanCursor::from_u32(200)),
            CursorObservation::Regressed {
                previous: ScanCursor::from_u32(300)
            }
        );
        assert_eq!(detector.previous(), Some(ScanCursor::from_u32(200)));
        assert_eq!(
            detector.observe(ScanCursor::from_u32(200)),
            CursorObservation::Converged
        );
    }

    proptest! {
        #[test]
        fn never_converged_without_a_previous_cursor(height: u32) {
            prop_assert!(!has_converged(None, ScanCursor::from_u32(height)));
        }

        #[test]
        fn converged_on_equal_cursors(height: u32) {
            let cursor = ScanCursor::from_u32(height);
            prop_assert!(has_converged(Some(cursor), cursor));
        }

        #[test]
        fn not_converged_on_different_cursors(a: u32, b: u32) {
            prop_assume!(a != b);
            prop_assert!(!has_converged(Some(ScanCursor::from_u32(a)), ScanCursor::from_u32(b)));
        }

        #[test]
        fn first_observation_never_converges(height: u32) {
            let mut detector = ConvergenceDetector::new();
            prop_assert_eq!(detector.observe(ScanCursor::from_u32(height)), CursorObservation::First);
        }
    }
}
