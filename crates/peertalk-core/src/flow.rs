//! Flow control driven by peer-reported buffer pressure.
//!
//! Each side advertises its receive pressure in capability messages. The
//! sender consults [`should_throttle`] before queueing, and re-advertises its
//! own pressure whenever it moves across a 25/50/75 boundary.

use crate::queue::{PRESSURE_CRITICAL, PRESSURE_HIGH, PRESSURE_LOW, PRESSURE_MEDIUM, Priority};

/// Decide whether a send at `priority` should be dropped given the remote
/// peer's reported `pressure`.
///
/// | Pressure | Dropped            |
/// |----------|--------------------|
/// | < 50     | nothing            |
/// | 50-74    | LOW                |
/// | 75-89    | LOW, NORMAL        |
/// | >= 90    | all but CRITICAL   |
#[must_use]
pub fn should_throttle(pressure: u8, priority: Priority) -> bool {
    let floor = if pressure >= PRESSURE_CRITICAL {
        Priority::Critical
    } else if pressure >= PRESSURE_HIGH {
        Priority::High
    } else if pressure >= PRESSURE_MEDIUM {
        Priority::Normal
    } else {
        Priority::Low
    };
    priority < floor
}

/// Which quarter band a pressure value falls in (0-3)
#[must_use]
pub fn pressure_band(pressure: u8) -> u8 {
    match pressure {
        p if p >= PRESSURE_HIGH => 3,
        p if p >= PRESSURE_MEDIUM => 2,
        p if p >= PRESSURE_LOW => 1,
        _ => 0,
    }
}

/// Tracks the last advertised pressure band so updates are only sent on
/// boundary crossings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PressureTracker {
    band: u8,
    last: u8,
}

impl PressureTracker {
    /// Record a new pressure reading.
    ///
    /// Returns true when the reading crossed a 25/50/75 boundary since the
    /// last advertised value.
    pub fn update(&mut self, pressure: u8) -> bool {
        let band = pressure_band(pressure);
        self.last = pressure;
        if band == self.band {
            return false;
        }
        tracing::debug!(
            "Pressure crossed band boundary: band {} -> {} ({}%)",
            self.band,
            band,
            pressure
        );
        self.band = band;
        true
    }

    /// Most recent pressure reading
    #[must_use]
    pub fn last(&self) -> u8 {
        self.last
    }

    /// Forget history, as on a fresh connection
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_table() {
        for p in [Priority::Low, Priority::Normal, Priority::High, Priority::Critical] {
            assert!(!should_throttle(0, p));
            assert!(!should_throttle(49, p));
        }

        assert!(should_throttle(50, Priority::Low));
        assert!(!should_throttle(74, Priority::Normal));

        assert!(should_throttle(75, Priority::Normal));
        assert!(!should_throttle(89, Priority::High));

        assert!(should_throttle(90, Priority::High));
        assert!(!should_throttle(100, Priority::Critical));
    }

    #[test]
    fn test_pressure_band() {
        assert_eq!(pressure_band(0), 0);
        assert_eq!(pressure_band(24), 0);
        assert_eq!(pressure_band(25), 1);
        assert_eq!(pressure_band(50), 2);
        assert_eq!(pressure_band(75), 3);
        assert_eq!(pressure_band(100), 3);
    }

    #[test]
    fn test_tracker_signals_only_on_crossing() {
        let mut tracker = PressureTracker::default();
        assert!(!tracker.update(10));
        assert!(!tracker.update(24));
        assert!(tracker.update(25));
        assert!(!tracker.update(40));
        assert!(tracker.update(80));
        assert!(tracker.update(20));
        assert_eq!(tracker.last(), 20);

        tracker.reset();
        assert_eq!(tracker.last(), 0);
        assert!(!tracker.update(5));
    }
}
