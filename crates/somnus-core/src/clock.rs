//! Day cycle arithmetic for partition clocks.
//!
//! The host owns each partition's clock and exposes it as an absolute tick
//! count. This module interprets that count: where a day starts, when the
//! night (the window in which resting is possible) begins and ends, and
//! what time a forced advance should jump to.
//!
//! # Design Principles
//!
//! - All derivations use checked arithmetic (no silent overflow).
//! - The absolute tick is the source of truth; the phase is always derived.
//! - A forced advance never moves a clock backwards.

use somnus_types::TimeOfDay;

use crate::config::DayCycleConfig;

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// Advancing would overflow the tick counter.
    #[error("tick counter overflow: cannot advance beyond u64::MAX")]
    TickOverflow,

    /// Invalid day cycle configuration.
    #[error("invalid day cycle configuration: {reason}")]
    InvalidConfig {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

/// The shape of one day in a partition.
///
/// Offsets are relative to the start of a day (tick 0 of the day is the
/// "morning" marker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayCycle {
    /// Number of ticks in one full day.
    ticks_per_day: u64,
    /// Length of the morning phase at the start of each day.
    morning_ticks: u64,
    /// Offset at which dusk starts.
    dusk_start: u64,
    /// Offset at which resting becomes possible.
    night_start: u64,
    /// Offset at which resting stops being possible.
    night_end: u64,
}

impl Default for DayCycle {
    fn default() -> Self {
        Self {
            ticks_per_day: 24_000,
            morning_ticks: 1_000,
            dusk_start: 12_000,
            night_start: 12_542,
            night_end: 23_460,
        }
    }
}

impl DayCycle {
    /// Create a day cycle from configuration.
    ///
    /// The offsets must be ordered
    /// `morning_ticks <= dusk_start <= night_start < night_end <= ticks_per_day`
    /// and `ticks_per_day` must be at least 1.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::InvalidConfig`] if the offsets are out of order.
    pub fn new(config: &DayCycleConfig) -> Result<Self, ClockError> {
        if config.ticks_per_day == 0 {
            return Err(ClockError::InvalidConfig {
                reason: "ticks_per_day must be at least 1".to_owned(),
            });
        }
        let ordered = config.morning_ticks <= config.dusk_start
            && config.dusk_start <= config.night_start
            && config.night_start < config.night_end
            && config.night_end <= config.ticks_per_day;
        if !ordered {
            return Err(ClockError::InvalidConfig {
                reason: format!(
                    "phase offsets out of order: morning {} dusk {} night {}..{} day {}",
                    config.morning_ticks,
                    config.dusk_start,
                    config.night_start,
                    config.night_end,
                    config.ticks_per_day
                ),
            });
        }
        Ok(Self {
            ticks_per_day: config.ticks_per_day,
            morning_ticks: config.morning_ticks,
            dusk_start: config.dusk_start,
            night_start: config.night_start,
            night_end: config.night_end,
        })
    }

    /// Return the configured number of ticks per day.
    pub const fn ticks_per_day(&self) -> u64 {
        self.ticks_per_day
    }

    /// Offset of an absolute time within its day.
    pub fn offset(&self, time: u64) -> u64 {
        time.checked_rem(self.ticks_per_day).unwrap_or(0)
    }

    /// Compute the phase of the day for an absolute time.
    pub fn time_of_day(&self, time: u64) -> TimeOfDay {
        let offset = self.offset(time);
        if offset < self.morning_ticks {
            TimeOfDay::Morning
        } else if offset < self.dusk_start {
            TimeOfDay::Day
        } else if offset < self.night_start {
            TimeOfDay::Dusk
        } else if offset < self.night_end {
            TimeOfDay::Night
        } else {
            // The tail of the night rolls into the next morning.
            TimeOfDay::Morning
        }
    }

    /// Whether the partition's clock says the rest cycle is over.
    pub fn is_day(&self, time: u64) -> bool {
        !self.time_of_day(time).is_night()
    }

    /// The start of the day following `time`.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::TickOverflow`] if the next day lies beyond
    /// `u64::MAX`.
    pub fn next_morning(&self, time: u64) -> Result<u64, ClockError> {
        let day = time
            .checked_div(self.ticks_per_day)
            .ok_or(ClockError::TickOverflow)?;
        day.checked_add(1)
            .and_then(|next| next.checked_mul(self.ticks_per_day))
            .ok_or(ClockError::TickOverflow)
    }

    /// Number of ticks between `time` and the next morning marker.
    pub fn ticks_until_morning(&self, time: u64) -> u64 {
        self.next_morning(time)
            .map_or(0, |morning| morning.saturating_sub(time))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(ticks_per_day: u64, night_start: u64, night_end: u64) -> DayCycleConfig {
        DayCycleConfig {
            ticks_per_day,
            morning_ticks: 0,
            dusk_start: night_start,
            night_start,
            night_end,
        }
    }

    #[test]
    fn default_cycle_phases() {
        let cycle = DayCycle::default();
        assert_eq!(cycle.time_of_day(0), TimeOfDay::Morning);
        assert_eq!(cycle.time_of_day(6_000), TimeOfDay::Day);
        assert_eq!(cycle.time_of_day(12_100), TimeOfDay::Dusk);
        assert_eq!(cycle.time_of_day(13_000), TimeOfDay::Night);
        assert_eq!(cycle.time_of_day(23_500), TimeOfDay::Morning);
        // Phases repeat every day.
        assert_eq!(cycle.time_of_day(24_000 + 13_000), TimeOfDay::Night);
    }

    #[test]
    fn is_day_is_false_only_at_night() {
        let cycle = DayCycle::default();
        assert!(cycle.is_day(500));
        assert!(cycle.is_day(12_100));
        assert!(!cycle.is_day(18_000));
    }

    #[test]
    fn next_morning_keeps_day_count() {
        let cycle = DayCycle::default();
        assert_eq!(cycle.next_morning(18_000).unwrap(), 24_000);
        assert_eq!(cycle.next_morning(72_000 + 13_000).unwrap(), 96_000);
        assert_eq!(cycle.ticks_until_morning(18_000), 6_000);
    }

    #[test]
    fn next_morning_overflow_is_reported() {
        let cycle = DayCycle::default();
        assert!(matches!(
            cycle.next_morning(u64::MAX),
            Err(ClockError::TickOverflow)
        ));
        assert_eq!(cycle.ticks_until_morning(u64::MAX), 0);
    }

    #[test]
    fn custom_cycle_from_config() {
        let cycle = DayCycle::new(&config(100, 50, 90)).unwrap();
        assert_eq!(cycle.ticks_per_day(), 100);
        assert_eq!(cycle.time_of_day(60), TimeOfDay::Night);
        assert_eq!(cycle.time_of_day(95), TimeOfDay::Morning);
    }

    #[test]
    fn invalid_config_zero_ticks_per_day() {
        assert!(DayCycle::new(&config(0, 0, 0)).is_err());
    }

    #[test]
    fn invalid_config_unordered_night() {
        assert!(DayCycle::new(&config(100, 90, 50)).is_err());
        assert!(DayCycle::new(&config(100, 50, 150)).is_err());
    }
}
