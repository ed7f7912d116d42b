//! Time lapse: instead of skipping the night in one jump, run the
//! partition clock forward in steps until morning.
//!
//! The extension vetoes unsafe forced advances while it is night and arms a
//! periodic timer instead. Each firing moves the clock by `step` ticks
//! (scaled by the share of eligible participants resting, if configured),
//! never past the next morning. The lapse stops at morning, on awaken, or
//! when enough participants get up that the threshold no longer holds.

use chrono::TimeDelta;
use serde::Deserialize;
use somnus_core::config::ConfigError;
use somnus_core::extension::{Extension, ExtensionContext, ExtensionError, ExtensionFactory};
use somnus_core::schedule::TimerScope;
use somnus_core::state::{Participation, SleepEvent, Transition, Verdict};
use tracing::{debug, info};

/// Config section that enables the extension.
pub const SECTION: &str = "time_lapse";

const TIMER: &str = "lapse";

/// Parameters of the `time_lapse` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TimeLapseConfig {
    /// Ticks added to the clock per firing.
    #[serde(default = "default_step")]
    pub step: u32,

    /// Milliseconds between firings.
    #[serde(default = "default_interval_millis")]
    pub interval_millis: u32,

    /// Multiply `step` by the resting share of eligible participants.
    #[serde(default)]
    pub scale_by_participation: bool,
}

impl Default for TimeLapseConfig {
    fn default() -> Self {
        Self {
            step: default_step(),
            interval_millis: default_interval_millis(),
            scale_by_participation: false,
        }
    }
}

const fn default_step() -> u32 {
    100
}

const fn default_interval_millis() -> u32 {
    50
}

/// Per-partition time lapse.
#[derive(Debug)]
pub struct TimeLapse {
    config: TimeLapseConfig,
    interval: TimeDelta,
}

impl TimeLapse {
    /// Create from validated parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `step` or `interval_millis` is
    /// zero.
    pub fn new(config: TimeLapseConfig) -> Result<Self, ConfigError> {
        if config.step == 0 || config.interval_millis == 0 {
            return Err(ConfigError::Invalid {
                reason: "time_lapse step and interval_millis must be positive".to_owned(),
            });
        }
        Ok(Self {
            config,
            interval: TimeDelta::milliseconds(i64::from(config.interval_millis)),
        })
    }

    fn step(&self, ctx: &ExtensionContext<'_>) -> u64 {
        if !self.config.scale_by_participation {
            return u64::from(self.config.step);
        }
        let result = ctx.state.evaluate(ctx.host.world(), ctx.now);
        scaled_step(self.config.step, Participation::from(&result).factor())
    }

    fn stop(ctx: &mut ExtensionContext<'_>, why: &str) {
        if ctx.timers.cancel(TimerScope::Partition, TIMER) {
            debug!(partition = %ctx.state.partition().name, why, "Time lapse stopped");
        }
    }
}

/// `step * factor`, rounded, never below one tick.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scaled_step(step: u32, factor: f64) -> u64 {
    // factor is within [0, 1], so the product fits in a u32.
    let scaled = (f64::from(step) * factor.clamp(0.0, 1.0)).round() as u32;
    u64::from(scaled.max(1))
}

impl Extension for TimeLapse {
    fn review(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        transition: &Transition,
    ) -> Result<Verdict, ExtensionError> {
        let Transition::ForcedAdvance(request) = transition else {
            return Ok(Verdict::Accept);
        };
        if request.safe {
            return Ok(Verdict::Accept);
        }
        let Some(time) = ctx.host.partition_time(ctx.state.id()) else {
            return Ok(Verdict::Accept);
        };
        if ctx.state.settings().day_cycle.is_day(time) {
            return Ok(Verdict::Accept);
        }

        if !ctx.timers.is_armed(TimerScope::Partition, TIMER) {
            ctx.timers.every(TimerScope::Partition, TIMER, self.interval);
            info!(
                partition = %ctx.state.partition().name,
                step = self.config.step,
                interval_millis = self.config.interval_millis,
                "Time lapse started"
            );
        }
        Ok(Verdict::Veto)
    }

    fn observe(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        event: &SleepEvent,
    ) -> Result<(), ExtensionError> {
        match event {
            SleepEvent::Awakened => Self::stop(ctx, "awakened"),
            SleepEvent::RestExited(_) | SleepEvent::Disturbed(_) | SleepEvent::Left(_) => {
                if ctx.timers.is_armed(TimerScope::Partition, TIMER)
                    && !ctx.state.evaluate(ctx.host.world(), ctx.now).is_satisfied()
                {
                    Self::stop(ctx, "threshold lost");
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn on_timer(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        _scope: TimerScope,
        label: &str,
    ) -> Result<(), ExtensionError> {
        if label != TIMER {
            return Ok(());
        }
        let partition = ctx.state.id();
        let Some(time) = ctx.host.partition_time(partition) else {
            Self::stop(ctx, "partition gone");
            return Ok(());
        };
        let cycle = ctx.state.settings().day_cycle;
        if cycle.is_day(time) {
            Self::stop(ctx, "morning");
            return Ok(());
        }

        let morning = cycle
            .next_morning(time)
            .map_err(|e| ExtensionError::Failed {
                reason: e.to_string(),
            })?;
        let next = time.saturating_add(self.step(ctx)).min(morning);
        ctx.host.set_partition_time(partition, next);
        if next >= morning {
            Self::stop(ctx, "morning");
        }
        Ok(())
    }
}

/// Factory for the `time_lapse` section.
pub fn factory() -> ExtensionFactory {
    Box::new(|setup| {
        let config: TimeLapseConfig = setup.section.decode()?;
        Ok(Box::new(TimeLapse::new(config)?) as Box<dyn Extension>)
    })
}
