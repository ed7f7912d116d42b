//! Step loop with run bounds.
//!
//! [`run`] drives [`Simulation::step`] on a fixed interval until the step
//! budget or the wall-clock budget is spent, or the process is interrupted.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::info;

use crate::world::{SimStats, Simulation};

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// `max_steps` was reached.
    MaxStepsReached,
    /// `max_real_time_seconds` elapsed.
    MaxRealTimeReached,
    /// Ctrl-C was received.
    Interrupted,
}

/// Result of a run.
#[derive(Debug, Clone, Copy)]
pub struct RunResult {
    /// Why the run ended.
    pub end_reason: EndReason,
    /// Counters at the end.
    pub stats: SimStats,
}

/// Run bounds.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    /// Delay between steps.
    pub interval: Duration,
    /// Step budget (0 = unbounded).
    pub max_steps: u64,
    /// Wall-clock budget (0 = unbounded).
    pub max_real_time_seconds: u64,
}

/// Drive the simulation until a bound is hit or Ctrl-C arrives.
pub async fn run(sim: &mut Simulation, bounds: Bounds) -> RunResult {
    let started = Instant::now();
    info!(
        interval_ms = bounds.interval.as_millis(),
        max_steps = bounds.max_steps,
        max_real_time_seconds = bounds.max_real_time_seconds,
        "Simulation starting"
    );

    let end_reason = loop {
        if bounds.max_real_time_seconds > 0
            && started.elapsed().as_secs() >= bounds.max_real_time_seconds
        {
            break EndReason::MaxRealTimeReached;
        }

        sim.step(Utc::now());

        if bounds.max_steps > 0 && sim.stats().steps >= bounds.max_steps {
            break EndReason::MaxStepsReached;
        }

        tokio::select! {
            () = tokio::time::sleep(bounds.interval) => {}
            _ = tokio::signal::ctrl_c() => break EndReason::Interrupted,
        }
    };

    sim.shutdown(Utc::now());
    RunResult {
        end_reason,
        stats: sim.stats(),
    }
}

/// Log the end of a run.
pub fn log_end(result: &RunResult) {
    info!(
        reason = ?result.end_reason,
        steps = result.stats.steps,
        nights_skipped = result.stats.nights_skipped,
        rests = result.stats.rests,
        messages = result.stats.messages,
        timers = result.stats.timers,
        "Simulation ended"
    );
}
