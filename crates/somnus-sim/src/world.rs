//! One simulated step: partition clocks run, the host's own night skip and
//! morning wake-up are emulated, simulated participants act, and the
//! coordinator's timers fire.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use somnus_core::clock::DayCycle;
use somnus_core::coordinator::Coordinator;
use somnus_core::host::{HostEvent, WorldHost};
use somnus_core::memory::InMemoryHost;
use somnus_types::{Partition, PartitionId};
use tracing::{debug, info, warn};

use crate::population::{self, ACTIVITY_KINDS, NamePool, SimulationConfig};

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Steps executed.
    pub steps: u64,
    /// Nights ended by the host's own skip rule.
    pub nights_skipped: u64,
    /// Rest postures entered.
    pub rests: u64,
    /// Messages the coordinator delivered.
    pub messages: u64,
    /// Timers fired.
    pub timers: u64,
}

/// The simulated host, its coordinator and the dice.
#[derive(Debug)]
pub struct Simulation {
    /// The in-memory host.
    pub host: InMemoryHost,
    /// The coordinator under test.
    pub coordinator: Coordinator,
    config: SimulationConfig,
    partitions: Vec<Partition>,
    names: NamePool,
    rng: StdRng,
    stats: SimStats,
}

impl Simulation {
    /// Assemble a simulation around an already populated host.
    pub fn new(
        host: InMemoryHost,
        coordinator: Coordinator,
        config: SimulationConfig,
        partitions: Vec<Partition>,
        names: NamePool,
        rng: StdRng,
    ) -> Self {
        Self {
            host,
            coordinator,
            config,
            partitions,
            names,
            rng,
            stats: SimStats::default(),
        }
    }

    /// Counters so far.
    pub const fn stats(&self) -> SimStats {
        self.stats
    }

    /// Announce every partition to the coordinator.
    pub fn load_all(&mut self, now: DateTime<Utc>) {
        for partition in self.partitions.clone() {
            self.dispatch(HostEvent::PartitionLoaded(partition), now);
        }
    }

    /// Run one step.
    pub fn step(&mut self, now: DateTime<Utc>) {
        self.stats.steps = self.stats.steps.saturating_add(1);
        for partition in self.partitions.clone() {
            self.run_clock(partition.id, now);
            self.behave(partition.id, now);
        }
        let fired = self.coordinator.tick(&mut self.host, now);
        self.stats.timers = self
            .stats
            .timers
            .saturating_add(u64::try_from(fired).unwrap_or(u64::MAX));

        let every = self.config.status_every_steps;
        if every > 0 && self.stats.steps.checked_rem(every) == Some(0) {
            for partition in &self.partitions {
                if let Some(report) =
                    self.coordinator
                        .status(&mut self.host, partition.id, true, now)
                {
                    info!(
                        partition = %partition.name,
                        needed = report.needed,
                        resting = report.resting,
                        possible = report.possible,
                        "Status"
                    );
                }
            }
        }
        self.drain_outbox();
    }

    /// Unload every partition.
    pub fn shutdown(&mut self, now: DateTime<Utc>) {
        self.coordinator.shutdown(&mut self.host, now);
        self.drain_outbox();
    }

    fn cycle(&self, partition: PartitionId) -> DayCycle {
        self.coordinator
            .state(partition)
            .map(|state| state.settings().day_cycle)
            .unwrap_or_default()
    }

    fn dispatch(&mut self, event: HostEvent, now: DateTime<Utc>) {
        let label = event.label();
        if let Err(e) = self.coordinator.handle(&mut self.host, event, now) {
            warn!(event = label, error = %e, "Host event rejected");
        }
    }

    /// Natural clock progress, the host's own skip, and the morning wake.
    fn run_clock(&mut self, partition: PartitionId, now: DateTime<Utc>) {
        let cycle = self.cycle(partition);
        let Some(time) = self.host.partition_time(partition) else {
            return;
        };
        let mut next = time.saturating_add(self.config.ticks_per_step);

        if !cycle.is_day(time) && self.host.native_skip_ready(partition) {
            next = cycle.next_morning(time).unwrap_or(next);
            self.stats.nights_skipped = self.stats.nights_skipped.saturating_add(1);
            info!(partition = %partition, from = time, to = next, "Night skipped");
        }
        self.host.set_partition_time(partition, next);

        if cycle.is_day(next) {
            for participant in self.host.resting_in(partition) {
                self.host.set_resting(participant.id, false);
                self.dispatch(
                    HostEvent::RestExited {
                        partition,
                        participant,
                    },
                    now,
                );
            }
        }
    }

    fn behave(&mut self, partition: PartitionId, now: DateTime<Utc>) {
        let chances = self.config.behaviour;
        let night = self
            .host
            .partition_time(partition)
            .is_some_and(|time| !self.cycle(partition).is_day(time));

        for participant in self.host.participants(partition) {
            if self.rng.random_bool(chances.leave) {
                self.host.disconnect(participant.id);
                debug!(participant = %participant.name, "Participant left");
                self.dispatch(
                    HostEvent::ParticipantLeft {
                        partition,
                        participant,
                    },
                    now,
                );
                continue;
            }

            if self.host.is_resting(participant.id) {
                if self.rng.random_bool(chances.wake) {
                    self.host.set_resting(participant.id, false);
                    self.dispatch(
                        HostEvent::RestExited {
                            partition,
                            participant: participant.clone(),
                        },
                        now,
                    );
                }
            } else if night
                && !self.host.is_away(participant.id)
                && self.rng.random_bool(chances.rest)
            {
                self.host.set_resting(participant.id, true);
                self.stats.rests = self.stats.rests.saturating_add(1);
                self.dispatch(
                    HostEvent::RestEntered {
                        partition,
                        participant: participant.clone(),
                    },
                    now,
                );
            }

            if !self.host.is_resting(participant.id) && self.rng.random_bool(chances.activity) {
                let kind = ACTIVITY_KINDS.choose(&mut self.rng).copied().unwrap_or("move");
                self.dispatch(
                    HostEvent::Activity {
                        partition,
                        participant: participant.clone(),
                        kind: kind.to_owned(),
                    },
                    now,
                );
            }

            if self.rng.random_bool(chances.away) {
                let away = !self.host.is_away(participant.id);
                self.host.set_away(participant.id, away);
                self.dispatch(
                    HostEvent::AwayChanged {
                        partition,
                        participant,
                        away,
                    },
                    now,
                );
            }
        }

        if self.rng.random_bool(chances.disturbance) {
            let resting = self.host.resting_in(partition);
            let location = resting
                .choose(&mut self.rng)
                .and_then(|target| self.host.position(target.id));
            if let Some(location) = location {
                self.dispatch(
                    HostEvent::Disturbance {
                        partition,
                        location,
                    },
                    now,
                );
            }
        }

        if self.rng.random_bool(chances.join) {
            let participant = population::spawn_participant(
                &mut self.host,
                &mut self.names,
                partition,
                &mut self.rng,
            );
            debug!(participant = %participant.name, "Participant joined");
            self.dispatch(
                HostEvent::ParticipantJoined {
                    partition,
                    participant,
                },
                now,
            );
        }
    }

    fn drain_outbox(&mut self) {
        for message in self.host.take_outbox() {
            self.stats.messages = self.stats.messages.saturating_add(1);
            info!(target_scope = ?message.target, text = %message.text, "Message");
        }
    }
}
