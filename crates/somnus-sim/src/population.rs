//! Simulated partitions and participants.
//!
//! The `simulation` section of `somnus-config.yaml` decides how many
//! partitions exist, how crowded they are, and how likely each participant
//! is to rest, wake, act, go away, or leave on any given step.

use std::collections::BTreeSet;

use rand::Rng;
use rand::seq::IndexedRandom;
use serde::Deserialize;
use somnus_core::memory::InMemoryHost;
use somnus_types::{Participant, Partition, PartitionId, Position};
use tracing::info;

use crate::error::SimError;

// -----------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------

/// The `simulation` config section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimulationConfig {
    /// Partition names to create.
    #[serde(default = "default_partitions")]
    pub partitions: Vec<String>,

    /// Participants created in each partition at start.
    #[serde(default = "default_participants_per_partition")]
    pub participants_per_partition: u32,

    /// Clock ticks a partition's clock runs per step.
    #[serde(default = "default_ticks_per_step")]
    pub ticks_per_step: u64,

    /// Wall-clock milliseconds between steps.
    #[serde(default = "default_step_interval_ms")]
    pub step_interval_ms: u64,

    /// Stop after this many steps (0 = unbounded).
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    /// Stop after this many seconds (0 = unbounded).
    #[serde(default)]
    pub max_real_time_seconds: u64,

    /// Broadcast a status report every this many steps (0 = never).
    #[serde(default = "default_status_every_steps")]
    pub status_every_steps: u64,

    /// Seed for reproducible runs; random when absent.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Per-step behaviour probabilities.
    #[serde(default)]
    pub behaviour: Behaviour,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            participants_per_partition: default_participants_per_partition(),
            ticks_per_step: default_ticks_per_step(),
            step_interval_ms: default_step_interval_ms(),
            max_steps: default_max_steps(),
            max_real_time_seconds: 0,
            status_every_steps: default_status_every_steps(),
            seed: None,
            behaviour: Behaviour::default(),
        }
    }
}

impl SimulationConfig {
    /// Check that every probability lies in `[0, 1]`.
    pub fn validate(&self) -> Result<(), SimError> {
        for (name, chance) in self.behaviour.chances() {
            if !(0.0..=1.0).contains(&chance) {
                return Err(SimError::Simulation {
                    message: format!("behaviour.{name} must be within [0, 1], got {chance}"),
                });
            }
        }
        if self.partitions.is_empty() {
            return Err(SimError::Simulation {
                message: "at least one partition is required".to_owned(),
            });
        }
        Ok(())
    }
}

/// Probabilities rolled once per participant (or partition) per step.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Behaviour {
    /// A present, awake participant lies down at night.
    #[serde(default = "default_rest_chance")]
    pub rest: f64,
    /// A resting participant gets up before morning.
    #[serde(default = "default_wake_chance")]
    pub wake: f64,
    /// A participant produces an activity event.
    #[serde(default = "default_activity_chance")]
    pub activity: f64,
    /// A participant's away state flips.
    #[serde(default = "default_away_chance")]
    pub away: f64,
    /// A participant disconnects.
    #[serde(default = "default_leave_chance")]
    pub leave: f64,
    /// A new participant connects to a partition.
    #[serde(default = "default_join_chance")]
    pub join: f64,
    /// Something disturbs a resting participant.
    #[serde(default = "default_disturbance_chance")]
    pub disturbance: f64,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            rest: default_rest_chance(),
            wake: default_wake_chance(),
            activity: default_activity_chance(),
            away: default_away_chance(),
            leave: default_leave_chance(),
            join: default_join_chance(),
            disturbance: default_disturbance_chance(),
        }
    }
}

impl Behaviour {
    fn chances(&self) -> [(&'static str, f64); 7] {
        [
            ("rest", self.rest),
            ("wake", self.wake),
            ("activity", self.activity),
            ("away", self.away),
            ("leave", self.leave),
            ("join", self.join),
            ("disturbance", self.disturbance),
        ]
    }
}

fn default_partitions() -> Vec<String> {
    vec!["world".to_owned()]
}

const fn default_participants_per_partition() -> u32 {
    6
}

const fn default_ticks_per_step() -> u64 {
    100
}

const fn default_step_interval_ms() -> u64 {
    100
}

const fn default_max_steps() -> u64 {
    2_000
}

const fn default_status_every_steps() -> u64 {
    250
}

const fn default_rest_chance() -> f64 {
    0.05
}

const fn default_wake_chance() -> f64 {
    0.005
}

const fn default_activity_chance() -> f64 {
    0.1
}

const fn default_away_chance() -> f64 {
    0.002
}

const fn default_leave_chance() -> f64 {
    0.001
}

const fn default_join_chance() -> f64 {
    0.005
}

const fn default_disturbance_chance() -> f64 {
    0.002
}

// -----------------------------------------------------------------------
// Names and placement
// -----------------------------------------------------------------------

/// Built-in pool of participant names.
const NAME_POOL: &[&str] = &[
    "Alder", "Birch", "Cedar", "Dusk", "Ember", "Fern", "Grove", "Haze", "Iris", "Juniper",
    "Kestrel", "Lark", "Moss", "Nettle", "Oak", "Pine", "Quill", "Reed", "Sage", "Thorn",
    "Umber", "Vale", "Wren", "Yarrow", "Zephyr",
];

/// Activity kinds a simulated participant produces.
pub const ACTIVITY_KINDS: &[&str] = &["move", "chat", "interact", "command"];

/// Hands out unique participant names.
#[derive(Debug, Default)]
pub struct NamePool {
    used: BTreeSet<String>,
}

impl NamePool {
    /// Pick an unused name, suffixing a number once the pool runs dry.
    pub fn pick(&mut self, rng: &mut impl Rng) -> String {
        let available: Vec<&&str> = NAME_POOL
            .iter()
            .filter(|name| !self.used.contains(**name))
            .collect();
        let name = available.choose(rng).map_or_else(
            || {
                // The count only grows, so the suffix never repeats.
                let base = NAME_POOL.choose(rng).copied().unwrap_or("Wanderer");
                format!("{base}{}", self.used.len())
            },
            |name| (**name).to_owned(),
        );
        self.used.insert(name.clone());
        name
    }
}

/// A random spot near the partition's origin.
pub fn random_position(rng: &mut impl Rng) -> Position {
    Position::new(
        rng.random_range(-24.0..24.0),
        64.0,
        rng.random_range(-24.0..24.0),
    )
}

/// Add a named participant at a random position.
pub fn spawn_participant(
    host: &mut InMemoryHost,
    names: &mut NamePool,
    partition: PartitionId,
    rng: &mut impl Rng,
) -> Participant {
    let name = names.pick(rng);
    let participant = host.add_participant(partition, &name);
    host.set_position(participant.id, random_position(rng));
    participant
}

/// Create every configured partition and its starting participants.
///
/// Partition clocks start at midday so the first night arrives after a
/// short run.
pub fn populate(
    config: &SimulationConfig,
    host: &mut InMemoryHost,
    names: &mut NamePool,
    rng: &mut impl Rng,
) -> Vec<Partition> {
    let mut partitions = Vec::with_capacity(config.partitions.len());
    for name in &config.partitions {
        let partition = host.add_partition(name, 6_000);
        for _ in 0..config.participants_per_partition {
            spawn_participant(host, names, partition.id, rng);
        }
        info!(
            partition = %partition.name,
            participants = config.participants_per_partition,
            "Partition populated"
        );
        partitions.push(partition);
    }
    partitions
}
