//! Cancellable timers keyed by partition, owner, scope and label.
//!
//! The scheduler does not run anything on its own. The embedding loop calls
//! [`Coordinator::tick`] with the current time, which pops due timers and
//! routes each to its owner. Arming a key that is already armed replaces the
//! previous timer, so there is never more than one timer per key.
//!
//! [`Coordinator::tick`]: crate::coordinator::Coordinator::tick

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use somnus_types::{ParticipantId, PartitionId};

use crate::extension::RegistrationId;

/// Who armed a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerOwner {
    /// The coordinator itself (inactivity sweeps).
    Core,
    /// An extension registration.
    Extension(RegistrationId),
}

/// What a timer is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerScope {
    /// The partition as a whole.
    Partition,
    /// A single participant's session.
    Participant(ParticipantId),
}

/// Identity of a timer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    /// Partition the timer belongs to.
    pub partition: PartitionId,
    /// Who armed it.
    pub owner: TimerOwner,
    /// What it is attached to.
    pub scope: TimerScope,
    /// Owner-chosen label.
    pub label: String,
}

impl TimerKey {
    /// Build a key.
    pub fn new(
        partition: PartitionId,
        owner: TimerOwner,
        scope: TimerScope,
        label: impl Into<String>,
    ) -> Self {
        Self {
            partition,
            owner,
            scope,
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Timer {
    due: DateTime<Utc>,
    period: Option<TimeDelta>,
}

/// The timer table.
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: BTreeMap<TimerKey, Timer>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer due at `now + delay`, repeating every `period` if given.
    ///
    /// Returns `true` if an existing timer with the same key was replaced.
    pub fn arm(
        &mut self,
        key: TimerKey,
        now: DateTime<Utc>,
        delay: TimeDelta,
        period: Option<TimeDelta>,
    ) -> bool {
        let due = now.checked_add_signed(delay).unwrap_or(now);
        // A non-positive period would fire on every tick forever.
        let period = period.filter(|p| *p > TimeDelta::zero());
        self.timers.insert(key, Timer { due, period }).is_some()
    }

    /// Cancel one timer. Returns whether it was armed.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.timers.remove(key).is_some()
    }

    /// Whether a timer is armed.
    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.timers.contains_key(key)
    }

    /// Cancel every timer in a partition.
    pub fn cancel_partition(&mut self, partition: PartitionId) -> usize {
        self.cancel_where(|key| key.partition == partition)
    }

    /// Cancel every timer attached to a participant in a partition.
    pub fn cancel_participant(&mut self, partition: PartitionId, participant: ParticipantId) -> usize {
        self.cancel_where(|key| {
            key.partition == partition && key.scope == TimerScope::Participant(participant)
        })
    }

    /// Cancel every timer armed by an owner in a partition.
    pub fn cancel_owner_in(&mut self, partition: PartitionId, owner: TimerOwner) -> usize {
        self.cancel_where(|key| key.partition == partition && key.owner == owner)
    }

    /// Cancel every timer armed by an owner anywhere.
    pub fn cancel_owner(&mut self, owner: TimerOwner) -> usize {
        self.cancel_where(|key| key.owner == owner)
    }

    /// Remove and return due timers, earliest first.
    ///
    /// Periodic timers are re-armed one period later (or one period after
    /// `now` if they fell more than a period behind).
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<TimerKey> {
        let mut due: Vec<(DateTime<Utc>, TimerKey)> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.due <= now)
            .map(|(key, timer)| (timer.due, key.clone()))
            .collect();
        due.sort();

        for (_, key) in &due {
            let Some(timer) = self.timers.get_mut(key) else {
                continue;
            };
            match timer.period {
                Some(period) => {
                    let next = timer.due.checked_add_signed(period).unwrap_or(now);
                    timer.due = if next <= now {
                        now.checked_add_signed(period).unwrap_or(now)
                    } else {
                        next
                    };
                }
                None => {
                    self.timers.remove(key);
                }
            }
        }

        due.into_iter().map(|(_, key)| key).collect()
    }

    /// Earliest due time, if anything is armed.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.timers.values().map(|timer| timer.due).min()
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether nothing is armed.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Drop every timer.
    pub fn clear(&mut self) {
        self.timers.clear();
    }

    fn cancel_where(&mut self, predicate: impl Fn(&TimerKey) -> bool) -> usize {
        let before = self.timers.len();
        self.timers.retain(|key, _| !predicate(key));
        before.saturating_sub(self.timers.len())
    }
}
