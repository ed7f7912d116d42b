//! In-memory host used by the simulator and by tests.
//!
//! Keeps partitions, participants and their posture flags in plain maps,
//! records every delivered message and reward, and counts posture flag
//! writes so callers can assert that redundant flips never happen.

use std::collections::{BTreeMap, BTreeSet};

use somnus_types::{Participant, ParticipantId, Partition, PartitionId, Position};

use crate::host::{Benefactor, Courier, HostError, WorldHost};
use crate::notification::Delivery;

/// A message handed to the courier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Delivery scope.
    pub target: Delivery,
    /// Rendered text.
    pub text: String,
}

/// A reward handed to the benefactor.
#[derive(Debug, Clone, PartialEq)]
pub enum Grant {
    /// Experience points.
    Experience {
        /// Recipient.
        participant: ParticipantId,
        /// Points granted.
        amount: u32,
    },
    /// An item stack.
    Item {
        /// Recipient.
        participant: ParticipantId,
        /// Item identifier.
        item: String,
        /// Stack size.
        amount: u32,
    },
    /// A timed effect.
    Effect {
        /// Recipient.
        participant: ParticipantId,
        /// Effect identifier.
        effect: String,
        /// Duration in ticks.
        duration_ticks: u32,
        /// Effect strength.
        amplifier: u8,
    },
    /// Health and food restoration.
    Restore {
        /// Recipient.
        participant: ParticipantId,
        /// Health restored.
        health: f64,
        /// Food restored.
        food: u32,
    },
}

#[derive(Debug, Clone)]
struct PartitionEntry {
    partition: Partition,
    time: u64,
}

#[derive(Debug, Clone)]
struct ParticipantEntry {
    participant: Participant,
    partition: PartitionId,
    online: bool,
    resting: bool,
    rest_ignored: bool,
    away: bool,
    position: Position,
    permissions: BTreeSet<String>,
}

/// A host backed by in-memory maps.
#[derive(Debug, Default)]
pub struct InMemoryHost {
    partitions: BTreeMap<PartitionId, PartitionEntry>,
    participants: BTreeMap<ParticipantId, ParticipantEntry>,
    outbox: Vec<Delivered>,
    commands: Vec<String>,
    grants: Vec<Grant>,
    flag_writes: u32,
}

impl InMemoryHost {
    /// Create an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a partition with its clock at `time`.
    pub fn add_partition(&mut self, name: &str, time: u64) -> Partition {
        let partition = Partition::new(PartitionId::new(), name);
        self.partitions.insert(
            partition.id,
            PartitionEntry {
                partition: partition.clone(),
                time,
            },
        );
        partition
    }

    /// Forget a partition. Its participants are disconnected.
    pub fn remove_partition(&mut self, partition: PartitionId) {
        self.partitions.remove(&partition);
        for entry in self.participants.values_mut() {
            if entry.partition == partition {
                entry.online = false;
            }
        }
    }

    /// Connect a new participant to a partition.
    pub fn add_participant(&mut self, partition: PartitionId, name: &str) -> Participant {
        let participant = Participant::new(ParticipantId::new(), name);
        self.participants.insert(
            participant.id,
            ParticipantEntry {
                participant: participant.clone(),
                partition,
                online: true,
                resting: false,
                rest_ignored: false,
                away: false,
                position: Position::default(),
                permissions: BTreeSet::new(),
            },
        );
        participant
    }

    /// Move a participant to another partition.
    pub fn move_participant(&mut self, participant: ParticipantId, partition: PartitionId) {
        if let Some(entry) = self.participants.get_mut(&participant) {
            entry.partition = partition;
            entry.resting = false;
        }
    }

    /// Disconnect a participant. The entry is kept so late lookups see it
    /// offline.
    pub fn disconnect(&mut self, participant: ParticipantId) {
        if let Some(entry) = self.participants.get_mut(&participant) {
            entry.online = false;
            entry.resting = false;
        }
    }

    /// Set the resting posture.
    pub fn set_resting(&mut self, participant: ParticipantId, resting: bool) {
        if let Some(entry) = self.participants.get_mut(&participant) {
            entry.resting = resting;
        }
    }

    /// Set the away flag.
    pub fn set_away(&mut self, participant: ParticipantId, away: bool) {
        if let Some(entry) = self.participants.get_mut(&participant) {
            entry.away = away;
        }
    }

    /// Move a participant within its partition.
    pub fn set_position(&mut self, participant: ParticipantId, position: Position) {
        if let Some(entry) = self.participants.get_mut(&participant) {
            entry.position = position;
        }
    }

    /// Grant a permission.
    pub fn grant(&mut self, participant: ParticipantId, permission: &str) {
        if let Some(entry) = self.participants.get_mut(&participant) {
            entry.permissions.insert(permission.to_owned());
        }
    }

    /// Partition a participant is in, if connected.
    pub fn partition_of(&self, participant: ParticipantId) -> Option<PartitionId> {
        self.participants
            .get(&participant)
            .filter(|entry| entry.online)
            .map(|entry| entry.partition)
    }

    /// Participants currently resting in a partition.
    pub fn resting_in(&self, partition: PartitionId) -> Vec<Participant> {
        self.participants
            .values()
            .filter(|e| e.online && e.partition == partition && e.resting)
            .map(|e| e.participant.clone())
            .collect()
    }

    /// The host's own skip rule: someone rests and every other present
    /// participant either rests or is rest-ignored.
    pub fn native_skip_ready(&self, partition: PartitionId) -> bool {
        let present: Vec<&ParticipantEntry> = self
            .participants
            .values()
            .filter(|e| e.online && e.partition == partition)
            .collect();
        present.iter().any(|e| e.resting) && present.iter().all(|e| e.resting || e.rest_ignored)
    }

    /// Messages delivered so far.
    pub fn outbox(&self) -> &[Delivered] {
        &self.outbox
    }

    /// Drain delivered messages.
    pub fn take_outbox(&mut self) -> Vec<Delivered> {
        std::mem::take(&mut self.outbox)
    }

    /// Console commands dispatched so far.
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Rewards granted so far.
    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    /// Number of posture flag writes.
    pub const fn flag_writes(&self) -> u32 {
        self.flag_writes
    }

    fn online(&self, participant: ParticipantId) -> Result<(), HostError> {
        if self.is_online(participant) {
            Ok(())
        } else {
            Err(HostError::Offline { participant })
        }
    }
}

impl WorldHost for InMemoryHost {
    fn partitions(&self) -> Vec<Partition> {
        self.partitions
            .values()
            .map(|entry| entry.partition.clone())
            .collect()
    }

    fn participants(&self, partition: PartitionId) -> Vec<Participant> {
        self.participants
            .values()
            .filter(|e| e.online && e.partition == partition)
            .map(|e| e.participant.clone())
            .collect()
    }

    fn partition_time(&self, partition: PartitionId) -> Option<u64> {
        self.partitions.get(&partition).map(|entry| entry.time)
    }

    fn set_partition_time(&mut self, partition: PartitionId, time: u64) {
        if let Some(entry) = self.partitions.get_mut(&partition) {
            entry.time = time;
        }
    }

    fn is_online(&self, participant: ParticipantId) -> bool {
        self.participants
            .get(&participant)
            .is_some_and(|entry| entry.online)
    }

    fn is_resting(&self, participant: ParticipantId) -> bool {
        self.participants
            .get(&participant)
            .is_some_and(|entry| entry.resting)
    }

    fn is_rest_ignored(&self, participant: ParticipantId) -> bool {
        self.participants
            .get(&participant)
            .is_some_and(|entry| entry.rest_ignored)
    }

    fn set_rest_ignored(&mut self, participant: ParticipantId, ignored: bool) {
        if let Some(entry) = self.participants.get_mut(&participant) {
            entry.rest_ignored = ignored;
            self.flag_writes = self.flag_writes.saturating_add(1);
        }
    }

    fn has_permission(&self, participant: ParticipantId, permission: &str) -> bool {
        self.participants
            .get(&participant)
            .is_some_and(|entry| entry.permissions.contains(permission))
    }

    fn position(&self, participant: ParticipantId) -> Option<Position> {
        self.participants
            .get(&participant)
            .filter(|entry| entry.online)
            .map(|entry| entry.position)
    }

    fn is_away(&self, participant: ParticipantId) -> bool {
        self.participants
            .get(&participant)
            .is_some_and(|entry| entry.away)
    }
}

impl Courier for InMemoryHost {
    fn send(&mut self, participant: ParticipantId, text: &str) {
        if self.is_online(participant) {
            self.outbox.push(Delivered {
                target: Delivery::Direct(participant),
                text: text.to_owned(),
            });
        }
    }

    fn broadcast(&mut self, partition: PartitionId, text: &str) {
        if self.partitions.contains_key(&partition) {
            self.outbox.push(Delivered {
                target: Delivery::Partition(partition),
                text: text.to_owned(),
            });
        }
    }

    fn publish(&mut self, permission: &str, text: &str) {
        self.outbox.push(Delivered {
            target: Delivery::Permission(permission.to_owned()),
            text: text.to_owned(),
        });
    }
}

impl Benefactor for InMemoryHost {
    fn dispatch_command(&mut self, command: &str) -> Result<(), HostError> {
        if command.trim().is_empty() {
            return Err(HostError::Rejected {
                reason: "empty command".to_owned(),
            });
        }
        self.commands.push(command.to_owned());
        Ok(())
    }

    fn give_experience(
        &mut self,
        participant: ParticipantId,
        amount: u32,
    ) -> Result<(), HostError> {
        self.online(participant)?;
        self.grants.push(Grant::Experience {
            participant,
            amount,
        });
        Ok(())
    }

    fn give_item(
        &mut self,
        participant: ParticipantId,
        item: &str,
        amount: u32,
    ) -> Result<(), HostError> {
        self.online(participant)?;
        self.grants.push(Grant::Item {
            participant,
            item: item.to_owned(),
            amount,
        });
        Ok(())
    }

    fn apply_effect(
        &mut self,
        participant: ParticipantId,
        effect: &str,
        duration_ticks: u32,
        amplifier: u8,
    ) -> Result<(), HostError> {
        self.online(participant)?;
        self.grants.push(Grant::Effect {
            participant,
            effect: effect.to_owned(),
            duration_ticks,
            amplifier,
        });
        Ok(())
    }

    fn restore(
        &mut self,
        participant: ParticipantId,
        health: f64,
        food: u32,
    ) -> Result<(), HostError> {
        self.online(participant)?;
        self.grants.push(Grant::Restore {
            participant,
            health,
            food,
        });
        Ok(())
    }
}
