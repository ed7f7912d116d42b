//! Capability traits the coordinator uses to reach the host, and the events
//! the host feeds back in.
//!
//! The coordinator never owns participants, clocks or message delivery. It
//! reads and mutates them through three narrow traits:
//!
//! - [`WorldHost`] -- partition clocks, membership, posture flags,
//!   permissions and positions
//! - [`Courier`] -- text delivery to one participant, a partition, or a
//!   permission group
//! - [`Benefactor`] -- reward delivery (commands, experience, items,
//!   effects, health and food)
//!
//! [`Host`] is blanket-implemented for anything providing all three.

use somnus_types::{Participant, ParticipantId, Partition, PartitionId, Position};

/// Permission that exempts its holder from every rest cycle.
pub const EXEMPT_PERMISSION: &str = "somnus.exempt";

/// Permission whose holder advances the night by resting alone.
pub const INSTANT_PERMISSION: &str = "somnus.instant";

/// Permission group that receives published notifications.
pub const NOTIFY_PERMISSION: &str = "somnus.notify";

/// Errors a host reports back from a capability call.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The host refused or failed the request.
    #[error("host rejected request: {reason}")]
    Rejected {
        /// Host-supplied explanation.
        reason: String,
    },

    /// The target participant is not connected.
    #[error("participant {participant} is offline")]
    Offline {
        /// The participant that could not be reached.
        participant: ParticipantId,
    },
}

/// Read and mutate partition and participant state owned by the host.
pub trait WorldHost {
    /// Every partition the host currently has loaded.
    fn partitions(&self) -> Vec<Partition>;

    /// Participants currently present in a partition.
    fn participants(&self, partition: PartitionId) -> Vec<Participant>;

    /// Absolute clock of a partition, `None` if it is not loaded.
    fn partition_time(&self, partition: PartitionId) -> Option<u64>;

    /// Move a partition's clock. Unknown partitions are ignored.
    fn set_partition_time(&mut self, partition: PartitionId, time: u64);

    /// Whether the participant is connected.
    fn is_online(&self, participant: ParticipantId) -> bool;

    /// Whether the participant is in the resting posture.
    fn is_resting(&self, participant: ParticipantId) -> bool;

    /// Whether the host skips the participant when checking who rests.
    fn is_rest_ignored(&self, participant: ParticipantId) -> bool;

    /// Set the rest-ignored posture flag.
    fn set_rest_ignored(&mut self, participant: ParticipantId, ignored: bool);

    /// Whether the participant holds a permission.
    fn has_permission(&self, participant: ParticipantId, permission: &str) -> bool;

    /// Current position of the participant.
    fn position(&self, participant: ParticipantId) -> Option<Position>;

    /// Whether the participant is flagged away by an idle integration.
    fn is_away(&self, _participant: ParticipantId) -> bool {
        false
    }
}

/// Outbound text delivery.
///
/// Sending to a participant who is not connected is a silent no-op.
pub trait Courier {
    /// Deliver to a single participant.
    fn send(&mut self, participant: ParticipantId, text: &str);

    /// Deliver to everyone in a partition.
    fn broadcast(&mut self, partition: PartitionId, text: &str);

    /// Deliver to everyone holding a permission.
    fn publish(&mut self, permission: &str, text: &str);
}

/// Reward delivery.
pub trait Benefactor {
    /// Run a console command as the host.
    fn dispatch_command(&mut self, command: &str) -> Result<(), HostError>;

    /// Grant experience points.
    fn give_experience(&mut self, participant: ParticipantId, amount: u32)
    -> Result<(), HostError>;

    /// Add an item stack to the participant's inventory.
    fn give_item(
        &mut self,
        participant: ParticipantId,
        item: &str,
        amount: u32,
    ) -> Result<(), HostError>;

    /// Apply a timed effect.
    fn apply_effect(
        &mut self,
        participant: ParticipantId,
        effect: &str,
        duration_ticks: u32,
        amplifier: u8,
    ) -> Result<(), HostError>;

    /// Restore health and food.
    fn restore(&mut self, participant: ParticipantId, health: f64, food: u32)
    -> Result<(), HostError>;
}

/// Everything the coordinator needs from a host.
pub trait Host: WorldHost + Courier + Benefactor {
    /// View as a [`WorldHost`] trait object.
    fn world(&self) -> &dyn WorldHost;

    /// View as a mutable [`WorldHost`] trait object.
    fn world_mut(&mut self) -> &mut dyn WorldHost;
}

impl<T: WorldHost + Courier + Benefactor> Host for T {
    fn world(&self) -> &dyn WorldHost {
        self
    }

    fn world_mut(&mut self) -> &mut dyn WorldHost {
        self
    }
}

/// Host events delivered to [`Coordinator::handle`].
///
/// [`Coordinator::handle`]: crate::coordinator::Coordinator::handle
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A partition finished loading.
    PartitionLoaded(Partition),
    /// A partition is unloading.
    PartitionUnloaded(PartitionId),
    /// A participant appeared in a partition.
    ParticipantJoined {
        /// Target partition.
        partition: PartitionId,
        /// Who joined.
        participant: Participant,
    },
    /// A participant disconnected from a partition.
    ParticipantLeft {
        /// Source partition.
        partition: PartitionId,
        /// Who left.
        participant: Participant,
    },
    /// A participant moved between partitions.
    ParticipantChangedPartition {
        /// Partition left behind.
        from: PartitionId,
        /// Partition entered.
        to: PartitionId,
        /// Who moved.
        participant: Participant,
    },
    /// A participant lay down.
    RestEntered {
        /// Partition of the participant.
        partition: PartitionId,
        /// Who lay down.
        participant: Participant,
    },
    /// A participant got up.
    RestExited {
        /// Partition of the participant.
        partition: PartitionId,
        /// Who got up.
        participant: Participant,
    },
    /// A participant did something.
    Activity {
        /// Partition of the participant.
        partition: PartitionId,
        /// Who acted.
        participant: Participant,
        /// Event-kind token compared against the monitored set.
        kind: String,
    },
    /// Something woke resting participants near a location.
    Disturbance {
        /// Partition of the disturbance.
        partition: PartitionId,
        /// Where it happened.
        location: Position,
    },
    /// An idle integration flagged or unflagged a participant as away.
    AwayChanged {
        /// Partition of the participant.
        partition: PartitionId,
        /// Who changed.
        participant: Participant,
        /// New away state.
        away: bool,
    },
}

impl HostEvent {
    /// Short name used in log fields.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::PartitionLoaded(_) => "partition_loaded",
            Self::PartitionUnloaded(_) => "partition_unloaded",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::ParticipantChangedPartition { .. } => "participant_changed_partition",
            Self::RestEntered { .. } => "rest_entered",
            Self::RestExited { .. } => "rest_exited",
            Self::Activity { .. } => "activity",
            Self::Disturbance { .. } => "disturbance",
            Self::AwayChanged { .. } => "away_changed",
        }
    }
}
