//! Descriptor structs exchanged between the host and the coordinator.

use serde::{Deserialize, Serialize};

use crate::ids::{ParticipantId, PartitionId};

/// A connected participant as the host describes it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Participant {
    /// Stable identity.
    pub id: ParticipantId,
    /// Display name; also the key for always-exempt lists.
    pub name: String,
}

impl Participant {
    /// Create a participant descriptor.
    pub fn new(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A world-like partition as the host describes it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    /// Stable identity while loaded.
    pub id: PartitionId,
    /// Name used to look up per-partition configuration.
    pub name: String,
}

impl Partition {
    /// Create a partition descriptor.
    pub fn new(id: PartitionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A point in a partition, used to locate disturbances.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// East-west coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
    /// North-south coordinate.
    pub z: f64,
}

impl Position {
    /// Create a position.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Squared euclidean distance to another position.
    pub fn distance_squared(&self, other: &Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx.mul_add(dx, dy.mul_add(dy, dz * dz))
    }
}

/// Reply to a status query for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Additional resting participants required before the cycle advances.
    pub needed: u32,
    /// Participants currently resting.
    pub resting: u32,
    /// Participants counted as eligible.
    pub possible: u32,
}
