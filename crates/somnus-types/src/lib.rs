//! Shared type definitions for the Somnus rest-cycle coordinator.
//!
//! This crate is the single source of truth for the identifiers and
//! descriptors exchanged between a host and the coordinator.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for participants and partitions
//! - [`enums`] -- Notification kinds, exemption reasons, time-of-day phases
//! - [`structs`] -- Participant/partition descriptors, positions, status

pub mod enums;
pub mod ids;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{ExemptReason, NotificationKind, TimeOfDay};
pub use ids::{ParticipantId, PartitionId};
pub use structs::{Participant, Partition, Position, StatusReport};
