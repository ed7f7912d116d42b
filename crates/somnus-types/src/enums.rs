//! Enumeration types shared across the Somnus workspace.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// The reason a notification is generated.
///
/// Each kind maps to one throttle rule in a partition's notification table.
/// The serialized names double as the keys of the `notifications` config
/// section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A participant entered the resting posture.
    RestEntered,
    /// A participant left the resting posture after the cycle completed.
    RestLeft,
    /// A resting participant was ejected by a disturbance.
    Disturbed,
    /// The partition's rest cycle was forced forward.
    ForcedAdvance,
    /// Reply to a status query.
    Status,
    /// A participant was exempted for inactivity.
    InactiveExempted,
}

impl NotificationKind {
    /// Every notification kind, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::RestEntered,
        Self::RestLeft,
        Self::Disturbed,
        Self::ForcedAdvance,
        Self::Status,
        Self::InactiveExempted,
    ];

    /// The config key for this kind.
    pub const fn key(self) -> &'static str {
        match self {
            Self::RestEntered => "rest_entered",
            Self::RestLeft => "rest_left",
            Self::Disturbed => "disturbed",
            Self::ForcedAdvance => "forced_advance",
            Self::Status => "status",
            Self::InactiveExempted => "inactive_exempted",
        }
    }
}

impl core::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.key())
    }
}

// ---------------------------------------------------------------------------
// Exemption
// ---------------------------------------------------------------------------

/// Why a participant is currently exempt from the rest count.
///
/// Automatic reasons are cleared by observed activity and by the end of a
/// cycle. Standing reasons persist until the condition behind them goes
/// away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExemptReason {
    /// The participant has not been active within the inactivity limit.
    Inactivity,
    /// A forced advance cascaded the exemption onto everyone awake.
    Forced,
    /// The participant's name is on the partition's always-exempt list.
    AlwaysExempt,
    /// The participant holds the exemption grant.
    Permission,
    /// The participant is in the default-exempt partition.
    DefaultPartition,
    /// An away/idle integration reported the participant as away.
    Away,
    /// The flag was set by something outside Somnus.
    Admin,
}

impl ExemptReason {
    /// Whether activity and awakening clear this exemption.
    pub const fn is_automatic(self) -> bool {
        matches!(self, Self::Inactivity | Self::Forced)
    }

    /// Whether participants exempted for this reason are left out of the
    /// `possible` set when evaluating eligibility.
    pub const fn excludes_from_count(self) -> bool {
        matches!(self, Self::Away | Self::Admin | Self::DefaultPartition)
    }
}

// ---------------------------------------------------------------------------
// Time of day
// ---------------------------------------------------------------------------

/// Coarse phase of a partition's day, derived from its clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeOfDay {
    /// Start of the day; the rest cycle has ended.
    Morning,
    /// Regular daytime.
    Day,
    /// Transition into night; resting is not yet possible.
    Dusk,
    /// Resting is possible.
    Night,
}

impl TimeOfDay {
    /// Whether a rest cycle can be in progress during this phase.
    pub const fn is_night(self) -> bool {
        matches!(self, Self::Night)
    }
}
