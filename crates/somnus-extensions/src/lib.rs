//! Built-in extensions for the Somnus coordinator.
//!
//! Each module exposes the config section that enables it and a
//! `factory()` producing per-partition instances:
//!
//! - [`time_lapse`] -- accelerates the night instead of skipping it
//! - [`away`] -- exempts participants an idle detector reports as away
//! - [`rewards`] -- grants rewards to participants who rested through
//! - [`spam_filter`] -- mutes repeated rest announcements
//!
//! [`register_builtin`] registers all four under [`BUILTIN_OWNER`].

pub mod away;
pub mod rewards;
pub mod spam_filter;
pub mod time_lapse;

use chrono::{DateTime, Utc};
use somnus_core::coordinator::Coordinator;
use somnus_core::extension::RegistrationId;
use somnus_core::host::Host;

/// Owner name of the built-in registrations.
pub const BUILTIN_OWNER: &str = "somnus";

/// Register every built-in extension. Instances are created for each
/// loaded partition whose settings enable the section.
pub fn register_builtin(
    coordinator: &mut Coordinator,
    host: &mut dyn Host,
    now: DateTime<Utc>,
) -> Vec<RegistrationId> {
    vec![
        coordinator.register(host, BUILTIN_OWNER, away::SECTION, away::factory(), now),
        coordinator.register(
            host,
            BUILTIN_OWNER,
            spam_filter::SECTION,
            spam_filter::factory(),
            now,
        ),
        coordinator.register(
            host,
            BUILTIN_OWNER,
            time_lapse::SECTION,
            time_lapse::factory(),
            now,
        ),
        coordinator.register(host, BUILTIN_OWNER, rewards::SECTION, rewards::factory(), now),
    ]
}
