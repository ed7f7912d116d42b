//! Extension registry and the contract extensions implement.
//!
//! An extension type is registered against a config section name with a
//! factory closure. For every loaded partition whose resolved settings
//! enable that section, the coordinator calls the factory and keeps the
//! resulting [`Extension`] alive until the partition unloads or the owner
//! deregisters.
//!
//! Every hook returns a `Result`. A failing hook is logged with the
//! partition and section and its effect is dropped; the extension stays
//! live. A failing factory or `load` means the extension is simply not
//! loaded for that partition.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use somnus_types::{Partition, PartitionId};

use crate::config::{ConfigError, ExtensionSection, PartitionSettings};
use crate::host::{Host, HostError, WorldHost};
use crate::notification::Announcement;
use crate::schedule::{Scheduler, TimerKey, TimerOwner, TimerScope};
use crate::state::{PartitionState, SleepEvent, Transition, Verdict};

/// Errors raised by extensions.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    /// The extension's config section is malformed.
    #[error("extension config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// A host capability call failed.
    #[error("host error: {source}")]
    Host {
        /// The underlying host error.
        #[from]
        source: HostError,
    },

    /// The extension cannot run against this host or partition.
    #[error("extension unsupported: {reason}")]
    Unsupported {
        /// Why it cannot run.
        reason: String,
    },

    /// The extension failed while handling a hook.
    #[error("extension failed: {reason}")]
    Failed {
        /// What went wrong.
        reason: String,
    },
}

/// Stable identity of a registration, assigned in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationId(u64);

impl RegistrationId {
    /// Wrap a raw sequence number.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw sequence number.
    pub const fn into_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ext-{}", self.0)
    }
}

/// What a factory gets to build an instance.
pub struct ExtensionSetup<'a> {
    /// The partition the instance will be bound to.
    pub partition: &'a Partition,
    /// The enabled config section.
    pub section: &'a ExtensionSection,
    /// The partition's resolved settings.
    pub settings: &'a PartitionSettings,
    /// Read access to the host.
    pub host: &'a dyn WorldHost,
}

/// Timer access scoped to one partition and one owner.
pub struct Timers<'a> {
    scheduler: &'a mut Scheduler,
    partition: PartitionId,
    owner: TimerOwner,
    now: DateTime<Utc>,
}

impl<'a> Timers<'a> {
    /// Scope a scheduler to a partition and owner.
    pub const fn new(
        scheduler: &'a mut Scheduler,
        partition: PartitionId,
        owner: TimerOwner,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            scheduler,
            partition,
            owner,
            now,
        }
    }

    fn key(&self, scope: TimerScope, label: &str) -> TimerKey {
        TimerKey::new(self.partition, self.owner, scope, label)
    }

    /// Arm a one-shot timer. Replaces any timer with the same label and
    /// scope.
    pub fn once(&mut self, scope: TimerScope, label: &str, delay: TimeDelta) -> bool {
        let key = self.key(scope, label);
        self.scheduler.arm(key, self.now, delay, None)
    }

    /// Arm a periodic timer. Replaces any timer with the same label and
    /// scope.
    pub fn every(&mut self, scope: TimerScope, label: &str, period: TimeDelta) -> bool {
        let key = self.key(scope, label);
        self.scheduler.arm(key, self.now, period, Some(period))
    }

    /// Cancel a timer.
    pub fn cancel(&mut self, scope: TimerScope, label: &str) -> bool {
        let key = self.key(scope, label);
        self.scheduler.cancel(&key)
    }

    /// Whether a timer is armed.
    pub fn is_armed(&self, scope: TimerScope, label: &str) -> bool {
        self.scheduler.is_armed(&self.key(scope, label))
    }
}

/// Everything a hook can reach.
pub struct ExtensionContext<'a> {
    /// The partition's state.
    pub state: &'a mut PartitionState,
    /// The host.
    pub host: &'a mut dyn Host,
    /// Timers owned by this extension in this partition.
    pub timers: Timers<'a>,
    /// Current time.
    pub now: DateTime<Utc>,
}

/// A per-partition extension instance.
///
/// All hooks default to doing nothing.
pub trait Extension: Send {
    /// Called once after construction, before any other hook.
    fn load(&mut self, _ctx: &mut ExtensionContext<'_>) -> Result<(), ExtensionError> {
        Ok(())
    }

    /// Review a transition before it is committed. Any veto stops it.
    fn review(
        &mut self,
        _ctx: &mut ExtensionContext<'_>,
        _transition: &Transition,
    ) -> Result<Verdict, ExtensionError> {
        Ok(Verdict::Accept)
    }

    /// Observe a committed event.
    fn observe(
        &mut self,
        _ctx: &mut ExtensionContext<'_>,
        _event: &SleepEvent,
    ) -> Result<(), ExtensionError> {
        Ok(())
    }

    /// Inspect a pending announcement. A veto cancels it; `needed` may be
    /// lowered but never raised.
    fn filter(
        &mut self,
        _ctx: &mut ExtensionContext<'_>,
        _announcement: &mut Announcement,
    ) -> Result<Verdict, ExtensionError> {
        Ok(Verdict::Accept)
    }

    /// A timer armed by this extension fired.
    fn on_timer(
        &mut self,
        _ctx: &mut ExtensionContext<'_>,
        _scope: TimerScope,
        _label: &str,
    ) -> Result<(), ExtensionError> {
        Ok(())
    }

    /// Tear down. Timers are cancelled by the coordinator regardless of
    /// the result.
    fn unload(&mut self, _ctx: &mut ExtensionContext<'_>) -> Result<(), ExtensionError> {
        Ok(())
    }
}

/// Builds an extension instance for one partition.
pub type ExtensionFactory =
    Box<dyn Fn(&ExtensionSetup<'_>) -> Result<Box<dyn Extension>, ExtensionError> + Send>;

/// One registered extension type.
pub struct Registration {
    /// Identity.
    pub id: RegistrationId,
    /// Who registered it.
    pub owner: String,
    /// Config section that enables it.
    pub section: String,
    /// Constructor.
    pub factory: ExtensionFactory,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("section", &self.section)
            .finish_non_exhaustive()
    }
}

/// Ordered list of registrations.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    registrations: Vec<Registration>,
    next_id: u64,
}

impl ExtensionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a registration.
    pub fn register(
        &mut self,
        owner: &str,
        section: &str,
        factory: ExtensionFactory,
    ) -> RegistrationId {
        let id = RegistrationId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.registrations.push(Registration {
            id,
            owner: owner.to_owned(),
            section: section.to_owned(),
            factory,
        });
        id
    }

    /// Remove every registration of an owner, returning their ids.
    pub fn remove_owner(&mut self, owner: &str) -> Vec<RegistrationId> {
        let removed = self
            .registrations
            .iter()
            .filter(|r| r.owner == owner)
            .map(|r| r.id)
            .collect();
        self.registrations.retain(|r| r.owner != owner);
        removed
    }

    /// Look up a registration.
    pub fn get(&self, id: RegistrationId) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.id == id)
    }

    /// Registrations in order.
    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.iter()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

/// A live instance bound to a partition.
pub struct LiveExtension {
    /// Which registration produced it.
    pub registration: RegistrationId,
    /// Its config section.
    pub section: String,
    /// The instance.
    pub instance: Box<dyn Extension>,
}

impl fmt::Debug for LiveExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveExtension")
            .field("registration", &self.registration)
            .field("section", &self.section)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Extension for Noop {}

    fn noop_factory() -> ExtensionFactory {
        Box::new(|_setup| Ok(Box::new(Noop) as Box<dyn Extension>))
    }

    #[test]
    fn registrations_keep_order_and_ids() {
        let mut registry = ExtensionRegistry::new();
        let a = registry.register("alpha", "time_lapse", noop_factory());
        let b = registry.register("beta", "rewards", noop_factory());
        let c = registry.register("alpha", "away", noop_factory());
        assert!(a < b && b < c);
        let sections: Vec<&str> = registry.iter().map(|r| r.section.as_str()).collect();
        assert_eq!(sections, vec!["time_lapse", "rewards", "away"]);

        assert_eq!(registry.remove_owner("alpha"), vec![a, c]);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(b).is_some());
        assert!(registry.get(a).is_none());
    }

    #[test]
    fn ids_are_not_reused() {
        let mut registry = ExtensionRegistry::new();
        let first = registry.register("alpha", "x", noop_factory());
        registry.remove_owner("alpha");
        let second = registry.register("alpha", "x", noop_factory());
        assert_ne!(first, second);
        assert_eq!(second.to_string(), "ext-1");
    }
}
