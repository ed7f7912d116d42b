//! The coordinator: one [`PartitionState`] per loaded partition, the
//! extension instances bound to it, and the timers that drive both.
//!
//! Every host event is handled to completion before the next one. A
//! transition's [`Outcome`] is settled in a fixed order:
//!
//! 1. extensions observe each event
//! 2. each announcement passes the extension filters, then the partition's
//!    throttle, then the courier
//! 3. a requested forced advance is reviewed by the extensions and, unless
//!    vetoed, applied; its own outcome is settled the same way

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use somnus_types::{
    ExemptReason, Participant, ParticipantId, Partition, PartitionId, Position, StatusReport,
};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SomnusConfig};
use crate::extension::{
    ExtensionContext, ExtensionFactory, ExtensionRegistry, ExtensionSetup, LiveExtension,
    Registration, RegistrationId, Timers,
};
use crate::host::{Host, HostEvent, WorldHost};
use crate::notification::{Announcement, Delivery};
use crate::schedule::{Scheduler, TimerKey, TimerOwner, TimerScope};
use crate::state::{
    ForceRequest, Outcome, PartitionState, SleepEvent, StateError, Transition, Verdict,
};

/// Label of the per-partition inactivity sweep timer.
pub const SWEEP_TIMER: &str = "inactivity_sweep";

/// Errors returned by coordinator commands.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The partition is on the excluded list.
    #[error("partition {partition} is excluded")]
    Excluded {
        /// Partition name.
        partition: String,
    },

    /// The partition already has state.
    #[error("partition {partition} is already loaded")]
    AlreadyLoaded {
        /// Partition name.
        partition: String,
    },

    /// The partition has no state.
    #[error("partition {partition} is not loaded")]
    NotLoaded {
        /// Partition id.
        partition: PartitionId,
    },

    /// A force was requested while nobody rests.
    #[error("nobody is resting in {partition}")]
    NobodyResting {
        /// Partition name.
        partition: String,
    },

    /// The partition's configuration did not resolve.
    #[error("configuration error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// Partition state could not be created.
    #[error("state error: {source}")]
    State {
        /// The underlying state error.
        #[from]
        source: StateError,
    },
}

/// A loaded partition and its live extensions.
#[derive(Debug)]
struct PartitionSlot {
    state: PartitionState,
    extensions: Vec<LiveExtension>,
}

/// What settling an outcome did.
#[derive(Debug, Clone, Copy, Default)]
struct Settled {
    awakened: bool,
}

impl PartitionSlot {
    fn name(&self) -> &str {
        &self.state.partition().name
    }

    /// Build and load an instance of `registration` if the partition
    /// enables its section.
    fn instantiate(
        &mut self,
        scheduler: &mut Scheduler,
        host: &mut dyn Host,
        registration: &Registration,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(section) = self.state.settings().enabled_extension(&registration.section) else {
            return false;
        };
        let setup = ExtensionSetup {
            partition: self.state.partition(),
            section,
            settings: self.state.settings(),
            host: host.world(),
        };
        let mut instance = match (registration.factory)(&setup) {
            Ok(instance) => instance,
            Err(e) => {
                warn!(
                    partition = %self.name(),
                    section = %registration.section,
                    error = %e,
                    "Extension failed to construct"
                );
                return false;
            }
        };

        let partition = self.state.id();
        let owner = TimerOwner::Extension(registration.id);
        let loaded = {
            let mut ctx = ExtensionContext {
                state: &mut self.state,
                host: &mut *host,
                timers: Timers::new(&mut *scheduler, partition, owner, now),
                now,
            };
            instance.load(&mut ctx)
        };
        if let Err(e) = loaded {
            warn!(
                partition = %self.name(),
                section = %registration.section,
                error = %e,
                "Extension failed to load"
            );
            scheduler.cancel_owner_in(partition, owner);
            return false;
        }

        debug!(partition = %self.name(), section = %registration.section, "Extension loaded");
        self.extensions.push(LiveExtension {
            registration: registration.id,
            section: registration.section.clone(),
            instance,
        });
        true
    }

    /// Tear down one instance. Its timers are cancelled whatever the
    /// teardown returns.
    fn teardown(
        &mut self,
        mut live: LiveExtension,
        scheduler: &mut Scheduler,
        host: &mut dyn Host,
        now: DateTime<Utc>,
    ) {
        let partition = self.state.id();
        let owner = TimerOwner::Extension(live.registration);
        let result = {
            let mut ctx = ExtensionContext {
                state: &mut self.state,
                host: &mut *host,
                timers: Timers::new(&mut *scheduler, partition, owner, now),
                now,
            };
            live.instance.unload(&mut ctx)
        };
        if let Err(e) = result {
            warn!(
                partition = %self.name(),
                section = %live.section,
                error = %e,
                "Extension failed to unload"
            );
        }
        scheduler.cancel_owner_in(partition, owner);
        debug!(partition = %self.name(), section = %live.section, "Extension unloaded");
    }

    fn teardown_all(&mut self, scheduler: &mut Scheduler, host: &mut dyn Host, now: DateTime<Utc>) {
        while let Some(live) = self.extensions.pop() {
            self.teardown(live, scheduler, host, now);
        }
    }

    fn observe(
        &mut self,
        scheduler: &mut Scheduler,
        host: &mut dyn Host,
        event: &SleepEvent,
        now: DateTime<Utc>,
    ) {
        let partition = self.state.id();
        let Self { state, extensions } = self;
        for live in extensions.iter_mut() {
            let owner = TimerOwner::Extension(live.registration);
            let mut ctx = ExtensionContext {
                state: &mut *state,
                host: &mut *host,
                timers: Timers::new(&mut *scheduler, partition, owner, now),
                now,
            };
            if let Err(e) = live.instance.observe(&mut ctx, event) {
                warn!(
                    partition = %state.partition().name,
                    section = %live.section,
                    error = %e,
                    "Extension observer failed"
                );
            }
        }
    }

    /// Ask every extension about a transition. The first veto wins.
    fn review(
        &mut self,
        scheduler: &mut Scheduler,
        host: &mut dyn Host,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Verdict {
        let partition = self.state.id();
        let Self { state, extensions } = self;
        for live in extensions.iter_mut() {
            let owner = TimerOwner::Extension(live.registration);
            let mut ctx = ExtensionContext {
                state: &mut *state,
                host: &mut *host,
                timers: Timers::new(&mut *scheduler, partition, owner, now),
                now,
            };
            match live.instance.review(&mut ctx, transition) {
                Ok(Verdict::Accept) => {}
                Ok(Verdict::Veto) => {
                    debug!(
                        partition = %state.partition().name,
                        section = %live.section,
                        "Transition vetoed"
                    );
                    return Verdict::Veto;
                }
                Err(e) => warn!(
                    partition = %state.partition().name,
                    section = %live.section,
                    error = %e,
                    "Extension review failed"
                ),
            }
        }
        Verdict::Accept
    }

    /// Run an announcement through the filters. The first veto cancels it.
    fn filter(
        &mut self,
        scheduler: &mut Scheduler,
        host: &mut dyn Host,
        announcement: &mut Announcement,
        now: DateTime<Utc>,
    ) -> Verdict {
        let partition = self.state.id();
        let Self { state, extensions } = self;
        for live in extensions.iter_mut() {
            let owner = TimerOwner::Extension(live.registration);
            let mut ctx = ExtensionContext {
                state: &mut *state,
                host: &mut *host,
                timers: Timers::new(&mut *scheduler, partition, owner, now),
                now,
            };
            match live.instance.filter(&mut ctx, announcement) {
                Ok(Verdict::Accept) => {}
                Ok(Verdict::Veto) => return Verdict::Veto,
                Err(e) => warn!(
                    partition = %state.partition().name,
                    section = %live.section,
                    error = %e,
                    "Extension filter failed"
                ),
            }
        }
        Verdict::Accept
    }

    fn fire_timer(
        &mut self,
        scheduler: &mut Scheduler,
        host: &mut dyn Host,
        key: &TimerKey,
        registration: RegistrationId,
        now: DateTime<Utc>,
    ) {
        let partition = self.state.id();
        let Self { state, extensions } = self;
        let Some(live) = extensions
            .iter_mut()
            .find(|live| live.registration == registration)
        else {
            scheduler.cancel(key);
            return;
        };
        let mut ctx = ExtensionContext {
            state: &mut *state,
            host: &mut *host,
            timers: Timers::new(&mut *scheduler, partition, key.owner, now),
            now,
        };
        if let Err(e) = live.instance.on_timer(&mut ctx, key.scope, &key.label) {
            warn!(
                partition = %state.partition().name,
                section = %live.section,
                label = %key.label,
                error = %e,
                "Extension timer failed"
            );
        }
    }

    fn deliver(
        &mut self,
        scheduler: &mut Scheduler,
        host: &mut dyn Host,
        mut announcement: Announcement,
        now: DateTime<Utc>,
    ) {
        let authoritative = announcement.needed;
        if self.filter(scheduler, host, &mut announcement, now) == Verdict::Veto {
            debug!(partition = %self.name(), kind = %announcement.kind, "Announcement cancelled");
            return;
        }
        announcement.lower_needed(authoritative);

        let Some(text) = self.state.notify(&announcement, now) else {
            return;
        };
        match &announcement.delivery {
            Delivery::Direct(participant) => host.send(*participant, &text),
            Delivery::Partition(partition) => host.broadcast(*partition, &text),
            Delivery::Permission(permission) => host.publish(permission, &text),
        }
    }

    fn settle(
        &mut self,
        scheduler: &mut Scheduler,
        host: &mut dyn Host,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Settled {
        let mut settled = Settled::default();
        let mut pending = Some(outcome);
        while let Some(outcome) = pending.take() {
            for event in &outcome.events {
                if *event == SleepEvent::Awakened {
                    settled.awakened = true;
                }
                self.observe(scheduler, host, event, now);
            }
            for announcement in outcome.announcements {
                self.deliver(scheduler, host, announcement, now);
            }
            let Some(request) = outcome.force else {
                continue;
            };
            if self.state.is_forcing() {
                debug!(partition = %self.name(), "Forced advance already running");
                continue;
            }
            let transition = Transition::ForcedAdvance(request.clone());
            if self.review(scheduler, host, &transition, now) == Verdict::Veto {
                continue;
            }
            match self.state.force_advance(host.world_mut(), &request, now) {
                Ok(next) => {
                    info!(
                        partition = %self.name(),
                        safe = request.safe,
                        requester = ?request.requester.as_ref().map(|p| &p.name),
                        "Night advanced"
                    );
                    pending = Some(next);
                }
                Err(e) => warn!(partition = %self.name(), error = %e, "Forced advance failed"),
            }
        }
        settled
    }
}

/// Owns every loaded partition's state and the extension lifecycle.
#[derive(Debug)]
pub struct Coordinator {
    config: SomnusConfig,
    partitions: BTreeMap<PartitionId, PartitionSlot>,
    registry: ExtensionRegistry,
    scheduler: Scheduler,
}

impl Coordinator {
    /// Create a coordinator with no partitions loaded.
    pub fn new(config: SomnusConfig) -> Self {
        Self {
            config,
            partitions: BTreeMap::new(),
            registry: ExtensionRegistry::new(),
            scheduler: Scheduler::new(),
        }
    }

    /// The configuration in use.
    pub const fn config(&self) -> &SomnusConfig {
        &self.config
    }

    /// Whether a partition has state.
    pub fn is_loaded(&self, partition: PartitionId) -> bool {
        self.partitions.contains_key(&partition)
    }

    /// State of a loaded partition.
    pub fn state(&self, partition: PartitionId) -> Option<&PartitionState> {
        self.partitions.get(&partition).map(|slot| &slot.state)
    }

    /// Loaded partitions.
    pub fn loaded(&self) -> Vec<Partition> {
        self.partitions
            .values()
            .map(|slot| slot.state.partition().clone())
            .collect()
    }

    /// Sections of the live extensions in a partition, in load order.
    pub fn live_extensions(&self, partition: PartitionId) -> Vec<String> {
        self.partitions
            .get(&partition)
            .map(|slot| slot.extensions.iter().map(|l| l.section.clone()).collect())
            .unwrap_or_default()
    }

    /// The registry.
    pub const fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// The timer table.
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // -----------------------------------------------------------------------
    // Partition lifecycle
    // -----------------------------------------------------------------------

    /// Create state for a partition, join its present participants, arm
    /// its inactivity sweep and load its enabled extensions.
    ///
    /// Participants already resting are counted, and a threshold that
    /// already holds requests a forced advance once extensions are loaded.
    pub fn load(
        &mut self,
        host: &mut dyn Host,
        partition: &Partition,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        if self.config.is_excluded(&partition.name) {
            return Err(CoordinatorError::Excluded {
                partition: partition.name.clone(),
            });
        }
        if self.partitions.contains_key(&partition.id) {
            return Err(CoordinatorError::AlreadyLoaded {
                partition: partition.name.clone(),
            });
        }

        let settings = self.config.settings_for(&partition.name)?;
        let default_exempt = self.config.is_default_exempt(&partition.name);
        let sweep = settings
            .inactivity_limit
            .map(|_| settings.inactivity_check)
            .filter(|_| !default_exempt);
        let mut state = PartitionState::new(partition.clone(), settings, default_exempt)?;
        for participant in host.participants(partition.id) {
            state.join(host.world_mut(), &participant, now);
            state.adopt_resting(host.world_mut(), &participant);
        }

        if let Some(period) = sweep {
            let key = TimerKey::new(
                partition.id,
                TimerOwner::Core,
                TimerScope::Partition,
                SWEEP_TIMER,
            );
            self.scheduler.arm(key, now, period, Some(period));
        }

        let mut slot = PartitionSlot {
            state,
            extensions: Vec::new(),
        };
        for registration in self.registry.iter() {
            slot.instantiate(&mut self.scheduler, host, registration, now);
        }
        info!(
            partition = %partition.name,
            default_exempt,
            extensions = slot.extensions.len(),
            "Partition loaded"
        );
        self.partitions.insert(partition.id, slot);
        self.transition(host, partition.id, now, |state, world| {
            state.recheck(world, now)
        });
        Ok(())
    }

    /// Unload a partition's extensions, cancel its timers and drop its
    /// state. Returns whether it was loaded.
    pub fn unload(&mut self, host: &mut dyn Host, partition: PartitionId, now: DateTime<Utc>) -> bool {
        let Some(mut slot) = self.partitions.remove(&partition) else {
            return false;
        };
        slot.teardown_all(&mut self.scheduler, host, now);
        self.scheduler.cancel_partition(partition);
        info!(partition = %slot.name(), "Partition unloaded");
        true
    }

    /// Unload everything, then load every partition the host has.
    pub fn reset(&mut self, host: &mut dyn Host, now: DateTime<Utc>) {
        let loaded: Vec<PartitionId> = self.partitions.keys().copied().collect();
        for partition in loaded {
            self.unload(host, partition, now);
        }
        for partition in host.partitions() {
            self.load_logged(host, &partition, now);
        }
        info!(partitions = self.partitions.len(), "Coordinator reset");
    }

    /// Unload every partition and drop every timer.
    pub fn shutdown(&mut self, host: &mut dyn Host, now: DateTime<Utc>) {
        let loaded: Vec<PartitionId> = self.partitions.keys().copied().collect();
        for partition in loaded {
            self.unload(host, partition, now);
        }
        self.scheduler.clear();
        info!("Coordinator shut down");
    }

    fn load_logged(&mut self, host: &mut dyn Host, partition: &Partition, now: DateTime<Utc>) {
        match self.load(host, partition, now) {
            Ok(()) => {}
            Err(CoordinatorError::Excluded { partition }) => {
                debug!(partition = %partition, "Partition excluded");
            }
            Err(e) => warn!(partition = %partition.name, error = %e, "Partition not loaded"),
        }
    }

    // -----------------------------------------------------------------------
    // Extension lifecycle
    // -----------------------------------------------------------------------

    /// Register an extension type and instantiate it for every loaded
    /// partition that enables `section`.
    pub fn register(
        &mut self,
        host: &mut dyn Host,
        owner: &str,
        section: &str,
        factory: ExtensionFactory,
        now: DateTime<Utc>,
    ) -> RegistrationId {
        let id = self.registry.register(owner, section, factory);
        let Some(registration) = self.registry.get(id) else {
            return id;
        };
        let mut instances = 0_usize;
        for slot in self.partitions.values_mut() {
            if slot.instantiate(&mut self.scheduler, host, registration, now) {
                instances = instances.saturating_add(1);
            }
        }
        info!(owner, section, registration = %id, instances, "Extension registered");
        id
    }

    /// Remove every registration of `owner` and unload their instances.
    /// Returns the number of instances unloaded.
    pub fn deregister(&mut self, host: &mut dyn Host, owner: &str, now: DateTime<Utc>) -> usize {
        let removed = self.registry.remove_owner(owner);
        let mut unloaded = 0_usize;
        for slot in self.partitions.values_mut() {
            let (gone, kept): (Vec<LiveExtension>, Vec<LiveExtension>) =
                std::mem::take(&mut slot.extensions)
                    .into_iter()
                    .partition(|live| removed.contains(&live.registration));
            slot.extensions = kept;
            for live in gone {
                slot.teardown(live, &mut self.scheduler, host, now);
                unloaded = unloaded.saturating_add(1);
            }
        }
        for id in &removed {
            self.scheduler.cancel_owner(TimerOwner::Extension(*id));
        }
        info!(owner, registrations = removed.len(), unloaded, "Extension owner deregistered");
        unloaded
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Handle one host event to completion.
    ///
    /// Events for partitions without state are ignored. Excluded partitions
    /// are skipped on load.
    pub fn handle(
        &mut self,
        host: &mut dyn Host,
        event: HostEvent,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        debug!(event = event.label(), "Host event");
        match event {
            HostEvent::PartitionLoaded(partition) => match self.load(host, &partition, now) {
                Err(CoordinatorError::Excluded { partition }) => {
                    debug!(partition = %partition, "Partition excluded");
                    Ok(())
                }
                other => other,
            },
            HostEvent::PartitionUnloaded(partition) => {
                self.unload(host, partition, now);
                Ok(())
            }
            HostEvent::ParticipantJoined {
                partition,
                participant,
            } => {
                self.transition(host, partition, now, |state, world| {
                    state.join(world, &participant, now)
                });
                Ok(())
            }
            HostEvent::ParticipantLeft {
                partition,
                participant,
            } => {
                self.depart(host, partition, &participant, now);
                Ok(())
            }
            HostEvent::ParticipantChangedPartition {
                from,
                to,
                participant,
            } => {
                self.depart(host, from, &participant, now);
                self.transition(host, to, now, |state, world| {
                    state.join(world, &participant, now)
                });
                Ok(())
            }
            HostEvent::RestEntered {
                partition,
                participant,
            } => {
                self.transition(host, partition, now, |state, world| {
                    state.rest_enter(world, &participant, now)
                });
                Ok(())
            }
            HostEvent::RestExited {
                partition,
                participant,
            } => {
                self.transition(host, partition, now, |state, world| {
                    state.rest_exit(world, &participant, now)
                });
                Ok(())
            }
            HostEvent::Activity {
                partition,
                participant,
                kind,
            } => {
                self.transition(host, partition, now, |state, world| {
                    state.activity(world, &participant, &kind, now)
                });
                Ok(())
            }
            HostEvent::Disturbance {
                partition,
                location,
            } => {
                self.transition(host, partition, now, |state, world| {
                    disturb(state, world, location, now)
                });
                Ok(())
            }
            HostEvent::AwayChanged {
                partition,
                participant,
                away,
            } => {
                self.transition(host, partition, now, |_, _| Outcome {
                    events: vec![SleepEvent::AwayChanged { participant, away }],
                    ..Outcome::default()
                });
                self.transition(host, partition, now, |state, world| {
                    state.recheck(world, now)
                });
                Ok(())
            }
        }
    }

    /// Fire due timers. Returns how many fired.
    pub fn tick(&mut self, host: &mut dyn Host, now: DateTime<Utc>) -> usize {
        let due = self.scheduler.pop_due(now);
        for key in &due {
            match key.owner {
                TimerOwner::Core if key.label == SWEEP_TIMER => {
                    self.transition(host, key.partition, now, |state, world| {
                        state.sweep_inactivity(world, now)
                    });
                }
                TimerOwner::Core => {
                    debug!(label = %key.label, "Unknown core timer");
                }
                TimerOwner::Extension(registration) => {
                    let Some(slot) = self.partitions.get_mut(&key.partition) else {
                        continue;
                    };
                    slot.fire_timer(&mut self.scheduler, host, key, registration, now);
                }
            }
        }
        due.len()
    }

    /// Earliest pending timer.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.scheduler.next_due()
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Current counts for a partition, optionally broadcast as a status
    /// notification.
    pub fn status(
        &mut self,
        host: &mut dyn Host,
        partition: PartitionId,
        broadcast: bool,
        now: DateTime<Utc>,
    ) -> Option<StatusReport> {
        let slot = self.partitions.get(&partition)?;
        let report = slot.state.evaluate(host.world(), now).report();
        if broadcast {
            let announcement = slot.state.status_announcement(host.world(), now);
            self.settle(
                host,
                partition,
                Outcome {
                    announcements: vec![announcement],
                    ..Outcome::default()
                },
                now,
            );
        }
        Some(report)
    }

    /// Advance the night on request. Someone must be resting.
    pub fn force(
        &mut self,
        host: &mut dyn Host,
        partition: PartitionId,
        requester: Option<Participant>,
        safe: bool,
        now: DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        let slot = self
            .partitions
            .get(&partition)
            .ok_or(CoordinatorError::NotLoaded { partition })?;
        if slot.state.resting().is_empty() {
            return Err(CoordinatorError::NobodyResting {
                partition: slot.name().to_owned(),
            });
        }
        self.settle(
            host,
            partition,
            Outcome {
                force: Some(ForceRequest { requester, safe }),
                ..Outcome::default()
            },
            now,
        );
        Ok(())
    }

    /// Administratively set or clear a participant's exemption. Returns
    /// whether the flag changed.
    pub fn exempt(
        &mut self,
        host: &mut dyn Host,
        partition: PartitionId,
        participant: ParticipantId,
        exempt: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, CoordinatorError> {
        let slot = self
            .partitions
            .get_mut(&partition)
            .ok_or(CoordinatorError::NotLoaded { partition })?;
        let transition = Transition::Exempt {
            participant,
            exempt,
        };
        if slot.review(&mut self.scheduler, host, &transition, now) == Verdict::Veto {
            return Ok(false);
        }
        let changed = slot
            .state
            .set_exempt(host.world_mut(), participant, exempt, ExemptReason::Admin);
        if changed {
            self.transition(host, partition, now, |state, world| {
                state.recheck(world, now)
            });
        }
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn transition(
        &mut self,
        host: &mut dyn Host,
        partition: PartitionId,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut PartitionState, &mut dyn WorldHost) -> Outcome,
    ) {
        let Some(slot) = self.partitions.get_mut(&partition) else {
            debug!(partition = %partition, "Event for untracked partition");
            return;
        };
        let outcome = apply(&mut slot.state, host.world_mut());
        self.settle(host, partition, outcome, now);
    }

    fn depart(
        &mut self,
        host: &mut dyn Host,
        partition: PartitionId,
        participant: &Participant,
        now: DateTime<Utc>,
    ) {
        self.scheduler.cancel_participant(partition, participant.id);
        self.transition(host, partition, now, |state, world| {
            state.leave(world, participant, now)
        });
    }

    fn settle(
        &mut self,
        host: &mut dyn Host,
        partition: PartitionId,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) {
        if outcome.is_empty() {
            return;
        }
        let Some(slot) = self.partitions.get_mut(&partition) else {
            return;
        };
        let settled = slot.settle(&mut self.scheduler, host, outcome, now);
        if settled.awakened && !slot.state.is_default_exempt() {
            for other in self.partitions.values_mut() {
                if other.state.is_default_exempt() {
                    other.state.clear_automatic(host.world_mut());
                }
            }
        }
    }
}

/// Wake every resting participant within the partition's disturbance radius
/// of `location`.
fn disturb(
    state: &mut PartitionState,
    world: &mut dyn WorldHost,
    location: Position,
    now: DateTime<Utc>,
) -> Outcome {
    let radius = state.settings().disturbance_radius;
    let reach = radius * radius;
    let affected: Vec<Participant> = world
        .participants(state.id())
        .into_iter()
        .filter(|p| state.is_resting(p.id))
        .filter(|p| {
            world
                .position(p.id)
                .is_some_and(|at| at.distance_squared(&location) <= reach)
        })
        .collect();
    let mut outcome = Outcome::default();
    for participant in &affected {
        outcome.merge(state.disturbed(&*world, participant, now));
    }
    outcome
}
