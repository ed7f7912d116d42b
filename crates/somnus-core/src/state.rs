//! The per-partition rest-cycle state machine.
//!
//! A [`PartitionState`] tracks who is resting, who was ejected by a
//! disturbance, who is exempt and why, when everyone was last active, and
//! whether a forced advance is cascading. Each transition mutates that
//! bookkeeping (and, through [`WorldHost`], the participants' rest-ignored
//! flags) and returns an [`Outcome`]: announcements to throttle and deliver,
//! events for extensions, and at most one forced-advance request.
//!
//! Transitions never call extensions. The coordinator reviews a requested
//! forced advance with the partition's extensions and only then calls
//! [`PartitionState::force_advance`].
//!
//! # Posture flag guards
//!
//! [`PartitionState::set_exempt`] is a silent no-op, checked in this order,
//! when the participant already holds the target flag, is not connected, or
//! (when exempting) is resting.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use somnus_types::{
    ExemptReason, NotificationKind, Participant, ParticipantId, Partition, PartitionId,
};
use tracing::debug;

use crate::clock::ClockError;
use crate::config::PartitionSettings;
use crate::eligibility::{self, Eligibility, Roster};
use crate::host::{EXEMPT_PERMISSION, INSTANT_PERMISSION, NOTIFY_PERMISSION, WorldHost};
use crate::notification::{Announcement, Delivery, Notifier};

/// Errors raised by partition state operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The partition descriptor is unusable.
    #[error("invalid partition: {reason}")]
    InvalidPartition {
        /// What is wrong with it.
        reason: String,
    },

    /// A clock computation failed.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },
}

/// Share of eligible participants that rested through a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Participation {
    /// Participants resting.
    pub resting: u32,
    /// Participants eligible.
    pub possible: u32,
}

impl Participation {
    /// `resting / possible`, capped at 1. Zero when nobody is eligible.
    pub fn factor(&self) -> f64 {
        if self.possible == 0 {
            return 0.0;
        }
        (f64::from(self.resting) / f64::from(self.possible)).min(1.0)
    }
}

impl From<&Eligibility> for Participation {
    fn from(result: &Eligibility) -> Self {
        Self {
            resting: result.resting_count(),
            possible: result.possible_count(),
        }
    }
}

/// Snapshot taken when a forced advance starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRecord {
    /// When the advance was forced.
    pub started: DateTime<Utc>,
    /// Who was resting at that moment.
    pub resting: BTreeSet<ParticipantId>,
    /// Participation at that moment.
    pub participation: Participation,
}

/// A request to advance the partition's night.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForceRequest {
    /// Who asked, `None` when the threshold triggered it.
    pub requester: Option<Participant>,
    /// Jump the clock directly instead of cascading exemptions.
    pub safe: bool,
}

impl ForceRequest {
    /// A threshold-triggered, cascading advance.
    pub const fn threshold() -> Self {
        Self {
            requester: None,
            safe: false,
        }
    }
}

/// Something that happened in a partition, reported to extensions.
#[derive(Debug, Clone, PartialEq)]
pub enum SleepEvent {
    /// A participant joined the partition.
    Joined(Participant),
    /// A participant left the partition.
    Left(Participant),
    /// A participant started resting.
    RestEntered(Participant),
    /// A participant stopped resting.
    RestExited(Participant),
    /// A resting participant was woken by a disturbance.
    Disturbed(Participant),
    /// A forced advance was applied.
    ForcedAdvance {
        /// Who asked for it.
        requester: Option<Participant>,
        /// Whether the clock was set directly.
        safe: bool,
    },
    /// The cycle ended; automatic exemptions were cleared.
    Awakened,
    /// A participant rested through to morning.
    RestCompleted {
        /// Who completed the rest.
        participant: Participant,
        /// How many were resting out of how many eligible.
        participation: Participation,
    },
    /// An idle integration changed a participant's away state.
    AwayChanged {
        /// Who changed.
        participant: Participant,
        /// New away state.
        away: bool,
    },
}

/// A transition extensions may veto before it is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A forced advance is about to be applied.
    ForcedAdvance(ForceRequest),
    /// An administrative exemption change is about to be applied.
    Exempt {
        /// Target participant.
        participant: ParticipantId,
        /// Requested flag value.
        exempt: bool,
    },
}

/// An extension's answer to a reviewed transition or a pending
/// announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verdict {
    /// Let it through.
    #[default]
    Accept,
    /// Stop it.
    Veto,
}

/// What a transition produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Notifications waiting to be filtered and throttled.
    pub announcements: Vec<Announcement>,
    /// Events for extensions, in order.
    pub events: Vec<SleepEvent>,
    /// A forced advance the transition asks for.
    pub force: Option<ForceRequest>,
}

impl Outcome {
    /// Append another outcome. The first force request wins.
    pub fn merge(&mut self, other: Self) {
        self.announcements.extend(other.announcements);
        self.events.extend(other.events);
        if self.force.is_none() {
            self.force = other.force;
        }
    }

    /// Whether nothing happened.
    pub fn is_empty(&self) -> bool {
        self.announcements.is_empty() && self.events.is_empty() && self.force.is_none()
    }
}

/// Rest-cycle state for one loaded partition.
#[derive(Debug)]
pub struct PartitionState {
    partition: Partition,
    settings: PartitionSettings,
    default_exempt: bool,
    resting: BTreeSet<ParticipantId>,
    nightmared: BTreeSet<ParticipantId>,
    is_forcing: bool,
    last_activity: BTreeMap<ParticipantId, DateTime<Utc>>,
    exemptions: BTreeMap<ParticipantId, ExemptReason>,
    notifier: Notifier,
    cycle: Option<CycleRecord>,
}

impl PartitionState {
    /// Create state for a partition with resolved settings.
    ///
    /// `default_exempt` marks the partition whose occupants are always
    /// exempt.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidPartition`] if the partition has no
    /// name.
    pub fn new(
        partition: Partition,
        settings: PartitionSettings,
        default_exempt: bool,
    ) -> Result<Self, StateError> {
        if partition.name.trim().is_empty() {
            return Err(StateError::InvalidPartition {
                reason: format!("partition {} has an empty name", partition.id),
            });
        }
        let notifier = Notifier::new(&settings.notifications);
        Ok(Self {
            partition,
            settings,
            default_exempt,
            resting: BTreeSet::new(),
            nightmared: BTreeSet::new(),
            is_forcing: false,
            last_activity: BTreeMap::new(),
            exemptions: BTreeMap::new(),
            notifier,
            cycle: None,
        })
    }

    /// The partition this state tracks.
    pub const fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Shorthand for the partition id.
    pub const fn id(&self) -> PartitionId {
        self.partition.id
    }

    /// Resolved settings.
    pub const fn settings(&self) -> &PartitionSettings {
        &self.settings
    }

    /// Whether this is the default-exempt partition.
    pub const fn is_default_exempt(&self) -> bool {
        self.default_exempt
    }

    /// Whether a forced advance is cascading.
    pub const fn is_forcing(&self) -> bool {
        self.is_forcing
    }

    /// Participants tracked as resting.
    pub const fn resting(&self) -> &BTreeSet<ParticipantId> {
        &self.resting
    }

    /// Whether a participant is tracked as resting.
    pub fn is_resting(&self, participant: ParticipantId) -> bool {
        self.resting.contains(&participant)
    }

    /// Whether a participant was ejected by a disturbance this cycle.
    pub fn was_disturbed(&self, participant: ParticipantId) -> bool {
        self.nightmared.contains(&participant)
    }

    /// Last observed activity.
    pub fn last_activity(&self, participant: ParticipantId) -> Option<DateTime<Utc>> {
        self.last_activity.get(&participant).copied()
    }

    /// Recorded exemption reason.
    pub fn exemption(&self, participant: ParticipantId) -> Option<ExemptReason> {
        self.exemptions.get(&participant).copied()
    }

    /// Snapshot of the running forced cycle.
    pub const fn cycle(&self) -> Option<&CycleRecord> {
        self.cycle.as_ref()
    }

    /// Whether any tracking map still mentions a participant.
    pub fn tracks(&self, participant: ParticipantId) -> bool {
        self.resting.contains(&participant)
            || self.nightmared.contains(&participant)
            || self.last_activity.contains_key(&participant)
            || self.exemptions.contains_key(&participant)
            || self.notifier.tracks(participant)
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Evaluate eligibility for the current membership.
    pub fn evaluate(&self, host: &dyn WorldHost, now: DateTime<Utc>) -> Eligibility {
        let members = host.participants(self.partition.id);
        self.evaluate_members(host, &members, now)
    }

    fn evaluate_members(
        &self,
        host: &dyn WorldHost,
        members: &[Participant],
        now: DateTime<Utc>,
    ) -> Eligibility {
        let granted: BTreeSet<ParticipantId> = members
            .iter()
            .filter(|m| host.has_permission(m.id, EXEMPT_PERMISSION))
            .map(|m| m.id)
            .collect();
        let excluded: BTreeSet<ParticipantId> = members
            .iter()
            .filter(|m| {
                self.default_exempt
                    || self
                        .recorded_reason(host, m.id)
                        .is_some_and(ExemptReason::excludes_from_count)
            })
            .map(|m| m.id)
            .collect();
        let roster = Roster {
            members,
            resting: &self.resting,
            always_exempt: &self.settings.always_exempt,
            granted: &granted,
            excluded: &excluded,
            last_activity: &self.last_activity,
            inactivity_limit: self.settings.inactivity_limit,
            thresholds: self.settings.thresholds,
        };
        eligibility::evaluate(&roster, now)
    }

    /// The recorded reason, or `Admin` for a flag someone else set.
    fn recorded_reason(&self, host: &dyn WorldHost, participant: ParticipantId) -> Option<ExemptReason> {
        self.exemptions.get(&participant).copied().or_else(|| {
            host.is_rest_ignored(participant)
                .then_some(ExemptReason::Admin)
        })
    }

    fn announcement(
        &self,
        kind: NotificationKind,
        subject: Option<&Participant>,
        delivery: Delivery,
        result: &Eligibility,
    ) -> Announcement {
        Announcement::new(kind, subject.cloned(), delivery).with_counts(
            result.needed,
            result.resting_count(),
            result.possible_count(),
        )
    }

    fn broadcast(&self) -> Delivery {
        Delivery::Partition(self.partition.id)
    }

    /// Status announcement with current counts.
    pub fn status_announcement(&self, host: &dyn WorldHost, now: DateTime<Utc>) -> Announcement {
        let result = self.evaluate(host, now);
        self.announcement(NotificationKind::Status, None, self.broadcast(), &result)
    }

    /// Gate and render an announcement through this partition's rules.
    pub fn notify(&mut self, announcement: &Announcement, now: DateTime<Utc>) -> Option<String> {
        self.notifier
            .generate(announcement, &self.partition.name, now)
    }

    // -----------------------------------------------------------------------
    // Posture flags
    // -----------------------------------------------------------------------

    /// Set or clear a participant's rest-ignored flag, recording `reason`.
    ///
    /// Returns whether the flag was written.
    pub fn set_exempt(
        &mut self,
        host: &mut dyn WorldHost,
        participant: ParticipantId,
        exempt: bool,
        reason: ExemptReason,
    ) -> bool {
        if host.is_rest_ignored(participant) == exempt {
            if exempt {
                // An explicit reason replaces an automatic one, never the reverse.
                let record = self
                    .exemptions
                    .get(&participant)
                    .is_none_or(|current| current.is_automatic() && !reason.is_automatic());
                if record {
                    self.exemptions.insert(participant, reason);
                }
            } else {
                self.exemptions.remove(&participant);
            }
            return false;
        }
        if !host.is_online(participant) {
            return false;
        }
        if exempt && (self.resting.contains(&participant) || host.is_resting(participant)) {
            return false;
        }

        host.set_rest_ignored(participant, exempt);
        if exempt {
            self.exemptions.insert(participant, reason);
        } else {
            self.exemptions.remove(&participant);
        }
        debug!(
            partition = %self.partition.name,
            participant = %participant,
            exempt,
            reason = ?reason,
            "Rest-ignored flag changed"
        );
        true
    }

    /// Clear an exemption only if it was recorded with `reason`.
    pub fn release(
        &mut self,
        host: &mut dyn WorldHost,
        participant: ParticipantId,
        reason: ExemptReason,
    ) -> bool {
        if self.exemptions.get(&participant) != Some(&reason) {
            return false;
        }
        self.set_exempt(host, participant, false, reason)
    }

    /// Exemption the partition always applies to a participant, if any.
    fn standing_reason(&self, host: &dyn WorldHost, participant: &Participant) -> Option<ExemptReason> {
        if self.settings.always_exempt.contains(&participant.name) {
            Some(ExemptReason::AlwaysExempt)
        } else if self.default_exempt {
            Some(ExemptReason::DefaultPartition)
        } else if host.has_permission(participant.id, EXEMPT_PERMISSION) {
            Some(ExemptReason::Permission)
        } else {
            None
        }
    }

    fn apply_standing(&mut self, host: &mut dyn WorldHost, participant: &Participant) -> bool {
        match self.standing_reason(host, participant) {
            Some(reason) => self.set_exempt(host, participant.id, true, reason),
            None => false,
        }
    }

    /// Clear every automatic exemption. Returns the number of flags
    /// written.
    pub fn clear_automatic(&mut self, host: &mut dyn WorldHost) -> usize {
        let automatic: Vec<(ParticipantId, ExemptReason)> = self
            .exemptions
            .iter()
            .filter(|(_, reason)| reason.is_automatic())
            .map(|(id, reason)| (*id, *reason))
            .collect();
        let mut cleared = 0_usize;
        for (participant, reason) in automatic {
            if self.set_exempt(host, participant, false, reason) {
                cleared = cleared.saturating_add(1);
            }
            self.exemptions.remove(&participant);
        }
        cleared
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// A participant entered the partition.
    ///
    /// Nothing carries over from another partition: a flag left by a
    /// previous partition is cleared and the standing exemptions of this
    /// one are applied.
    pub fn join(
        &mut self,
        host: &mut dyn WorldHost,
        participant: &Participant,
        now: DateTime<Utc>,
    ) -> Outcome {
        self.last_activity.insert(participant.id, now);
        self.exemptions.remove(&participant.id);
        if self.standing_reason(host, participant).is_none() {
            self.set_exempt(host, participant.id, false, ExemptReason::Admin);
        }
        self.apply_standing(host, participant);
        debug!(partition = %self.partition.name, participant = %participant.name, "Joined");
        Outcome {
            events: vec![SleepEvent::Joined(participant.clone())],
            ..Outcome::default()
        }
    }

    /// Count a participant the host already reports resting, without
    /// announcing it. Used when state is rebuilt mid-night.
    ///
    /// Returns whether the participant was added.
    pub fn adopt_resting(&mut self, host: &mut dyn WorldHost, participant: &Participant) -> bool {
        if !host.is_resting(participant.id) || !self.resting.insert(participant.id) {
            return false;
        }
        self.set_exempt(host, participant.id, false, ExemptReason::Admin);
        debug!(partition = %self.partition.name, participant = %participant.name, "Resting on load");
        true
    }

    /// Request a forced advance if someone rests and the threshold now
    /// holds. Call after anything that may have shrunk `possible`.
    pub fn recheck(&self, host: &dyn WorldHost, now: DateTime<Utc>) -> Outcome {
        if self.resting.is_empty() || self.is_forcing {
            return Outcome::default();
        }
        let result = self.evaluate(host, now);
        if !result.is_satisfied() {
            return Outcome::default();
        }
        debug!(
            partition = %self.partition.name,
            resting = result.resting_count(),
            possible = result.possible_count(),
            "Threshold met on re-evaluation"
        );
        Outcome {
            force: Some(ForceRequest::threshold()),
            ..Outcome::default()
        }
    }

    /// A participant did something of `kind`.
    pub fn activity(
        &mut self,
        host: &mut dyn WorldHost,
        participant: &Participant,
        kind: &str,
        now: DateTime<Utc>,
    ) -> Outcome {
        if !self.settings.monitored_activity.contains(kind) {
            return Outcome::default();
        }
        self.last_activity.insert(participant.id, now);

        if self.default_exempt
            || self.is_forcing
            || self.settings.always_exempt.contains(&participant.name)
        {
            return Outcome::default();
        }
        if let Some(reason) = self
            .exemptions
            .get(&participant.id)
            .copied()
            .filter(|reason| reason.is_automatic())
        {
            self.set_exempt(host, participant.id, false, reason);
        }
        Outcome::default()
    }

    /// A participant started resting.
    pub fn rest_enter(
        &mut self,
        host: &mut dyn WorldHost,
        participant: &Participant,
        now: DateTime<Utc>,
    ) -> Outcome {
        self.resting.insert(participant.id);
        self.last_activity.insert(participant.id, now);
        self.set_exempt(host, participant.id, false, ExemptReason::Admin);

        let mut outcome = Outcome {
            events: vec![SleepEvent::RestEntered(participant.clone())],
            ..Outcome::default()
        };

        if host.has_permission(participant.id, INSTANT_PERMISSION) {
            debug!(partition = %self.partition.name, participant = %participant.name, "Instant rest grant");
            outcome.force = Some(ForceRequest {
                requester: Some(participant.clone()),
                safe: false,
            });
            return outcome;
        }

        let result = self.evaluate(host, now);
        debug!(
            partition = %self.partition.name,
            participant = %participant.name,
            needed = result.needed,
            resting = result.resting_count(),
            possible = result.possible_count(),
            "Rest entered"
        );
        if result.is_satisfied() {
            outcome.force = Some(ForceRequest::threshold());
        } else {
            outcome.announcements.push(self.announcement(
                NotificationKind::RestEntered,
                Some(participant),
                self.broadcast(),
                &result,
            ));
        }
        outcome
    }

    /// A resting participant was woken by a disturbance.
    pub fn disturbed(
        &mut self,
        host: &dyn WorldHost,
        participant: &Participant,
        now: DateTime<Utc>,
    ) -> Outcome {
        if !self.resting.remove(&participant.id) {
            return Outcome::default();
        }
        self.nightmared.insert(participant.id);
        let result = self.evaluate(host, now);
        Outcome {
            announcements: vec![self.announcement(
                NotificationKind::Disturbed,
                Some(participant),
                self.broadcast(),
                &result,
            )],
            events: vec![SleepEvent::Disturbed(participant.clone())],
            force: None,
        }
    }

    /// A participant stopped resting.
    pub fn rest_exit(
        &mut self,
        host: &mut dyn WorldHost,
        participant: &Participant,
        now: DateTime<Utc>,
    ) -> Outcome {
        self.exit(host, participant, now, true)
    }

    fn exit(
        &mut self,
        host: &mut dyn WorldHost,
        participant: &Participant,
        now: DateTime<Utc>,
        staying: bool,
    ) -> Outcome {
        let was_resting = self.resting.contains(&participant.id);
        let was_disturbed = self.nightmared.contains(&participant.id);
        if !was_resting && !was_disturbed {
            return Outcome::default();
        }

        let participation = match &self.cycle {
            Some(cycle) => cycle.participation,
            None => Participation::from(&self.evaluate(&*host, now)),
        };
        self.resting.remove(&participant.id);
        self.nightmared.remove(&participant.id);
        self.last_activity.insert(participant.id, now);

        let is_day = host
            .partition_time(self.partition.id)
            .is_some_and(|time| self.settings.day_cycle.is_day(time));

        let mut outcome = Outcome::default();
        if is_day && was_resting && !was_disturbed {
            let result = self.evaluate(host, now);
            outcome.announcements.push(self.announcement(
                NotificationKind::RestLeft,
                Some(participant),
                self.broadcast(),
                &result,
            ));
            outcome.events.push(SleepEvent::RestCompleted {
                participant: participant.clone(),
                participation,
            });
        }
        outcome.events.push(SleepEvent::RestExited(participant.clone()));

        if staying {
            self.apply_standing(host, participant);
        }
        if self.resting.is_empty() {
            outcome.merge(self.awaken(host, now));
        }
        outcome
    }

    /// Advance the night.
    ///
    /// A safe advance moves the clock straight to the next morning and
    /// leaves flags alone. Otherwise every present, non-resting participant
    /// is exempted so the host's own rule completes the night. A request
    /// while an advance is already cascading is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Clock`] if the next morning overflows the
    /// partition clock.
    pub fn force_advance(
        &mut self,
        host: &mut dyn WorldHost,
        request: &ForceRequest,
        now: DateTime<Utc>,
    ) -> Result<Outcome, StateError> {
        if self.is_forcing {
            debug!(partition = %self.partition.name, "Forced advance already running");
            return Ok(Outcome::default());
        }

        let event = SleepEvent::ForcedAdvance {
            requester: request.requester.clone(),
            safe: request.safe,
        };

        if request.safe {
            let Some(time) = host.partition_time(self.partition.id) else {
                return Ok(Outcome::default());
            };
            let morning = self.settings.day_cycle.next_morning(time)?;
            host.set_partition_time(self.partition.id, morning);
            debug!(partition = %self.partition.name, from = time, to = morning, "Clock set to morning");
            return Ok(Outcome {
                events: vec![event],
                ..Outcome::default()
            });
        }

        let members = host.participants(self.partition.id);
        let result = self.evaluate_members(host, &members, now);
        self.is_forcing = true;
        self.cycle = Some(CycleRecord {
            started: now,
            resting: result.resting.clone(),
            participation: Participation::from(&result),
        });
        let mut exempted = 0_u32;
        for member in &members {
            if !self.resting.contains(&member.id)
                && self.set_exempt(host, member.id, true, ExemptReason::Forced)
            {
                exempted = exempted.saturating_add(1);
            }
        }
        debug!(
            partition = %self.partition.name,
            exempted,
            resting = result.resting_count(),
            "Forced advance cascading"
        );

        let mut announcement = self.announcement(
            NotificationKind::ForcedAdvance,
            request.requester.as_ref(),
            self.broadcast(),
            &result,
        );
        let mut announcements = Vec::with_capacity(2);
        if let Some(requester) = &request.requester {
            announcement = announcement.with_arg("requester", requester.name.clone());
            // Staff hear about advances someone asked for, wherever they are.
            let mut notice = announcement.clone();
            notice.subject = None;
            notice.delivery = Delivery::Permission(NOTIFY_PERMISSION.to_owned());
            announcements.push(announcement);
            announcements.push(notice);
        } else {
            announcements.push(announcement);
        }
        Ok(Outcome {
            announcements,
            events: vec![event],
            force: None,
        })
    }

    /// End the cycle: stop forcing and clear automatic exemptions.
    pub fn awaken(&mut self, host: &mut dyn WorldHost, _now: DateTime<Utc>) -> Outcome {
        self.is_forcing = false;
        self.cycle = None;
        let cleared = self.clear_automatic(host);
        debug!(partition = %self.partition.name, cleared, "Awakened");
        Outcome {
            events: vec![SleepEvent::Awakened],
            ..Outcome::default()
        }
    }

    /// A participant left the partition.
    ///
    /// Behaves like a rest exit, then drops the participant from every
    /// tracking map and re-evaluates the remaining membership.
    pub fn leave(
        &mut self,
        host: &mut dyn WorldHost,
        participant: &Participant,
        now: DateTime<Utc>,
    ) -> Outcome {
        let mut outcome = self.exit(host, participant, now, false);
        self.last_activity.remove(&participant.id);
        self.exemptions.remove(&participant.id);
        self.nightmared.remove(&participant.id);
        self.notifier.forget(participant.id);
        outcome.events.push(SleepEvent::Left(participant.clone()));

        if !self.resting.is_empty() && !self.is_forcing {
            let remaining: Vec<Participant> = host
                .participants(self.partition.id)
                .into_iter()
                .filter(|m| m.id != participant.id)
                .collect();
            if self.evaluate_members(host, &remaining, now).is_satisfied() {
                outcome.force = Some(ForceRequest::threshold());
            }
        }
        debug!(partition = %self.partition.name, participant = %participant.name, "Left");
        outcome
    }

    /// Exempt present, non-resting participants who have been inactive
    /// longer than the limit, then re-evaluate.
    pub fn sweep_inactivity(&mut self, host: &mut dyn WorldHost, now: DateTime<Utc>) -> Outcome {
        if self.settings.inactivity_limit.is_none() || self.default_exempt {
            return Outcome::default();
        }

        let members = host.participants(self.partition.id);
        let mut exempted = Vec::new();
        for member in &members {
            if self.resting.contains(&member.id)
                || self.exemptions.contains_key(&member.id)
                || host.is_rest_ignored(member.id)
            {
                continue;
            }
            let inactive = eligibility::is_inactive(
                self.last_activity.get(&member.id).copied(),
                self.settings.inactivity_limit,
                now,
            );
            if inactive && self.set_exempt(host, member.id, true, ExemptReason::Inactivity) {
                exempted.push(member.clone());
            }
        }

        let result = self.evaluate_members(host, &members, now);
        let mut outcome = Outcome::default();
        for member in &exempted {
            outcome.announcements.push(self.announcement(
                NotificationKind::InactiveExempted,
                Some(member),
                Delivery::Direct(member.id),
                &result,
            ));
        }
        if !self.resting.is_empty() && !self.is_forcing && result.is_satisfied() {
            outcome.force = Some(ForceRequest::threshold());
        }
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::eligibility::Thresholds;
    use crate::memory::InMemoryHost;

    const NIGHT: u64 = 13_000;
    const MORNING: u64 = 24_000;

    struct Fixture {
        host: InMemoryHost,
        state: PartitionState,
        members: Vec<Participant>,
    }

    fn fixture(n: usize, settings: PartitionSettings) -> Fixture {
        let mut host = InMemoryHost::new();
        let world = host.add_partition("world", NIGHT);
        let members: Vec<Participant> = (0..n)
            .map(|i| host.add_participant(world.id, &format!("p{i}")))
            .collect();
        let mut state = PartitionState::new(world, settings, false).unwrap();
        let now = Utc::now();
        for member in &members {
            state.join(&mut host, member, now);
        }
        Fixture {
            host,
            state,
            members,
        }
    }

    fn with_thresholds(count: Option<u32>, percent: Option<u32>) -> PartitionSettings {
        PartitionSettings {
            thresholds: Thresholds::new(count, percent),
            ..PartitionSettings::default()
        }
    }

    fn member(fx: &Fixture, i: usize) -> Participant {
        fx.members.get(i).cloned().unwrap()
    }

    fn rest(fx: &mut Fixture, i: usize) -> Outcome {
        let p = member(fx, i);
        fx.host.set_resting(p.id, true);
        fx.state.rest_enter(&mut fx.host, &p, Utc::now())
    }

    #[test]
    fn empty_partition_name_is_rejected() {
        let partition = Partition::new(PartitionId::new(), "  ");
        assert!(matches!(
            PartitionState::new(partition, PartitionSettings::default(), false),
            Err(StateError::InvalidPartition { .. })
        ));
    }

    #[test]
    fn count_threshold_requests_force_on_third_rest() {
        let mut fx = fixture(5, with_thresholds(Some(3), None));
        assert!(rest(&mut fx, 0).force.is_none());
        let second = rest(&mut fx, 1);
        assert!(second.force.is_none());
        assert_eq!(second.announcements.first().map(|a| a.needed), Some(1));
        assert_eq!(rest(&mut fx, 2).force, Some(ForceRequest::threshold()));
    }

    #[test]
    fn instant_grant_forces_alone() {
        let mut fx = fixture(4, with_thresholds(Some(3), None));
        let p = member(&fx, 0);
        fx.host.grant(p.id, INSTANT_PERMISSION);
        let outcome = rest(&mut fx, 0);
        assert_eq!(outcome.force.unwrap().requester, Some(p));
    }

    #[test]
    fn unsafe_force_cascades_once() {
        let mut fx = fixture(4, with_thresholds(Some(2), None));
        rest(&mut fx, 0);
        rest(&mut fx, 1);
        let now = Utc::now();
        let outcome = fx
            .state
            .force_advance(&mut fx.host, &ForceRequest::threshold(), now)
            .unwrap();
        assert!(fx.state.is_forcing());
        assert_eq!(outcome.announcements.len(), 1);
        assert!(fx.host.is_rest_ignored(member(&fx, 2).id));
        assert!(fx.host.is_rest_ignored(member(&fx, 3).id));
        assert!(!fx.host.is_rest_ignored(member(&fx, 0).id));
        assert_eq!(
            fx.state.cycle().map(|c| c.participation),
            Some(Participation {
                resting: 2,
                possible: 4
            })
        );

        let again = fx
            .state
            .force_advance(&mut fx.host, &ForceRequest::threshold(), now)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn safe_force_jumps_to_morning() {
        let mut fx = fixture(2, PartitionSettings::default());
        rest(&mut fx, 0);
        let request = ForceRequest {
            requester: None,
            safe: true,
        };
        let outcome = fx
            .state
            .force_advance(&mut fx.host, &request, Utc::now())
            .unwrap();
        assert!(outcome.announcements.is_empty());
        assert_eq!(fx.host.partition_time(fx.state.id()), Some(MORNING));
        assert!(!fx.state.is_forcing());
        assert!(!fx.host.is_rest_ignored(member(&fx, 1).id));
    }

    #[test]
    fn set_exempt_twice_writes_once() {
        let mut fx = fixture(2, PartitionSettings::default());
        let id = member(&fx, 0).id;
        let before = fx.host.flag_writes();
        assert!(fx.state.set_exempt(&mut fx.host, id, true, ExemptReason::Admin));
        assert!(!fx.state.set_exempt(&mut fx.host, id, true, ExemptReason::Admin));
        assert_eq!(fx.host.flag_writes(), before.saturating_add(1));
    }

    #[test]
    fn set_exempt_guards() {
        let mut fx = fixture(3, PartitionSettings::default());
        rest(&mut fx, 0);
        let resting = member(&fx, 0).id;
        assert!(!fx.state.set_exempt(&mut fx.host, resting, true, ExemptReason::Admin));

        let offline = member(&fx, 1).id;
        fx.host.disconnect(offline);
        assert!(!fx.state.set_exempt(&mut fx.host, offline, true, ExemptReason::Admin));
        assert!(!fx.host.is_rest_ignored(offline));
    }

    #[test]
    fn join_then_leave_restores_maps() {
        let mut fx = fixture(2, PartitionSettings::default());
        let now = Utc::now();
        let world = fx.state.id();
        let newcomer = fx.host.add_participant(world, "newcomer");
        fx.state.join(&mut fx.host, &newcomer, now);
        assert!(fx.state.tracks(newcomer.id));
        fx.host.disconnect(newcomer.id);
        fx.state.leave(&mut fx.host, &newcomer, now);
        assert!(!fx.state.tracks(newcomer.id));
    }

    #[test]
    fn leave_while_resting_forgets_cooldowns() {
        let mut settings = with_thresholds(Some(3), None);
        if let Some(rule) = settings.notifications.get_mut(&NotificationKind::RestEntered) {
            rule.max_frequency = Some(TimeDelta::seconds(60));
        }
        let mut fx = fixture(4, settings);
        let outcome = rest(&mut fx, 0);
        let p = member(&fx, 0);
        let now = Utc::now();
        for announcement in &outcome.announcements {
            fx.state.notify(announcement, now);
        }
        assert!(fx.state.tracks(p.id));
        fx.host.disconnect(p.id);
        fx.state.leave(&mut fx.host, &p, now);
        assert!(!fx.state.tracks(p.id));
    }

    #[test]
    fn leave_can_satisfy_threshold() {
        let mut fx = fixture(3, PartitionSettings::default());
        rest(&mut fx, 0);
        rest(&mut fx, 1);
        let p = member(&fx, 2);
        fx.host.disconnect(p.id);
        let outcome = fx.state.leave(&mut fx.host, &p, Utc::now());
        assert_eq!(outcome.force, Some(ForceRequest::threshold()));
    }

    #[test]
    fn activity_clears_only_automatic_exemptions() {
        let settings = PartitionSettings {
            always_exempt: ["p0".to_owned()].into_iter().collect(),
            ..PartitionSettings::default()
        };
        let mut fx = fixture(3, settings);
        let always = member(&fx, 0);
        let auto = member(&fx, 1);
        let admin = member(&fx, 2);
        assert_eq!(fx.state.exemption(always.id), Some(ExemptReason::AlwaysExempt));
        fx.state
            .set_exempt(&mut fx.host, auto.id, true, ExemptReason::Inactivity);
        fx.state
            .set_exempt(&mut fx.host, admin.id, true, ExemptReason::Admin);

        let now = Utc::now();
        for p in [&always, &auto, &admin] {
            fx.state.activity(&mut fx.host, p, "move", now);
        }
        assert!(fx.host.is_rest_ignored(always.id));
        assert!(!fx.host.is_rest_ignored(auto.id));
        assert!(fx.host.is_rest_ignored(admin.id));
    }

    #[test]
    fn unmonitored_activity_is_ignored() {
        let mut fx = fixture(1, PartitionSettings::default());
        let p = member(&fx, 0);
        let before = fx.state.last_activity(p.id);
        let later = Utc::now() + TimeDelta::seconds(60);
        fx.state.activity(&mut fx.host, &p, "blink", later);
        assert_eq!(fx.state.last_activity(p.id), before);
    }

    #[test]
    fn activity_does_not_clear_while_forcing() {
        let mut fx = fixture(3, with_thresholds(Some(1), None));
        rest(&mut fx, 0);
        fx.state
            .force_advance(&mut fx.host, &ForceRequest::threshold(), Utc::now())
            .unwrap();
        let p = member(&fx, 1);
        fx.state.activity(&mut fx.host, &p, "move", Utc::now());
        assert!(fx.host.is_rest_ignored(p.id));
    }

    #[test]
    fn awaken_keeps_always_exempt_and_clears_inactive() {
        let settings = PartitionSettings {
            always_exempt: ["p0".to_owned()].into_iter().collect(),
            inactivity_limit: Some(TimeDelta::seconds(300)),
            ..PartitionSettings::default()
        };
        let mut fx = fixture(2, settings);
        let later = Utc::now() + TimeDelta::seconds(600);
        fx.state.sweep_inactivity(&mut fx.host, later);
        let always = member(&fx, 0);
        let idle = member(&fx, 1);
        assert_eq!(fx.state.exemption(idle.id), Some(ExemptReason::Inactivity));

        assert!(fx.state.resting().is_empty());
        assert!(!fx.state.is_forcing());
        fx.state.awaken(&mut fx.host, later);
        assert!(fx.host.is_rest_ignored(always.id));
        assert!(!fx.host.is_rest_ignored(idle.id));
    }

    #[test]
    fn sweep_announces_directly_and_may_force() {
        let settings = PartitionSettings {
            inactivity_limit: Some(TimeDelta::seconds(300)),
            ..PartitionSettings::default()
        };
        let mut fx = fixture(3, settings);
        rest(&mut fx, 0);
        let later = Utc::now() + TimeDelta::seconds(600);
        let outcome = fx.state.sweep_inactivity(&mut fx.host, later);
        assert_eq!(outcome.announcements.len(), 2);
        assert!(
            outcome
                .announcements
                .iter()
                .all(|a| matches!(a.delivery, Delivery::Direct(_)))
        );
        assert_eq!(outcome.force, Some(ForceRequest::threshold()));
    }

    #[test]
    fn disturbance_suppresses_left_notification() {
        let mut fx = fixture(3, with_thresholds(Some(3), None));
        rest(&mut fx, 0);
        rest(&mut fx, 1);
        let p = member(&fx, 0);
        let now = Utc::now();
        let disturbed = fx.state.disturbed(&fx.host, &p, now);
        assert_eq!(disturbed.announcements.len(), 1);
        assert!(fx.state.was_disturbed(p.id));
        assert!(!fx.state.is_resting(p.id));

        fx.host.set_partition_time(fx.state.id(), MORNING);
        fx.host.set_resting(p.id, false);
        let exit = fx.state.rest_exit(&mut fx.host, &p, now);
        assert!(exit.announcements.is_empty());
        assert!(!fx.state.was_disturbed(p.id));
    }

    #[test]
    fn morning_exit_completes_rest_and_last_one_awakens() {
        let mut fx = fixture(2, with_thresholds(Some(1), None));
        rest(&mut fx, 0);
        fx.state
            .force_advance(&mut fx.host, &ForceRequest::threshold(), Utc::now())
            .unwrap();
        fx.host.set_partition_time(fx.state.id(), MORNING);

        let p = member(&fx, 0);
        fx.host.set_resting(p.id, false);
        let outcome = fx.state.rest_exit(&mut fx.host, &p, Utc::now());
        assert!(outcome.events.iter().any(|e| matches!(
            e,
            SleepEvent::RestCompleted { participation, .. } if participation.resting == 1
        )));
        assert!(outcome.events.contains(&SleepEvent::Awakened));
        assert!(!fx.state.is_forcing());
        assert!(!fx.host.is_rest_ignored(member(&fx, 1).id));
    }

    #[test]
    fn night_exit_is_not_a_completion() {
        let mut fx = fixture(2, with_thresholds(Some(2), None));
        rest(&mut fx, 0);
        let p = member(&fx, 0);
        fx.host.set_resting(p.id, false);
        let outcome = fx.state.rest_exit(&mut fx.host, &p, Utc::now());
        assert!(outcome.announcements.is_empty());
        assert!(
            !outcome
                .events
                .iter()
                .any(|e| matches!(e, SleepEvent::RestCompleted { .. }))
        );
    }

    #[test]
    fn join_clears_flag_from_previous_partition() {
        let mut fx = fixture(1, PartitionSettings::default());
        let world = fx.state.id();
        let traveller = fx.host.add_participant(world, "traveller");
        fx.host.set_rest_ignored(traveller.id, true);
        fx.state.join(&mut fx.host, &traveller, Utc::now());
        assert!(!fx.host.is_rest_ignored(traveller.id));
    }

    #[test]
    fn default_exempt_partition_exempts_everyone() {
        let mut host = InMemoryHost::new();
        let lobby = host.add_partition("lobby", NIGHT);
        let p = host.add_participant(lobby.id, "p");
        let mut state = PartitionState::new(lobby, PartitionSettings::default(), true).unwrap();
        state.join(&mut host, &p, Utc::now());
        assert_eq!(state.exemption(p.id), Some(ExemptReason::DefaultPartition));
        assert_eq!(state.evaluate(&host, Utc::now()).possible_count(), 0);
    }

    #[test]
    fn participation_factor_is_capped() {
        let full = Participation {
            resting: 5,
            possible: 4,
        };
        assert!((full.factor() - 1.0).abs() < f64::EPSILON);
        assert!(Participation::default().factor().abs() < f64::EPSILON);
    }

    #[test]
    fn adopted_resters_count_without_announcing() {
        let mut fx = fixture(4, with_thresholds(Some(3), None));
        let p = member(&fx, 0);
        assert!(!fx.state.adopt_resting(&mut fx.host, &p));
        fx.host.set_resting(p.id, true);
        assert!(fx.state.adopt_resting(&mut fx.host, &p));
        assert!(!fx.state.adopt_resting(&mut fx.host, &p));
        assert!(fx.state.is_resting(p.id));
        assert_eq!(fx.state.evaluate(&fx.host, Utc::now()).needed, 2);
    }

    #[test]
    fn recheck_forces_once_possible_shrinks() {
        let mut fx = fixture(3, with_thresholds(None, Some(100)));
        let now = Utc::now();
        assert!(fx.state.recheck(&fx.host, now).is_empty());
        rest(&mut fx, 0);
        rest(&mut fx, 1);
        assert!(fx.state.recheck(&fx.host, now).is_empty());

        let third = member(&fx, 2);
        fx.state
            .set_exempt(&mut fx.host, third.id, true, ExemptReason::Admin);
        assert_eq!(
            fx.state.recheck(&fx.host, now).force,
            Some(ForceRequest::threshold())
        );
    }

    #[test]
    fn requested_force_also_notifies_staff() {
        let mut fx = fixture(3, with_thresholds(Some(2), None));
        rest(&mut fx, 0);
        let request = ForceRequest {
            requester: Some(member(&fx, 0)),
            safe: false,
        };
        let outcome = fx
            .state
            .force_advance(&mut fx.host, &request, Utc::now())
            .unwrap();
        let deliveries: Vec<&Delivery> =
            outcome.announcements.iter().map(|a| &a.delivery).collect();
        assert_eq!(
            deliveries,
            vec![
                &Delivery::Partition(fx.state.id()),
                &Delivery::Permission(NOTIFY_PERMISSION.to_owned()),
            ]
        );
        assert!(outcome.announcements.iter().all(|a| {
            a.extra.get("requester").map(String::as_str) == Some("p0")
        }));
    }
}
