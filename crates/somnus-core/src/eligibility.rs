//! Eligibility evaluation: who counts toward a rest cycle and how many more
//! resting participants are needed.
//!
//! Everything here is a pure function of its inputs. The partition state
//! gathers the roster (membership from the host plus its own tracking maps)
//! and calls [`evaluate`] whenever it needs a decision.
//!
//! # Rules
//!
//! - `exempt(p)`: name on the always-exempt list, holder of the exemption
//!   grant, or exempted for a reason that removes them from the count.
//! - `inactive(p)`: an inactivity limit is configured and `p` has either
//!   never been observed or was last active longer ago than the limit.
//! - `possible`: members minus the exempt and inactive ones; resting
//!   participants always stay possible.
//! - `needed`: binding threshold minus resting, floored at zero, except
//!   that nobody resting always needs at least one.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeDelta, Utc};
use somnus_types::{Participant, ParticipantId, StatusReport};

/// Force thresholds for one partition.
///
/// `None` disables a threshold. When both are set the higher requirement
/// binds. When neither is set every eligible participant must rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Thresholds {
    /// Absolute number of resting participants.
    pub count: Option<u32>,
    /// Percentage (0-100) of eligible participants.
    pub percent: Option<u32>,
}

impl Thresholds {
    /// Create thresholds from optional count and percentage.
    pub const fn new(count: Option<u32>, percent: Option<u32>) -> Self {
        Self { count, percent }
    }

    /// Resting participants required by the percentage threshold alone:
    /// `ceil(percent / 100 * possible)`.
    pub fn by_percent(percent: u32, possible: u32) -> u32 {
        let scaled = u64::from(percent)
            .saturating_mul(u64::from(possible))
            .div_ceil(100);
        u32::try_from(scaled).unwrap_or(u32::MAX)
    }

    /// The binding requirement for a partition with `possible` eligible
    /// participants.
    pub fn binding(&self, possible: u32) -> u32 {
        match (self.count, self.percent) {
            (None, None) => possible,
            (Some(count), None) => count,
            (None, Some(percent)) => Self::by_percent(percent, possible),
            (Some(count), Some(percent)) => count.max(Self::by_percent(percent, possible)),
        }
    }
}

/// Additional resting participants needed before the cycle advances.
///
/// A partition where nobody rests always needs at least one, even when the
/// binding threshold is zero.
pub fn needed(thresholds: &Thresholds, possible: u32, resting: u32) -> u32 {
    let remaining = thresholds.binding(possible).saturating_sub(resting);
    if resting == 0 && remaining == 0 {
        1
    } else {
        remaining
    }
}

/// Integer percentage of `part` in `whole`; `0` when `whole` is zero.
pub fn percent_of(part: u32, whole: u32) -> u32 {
    if whole == 0 {
        return 0;
    }
    let scaled = u64::from(part)
        .saturating_mul(100)
        .checked_div(u64::from(whole))
        .unwrap_or(0);
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

/// Whether a participant counts as inactive.
///
/// With no limit nobody is inactive. With a limit, a participant never
/// observed is always inactive.
pub fn is_inactive(
    last_activity: Option<DateTime<Utc>>,
    limit: Option<TimeDelta>,
    now: DateTime<Utc>,
) -> bool {
    let Some(limit) = limit else {
        return false;
    };
    last_activity.is_none_or(|last| now.signed_duration_since(last) > limit)
}

/// Inputs to an eligibility evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Roster<'a> {
    /// Current partition membership.
    pub members: &'a [Participant],
    /// Participants tracked as resting.
    pub resting: &'a BTreeSet<ParticipantId>,
    /// Names exempt regardless of activity.
    pub always_exempt: &'a BTreeSet<String>,
    /// Members holding the exemption grant.
    pub granted: &'a BTreeSet<ParticipantId>,
    /// Members exempted for a reason that removes them from the count.
    pub excluded: &'a BTreeSet<ParticipantId>,
    /// Last observed activity per participant.
    pub last_activity: &'a BTreeMap<ParticipantId, DateTime<Utc>>,
    /// Inactivity limit, `None` when disabled.
    pub inactivity_limit: Option<TimeDelta>,
    /// Force thresholds.
    pub thresholds: Thresholds,
}

/// Result of an eligibility evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Eligibility {
    /// Members currently resting.
    pub resting: BTreeSet<ParticipantId>,
    /// Members that are exempt.
    pub exempt: BTreeSet<ParticipantId>,
    /// Members that are inactive.
    pub inactive: BTreeSet<ParticipantId>,
    /// Members that count toward the threshold.
    pub possible: BTreeSet<ParticipantId>,
    /// Additional resting participants needed.
    pub needed: u32,
}

impl Eligibility {
    /// Number of resting members.
    pub fn resting_count(&self) -> u32 {
        count(&self.resting)
    }

    /// Number of eligible members.
    pub fn possible_count(&self) -> u32 {
        count(&self.possible)
    }

    /// Resting members as a percentage of eligible members.
    pub fn percent(&self) -> u32 {
        percent_of(self.resting_count(), self.possible_count())
    }

    /// Whether the binding threshold is met.
    pub const fn is_satisfied(&self) -> bool {
        self.needed == 0
    }

    /// Status reply for this evaluation.
    pub fn report(&self) -> StatusReport {
        StatusReport {
            needed: self.needed,
            resting: self.resting_count(),
            possible: self.possible_count(),
        }
    }
}

/// Evaluate a roster at `now`.
pub fn evaluate(roster: &Roster<'_>, now: DateTime<Utc>) -> Eligibility {
    let mut result = Eligibility::default();

    for member in roster.members {
        let id = member.id;
        if roster.resting.contains(&id) {
            result.resting.insert(id);
        }
        let exempt = roster.always_exempt.contains(&member.name)
            || roster.granted.contains(&id)
            || roster.excluded.contains(&id);
        if exempt {
            result.exempt.insert(id);
        }
        let inactive = is_inactive(
            roster.last_activity.get(&id).copied(),
            roster.inactivity_limit,
            now,
        );
        if inactive {
            result.inactive.insert(id);
        }
        if result.resting.contains(&id) || !(exempt || inactive) {
            result.possible.insert(id);
        }
    }

    result.needed = needed(
        &roster.thresholds,
        result.possible_count(),
        result.resting_count(),
    );
    result
}

fn count(set: &BTreeSet<ParticipantId>) -> u32 {
    u32::try_from(set.len()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        members: Vec<Participant>,
        resting: BTreeSet<ParticipantId>,
        always_exempt: BTreeSet<String>,
        granted: BTreeSet<ParticipantId>,
        excluded: BTreeSet<ParticipantId>,
        last_activity: BTreeMap<ParticipantId, DateTime<Utc>>,
    }

    impl Fixture {
        fn with_members(n: usize, now: DateTime<Utc>) -> Self {
            let members: Vec<Participant> = (0..n)
                .map(|i| Participant::new(ParticipantId::new(), format!("p{i}")))
                .collect();
            let last_activity = members.iter().map(|m| (m.id, now)).collect();
            Self {
                members,
                resting: BTreeSet::new(),
                always_exempt: BTreeSet::new(),
                granted: BTreeSet::new(),
                excluded: BTreeSet::new(),
                last_activity,
            }
        }

        fn rest(&mut self, n: usize) {
            for member in self.members.iter().take(n) {
                self.resting.insert(member.id);
            }
        }

        fn evaluate(
            &self,
            thresholds: Thresholds,
            limit: Option<TimeDelta>,
            now: DateTime<Utc>,
        ) -> Eligibility {
            let roster = Roster {
                members: &self.members,
                resting: &self.resting,
                always_exempt: &self.always_exempt,
                granted: &self.granted,
                excluded: &self.excluded,
                last_activity: &self.last_activity,
                inactivity_limit: limit,
                thresholds,
            };
            evaluate(&roster, now)
        }
    }

    #[test]
    fn count_threshold_reaches_zero_at_count() {
        let now = Utc::now();
        let mut fx = Fixture::with_members(5, now);
        let thresholds = Thresholds::new(Some(3), None);
        fx.rest(2);
        assert_eq!(fx.evaluate(thresholds, None, now).needed, 1);
        fx.rest(3);
        assert_eq!(fx.evaluate(thresholds, None, now).needed, 0);
    }

    #[test]
    fn percent_threshold_rounds_up() {
        let now = Utc::now();
        let mut fx = Fixture::with_members(6, now);
        let thresholds = Thresholds::new(None, Some(50));
        fx.rest(2);
        let result = fx.evaluate(thresholds, None, now);
        assert_eq!(result.possible_count(), 6);
        assert_eq!(result.needed, 1);
        fx.rest(3);
        assert_eq!(fx.evaluate(thresholds, None, now).needed, 0);
        assert_eq!(Thresholds::by_percent(50, 5), 3);
        assert_eq!(Thresholds::by_percent(1, 1), 1);
    }

    #[test]
    fn most_restrictive_threshold_binds() {
        let both = Thresholds::new(Some(2), Some(50));
        assert_eq!(both.binding(10), 5);
        assert_eq!(both.binding(2), 2);
    }

    #[test]
    fn no_threshold_requires_everyone_possible() {
        let now = Utc::now();
        let mut fx = Fixture::with_members(3, now);
        fx.rest(2);
        assert_eq!(fx.evaluate(Thresholds::default(), None, now).needed, 1);
        fx.rest(3);
        assert_eq!(fx.evaluate(Thresholds::default(), None, now).needed, 0);
    }

    #[test]
    fn nobody_resting_needs_at_least_one() {
        assert_eq!(needed(&Thresholds::new(Some(0), None), 4, 0), 1);
        assert_eq!(needed(&Thresholds::new(None, Some(50)), 0, 0), 1);
        assert_eq!(needed(&Thresholds::default(), 0, 0), 1);
        // One resting participant satisfies a zero threshold.
        assert_eq!(needed(&Thresholds::new(Some(0), None), 4, 1), 0);
    }

    #[test]
    fn zero_possible_percent_requirement_is_zero() {
        assert_eq!(Thresholds::by_percent(75, 0), 0);
        assert_eq!(Thresholds::new(Some(2), Some(75)).binding(0), 2);
    }

    #[test]
    fn percent_display_never_divides_by_zero() {
        assert_eq!(percent_of(0, 0), 0);
        assert_eq!(percent_of(3, 0), 0);
        assert_eq!(percent_of(1, 3), 33);
        assert_eq!(Eligibility::default().percent(), 0);
    }

    #[test]
    fn never_observed_is_inactive_regardless_of_now() {
        let limit = Some(TimeDelta::seconds(300));
        let now = Utc::now();
        assert!(is_inactive(None, limit, now));
        assert!(is_inactive(None, limit, now - TimeDelta::days(365)));
        assert!(!is_inactive(None, None, now));
    }

    #[test]
    fn inactivity_uses_strict_limit() {
        let limit = Some(TimeDelta::seconds(300));
        let now = Utc::now();
        assert!(!is_inactive(Some(now - TimeDelta::seconds(300)), limit, now));
        assert!(is_inactive(Some(now - TimeDelta::seconds(301)), limit, now));
    }

    #[test]
    fn exempt_and_inactive_members_are_not_possible() {
        let now = Utc::now();
        let mut fx = Fixture::with_members(5, now);
        let names: Vec<String> = fx.members.iter().map(|m| m.name.clone()).collect();
        let ids: Vec<ParticipantId> = fx.members.iter().map(|m| m.id).collect();
        fx.always_exempt.insert(names.first().cloned().unwrap_or_default());
        if let Some(id) = ids.get(1) {
            fx.granted.insert(*id);
        }
        if let Some(id) = ids.get(2) {
            fx.excluded.insert(*id);
        }
        if let Some(id) = ids.get(3) {
            fx.last_activity.insert(*id, now - TimeDelta::seconds(900));
        }

        let result = fx.evaluate(Thresholds::default(), Some(TimeDelta::seconds(300)), now);
        assert_eq!(result.exempt.len(), 3);
        assert_eq!(result.inactive.len(), 1);
        assert_eq!(result.possible_count(), 1);
        assert_eq!(result.needed, 1);
    }

    #[test]
    fn resting_exempt_member_stays_possible() {
        let now = Utc::now();
        let mut fx = Fixture::with_members(2, now);
        let first = fx.members.first().map(|m| m.name.clone()).unwrap_or_default();
        fx.always_exempt.insert(first);
        fx.rest(1);
        let result = fx.evaluate(Thresholds::default(), None, now);
        assert_eq!(result.possible_count(), 2);
        assert_eq!(result.needed, 1);
    }

    #[test]
    fn resting_outside_membership_is_ignored() {
        let now = Utc::now();
        let mut fx = Fixture::with_members(2, now);
        fx.resting.insert(ParticipantId::new());
        let result = fx.evaluate(Thresholds::new(Some(1), None), None, now);
        assert_eq!(result.resting_count(), 0);
        assert_eq!(result.needed, 1);
    }
}
