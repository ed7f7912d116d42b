//! Notification throttling and rendering.
//!
//! A state transition produces [`Announcement`]s. Before anything reaches the
//! courier, an announcement passes through extension filters (which may cancel
//! it or lower its displayed `needed`) and then through the partition's
//! [`Notifier`], which applies the per-kind rule: suppressed formats, a
//! per-subject cooldown, and an optional timestamp prefix.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use minijinja::Environment;
use serde_json::Value;
use somnus_types::{NotificationKind, Participant, ParticipantId, PartitionId};
use tracing::{debug, warn};

use crate::config::RuleSettings;
use crate::eligibility::percent_of;

/// Errors raised while rendering a template.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    /// The template failed to parse or evaluate.
    #[error("template error: {source}")]
    Render {
        /// The underlying template error.
        #[from]
        source: minijinja::Error,
    },
}

/// Where a rendered notification goes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Delivery {
    /// A single participant.
    Direct(ParticipantId),
    /// Everyone in a partition.
    Partition(PartitionId),
    /// Everyone holding a permission.
    Permission(String),
}

/// A notification waiting to be filtered, throttled, and delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Which rule applies.
    pub kind: NotificationKind,
    /// The participant the notification is about; also the cooldown key.
    pub subject: Option<Participant>,
    /// Delivery scope chosen by the call site.
    pub delivery: Delivery,
    /// Displayed number of additional resting participants needed.
    pub needed: u32,
    /// Resting participants at the time of the transition.
    pub resting: u32,
    /// Eligible participants at the time of the transition.
    pub possible: u32,
    /// Extra template arguments.
    pub extra: BTreeMap<String, String>,
}

impl Announcement {
    /// Create an announcement with no counts attached.
    pub const fn new(
        kind: NotificationKind,
        subject: Option<Participant>,
        delivery: Delivery,
    ) -> Self {
        Self {
            kind,
            subject,
            delivery,
            needed: 0,
            resting: 0,
            possible: 0,
            extra: BTreeMap::new(),
        }
    }

    /// Attach the counts of an eligibility evaluation.
    #[must_use]
    pub const fn with_counts(mut self, needed: u32, resting: u32, possible: u32) -> Self {
        self.needed = needed;
        self.resting = resting;
        self.possible = possible;
        self
    }

    /// Attach an extra template argument.
    #[must_use]
    pub fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extra.insert(key.to_owned(), value.into());
        self
    }

    /// Lower the displayed `needed`. Raising is ignored.
    pub fn lower_needed(&mut self, needed: u32) {
        self.needed = self.needed.min(needed);
    }

    /// Template arguments for this announcement.
    pub fn args(&self, partition: &str) -> BTreeMap<String, Value> {
        let mut args = BTreeMap::new();
        let name = self
            .subject
            .as_ref()
            .map_or_else(String::new, |p| p.name.clone());
        args.insert("name".to_owned(), Value::from(name));
        args.insert("partition".to_owned(), Value::from(partition));
        args.insert("needed".to_owned(), Value::from(self.needed));
        args.insert("resting".to_owned(), Value::from(self.resting));
        args.insert("possible".to_owned(), Value::from(self.possible));
        args.insert(
            "percent".to_owned(),
            Value::from(percent_of(self.resting, self.possible)),
        );
        for (key, value) in &self.extra {
            args.insert(key.clone(), Value::from(value.as_str()));
        }
        args
    }
}

/// Template renderer shared by notifications and reward commands.
#[derive(Debug, Default)]
pub struct Renderer {
    env: Environment<'static>,
}

impl Renderer {
    /// Create a renderer with the default environment.
    pub fn new() -> Self {
        Self {
            env: Environment::new(),
        }
    }

    /// Render `template` against `args`.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationError::Render`] if the template is malformed.
    pub fn render(
        &self,
        template: &str,
        args: &BTreeMap<String, Value>,
    ) -> Result<String, NotificationError> {
        Ok(self.env.render_str(template, args)?)
    }
}

/// A throttle rule and its cooldown bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRule {
    /// Resolved settings.
    pub settings: RuleSettings,
    /// Last delivery per subject (`None` keys partition-level sends).
    last_sent: BTreeMap<Option<ParticipantId>, DateTime<Utc>>,
}

impl NotificationRule {
    /// Create a rule with no delivery history.
    pub const fn new(settings: RuleSettings) -> Self {
        Self {
            settings,
            last_sent: BTreeMap::new(),
        }
    }

    /// Whether a notification for `subject` at `now` falls inside the
    /// cooldown window.
    fn is_cooling_down(&self, subject: Option<ParticipantId>, now: DateTime<Utc>) -> bool {
        let Some(window) = self.settings.max_frequency else {
            return false;
        };
        self.last_sent
            .get(&subject)
            .is_some_and(|last| now.signed_duration_since(*last) < window)
    }
}

/// Per-partition notification table.
#[derive(Debug)]
pub struct Notifier {
    rules: BTreeMap<NotificationKind, NotificationRule>,
    renderer: Renderer,
}

impl Notifier {
    /// Build the table from resolved rule settings.
    pub fn new(settings: &BTreeMap<NotificationKind, RuleSettings>) -> Self {
        Self {
            rules: settings
                .iter()
                .map(|(kind, rule)| (*kind, NotificationRule::new(rule.clone())))
                .collect(),
            renderer: Renderer::new(),
        }
    }

    /// The rule for a kind, if configured.
    pub fn rule(&self, kind: NotificationKind) -> Option<&NotificationRule> {
        self.rules.get(&kind)
    }

    /// Gate and render an announcement.
    ///
    /// Returns `None` when the rule is missing or suppressed, when the
    /// subject is inside the cooldown window, or when rendering fails.
    /// Otherwise records the send time and returns the text.
    pub fn generate(
        &mut self,
        announcement: &Announcement,
        partition: &str,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let rule = self.rules.get_mut(&announcement.kind)?;
        let template = rule.settings.format.as_deref()?;
        let subject = announcement.subject.as_ref().map(|p| p.id);

        if rule.is_cooling_down(subject, now) {
            debug!(
                kind = %announcement.kind,
                partition,
                "Notification suppressed by cooldown"
            );
            return None;
        }

        let rendered = match self.renderer.render(template, &announcement.args(partition)) {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = %announcement.kind, partition, error = %e, "Notification template failed");
                return None;
            }
        };

        rule.last_sent.insert(subject, now);
        if rule.settings.timestamp {
            Some(format!("[{}] {rendered}", now.format("%H:%M:%S")))
        } else {
            Some(rendered)
        }
    }

    /// Drop every cooldown entry for a participant.
    pub fn forget(&mut self, participant: ParticipantId) {
        for rule in self.rules.values_mut() {
            rule.last_sent.remove(&Some(participant));
        }
    }

    /// Whether any cooldown entry exists for a participant.
    pub fn tracks(&self, participant: ParticipantId) -> bool {
        self.rules
            .values()
            .any(|rule| rule.last_sent.contains_key(&Some(participant)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn rule(format: Option<&str>, max_frequency: Option<i64>, timestamp: bool) -> RuleSettings {
        RuleSettings {
            format: format.map(str::to_owned),
            max_frequency: max_frequency.map(TimeDelta::seconds),
            timestamp,
        }
    }

    fn notifier(kind: NotificationKind, settings: RuleSettings) -> Notifier {
        let mut rules = BTreeMap::new();
        rules.insert(kind, settings);
        Notifier::new(&rules)
    }

    fn entered(subject: &Participant) -> Announcement {
        Announcement::new(
            NotificationKind::RestEntered,
            Some(subject.clone()),
            Delivery::Partition(PartitionId::new()),
        )
        .with_counts(2, 1, 4)
    }

    #[test]
    fn cooldown_allows_one_delivery_per_window() {
        let mut n = notifier(
            NotificationKind::RestEntered,
            rule(Some("{{ name }}"), Some(10), false),
        );
        let alex = Participant::new(ParticipantId::new(), "Alex");
        let now = Utc::now();

        let delivered = [
            n.generate(&entered(&alex), "world", now),
            n.generate(&entered(&alex), "world", now + TimeDelta::seconds(5)),
        ];
        assert_eq!(delivered.iter().filter(|d| d.is_some()).count(), 1);

        let later = n.generate(&entered(&alex), "world", now + TimeDelta::seconds(10));
        assert!(later.is_some());
    }

    #[test]
    fn cooldown_is_per_subject() {
        let mut n = notifier(
            NotificationKind::RestEntered,
            rule(Some("{{ name }}"), Some(10), false),
        );
        let now = Utc::now();
        let a = Participant::new(ParticipantId::new(), "A");
        let b = Participant::new(ParticipantId::new(), "B");
        assert!(n.generate(&entered(&a), "world", now).is_some());
        assert!(n.generate(&entered(&b), "world", now).is_some());
    }

    #[test]
    fn unlimited_frequency_never_suppresses() {
        let mut n = notifier(
            NotificationKind::RestEntered,
            rule(Some("{{ name }}"), None, false),
        );
        let a = Participant::new(ParticipantId::new(), "A");
        let now = Utc::now();
        assert!(n.generate(&entered(&a), "world", now).is_some());
        assert!(n.generate(&entered(&a), "world", now).is_some());
    }

    #[test]
    fn missing_format_is_a_no_op() {
        let mut n = notifier(NotificationKind::RestEntered, rule(None, None, false));
        let a = Participant::new(ParticipantId::new(), "A");
        assert_eq!(n.generate(&entered(&a), "world", Utc::now()), None);
        assert!(!n.tracks(a.id));
    }

    #[test]
    fn renders_counts_and_names() {
        let mut n = notifier(
            NotificationKind::RestEntered,
            rule(
                Some("{{ name }} in {{ partition }}: {{ needed }} needed, {{ resting }}/{{ possible }} ({{ percent }}%)"),
                None,
                false,
            ),
        );
        let a = Participant::new(ParticipantId::new(), "Alex");
        let text = n.generate(&entered(&a), "world", Utc::now()).unwrap();
        assert_eq!(text, "Alex in world: 2 needed, 1/4 (25%)");
    }

    #[test]
    fn timestamp_flag_prefixes_time() {
        let mut n = notifier(
            NotificationKind::RestEntered,
            rule(Some("{{ name }}"), None, true),
        );
        let a = Participant::new(ParticipantId::new(), "A");
        let now = Utc::now();
        let text = n.generate(&entered(&a), "world", now).unwrap();
        assert_eq!(text, format!("[{}] A", now.format("%H:%M:%S")));
    }

    #[test]
    fn broken_template_is_dropped() {
        let mut n = notifier(
            NotificationKind::RestEntered,
            rule(Some("{{ name "), None, false),
        );
        let a = Participant::new(ParticipantId::new(), "A");
        assert_eq!(n.generate(&entered(&a), "world", Utc::now()), None);
    }

    #[test]
    fn forget_clears_cooldowns() {
        let mut n = notifier(
            NotificationKind::RestEntered,
            rule(Some("{{ name }}"), Some(60), false),
        );
        let a = Participant::new(ParticipantId::new(), "A");
        let now = Utc::now();
        assert!(n.generate(&entered(&a), "world", now).is_some());
        assert!(n.tracks(a.id));
        n.forget(a.id);
        assert!(!n.tracks(a.id));
        assert!(n.generate(&entered(&a), "world", now).is_some());
    }

    #[test]
    fn lower_needed_never_raises() {
        let a = Participant::new(ParticipantId::new(), "A");
        let mut announcement = entered(&a);
        announcement.lower_needed(5);
        assert_eq!(announcement.needed, 2);
        announcement.lower_needed(1);
        assert_eq!(announcement.needed, 1);
    }
}
