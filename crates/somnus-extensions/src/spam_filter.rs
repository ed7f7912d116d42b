//! Bed-spam filter: a participant who keeps lying down and getting up only
//! gets one announcement per cooldown window.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use somnus_core::config::ConfigError;
use somnus_core::extension::{Extension, ExtensionContext, ExtensionError, ExtensionFactory};
use somnus_core::notification::Announcement;
use somnus_core::state::{SleepEvent, Verdict};
use somnus_types::{NotificationKind, ParticipantId};
use tracing::debug;

/// Config section that enables the extension.
pub const SECTION: &str = "spam_filter";

/// Parameters of the `spam_filter` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SpamFilterConfig {
    /// Seconds a participant's rest announcements stay muted after one is
    /// let through.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u32,
}

impl Default for SpamFilterConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

const fn default_cooldown_seconds() -> u32 {
    30
}

/// Per-partition spam filter.
#[derive(Debug)]
pub struct SpamFilter {
    cooldown: TimeDelta,
    last: BTreeMap<(ParticipantId, NotificationKind), DateTime<Utc>>,
}

impl SpamFilter {
    /// Create from parsed parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the cooldown is zero.
    pub fn new(config: SpamFilterConfig) -> Result<Self, ConfigError> {
        if config.cooldown_seconds == 0 {
            return Err(ConfigError::Invalid {
                reason: "spam_filter cooldown_seconds must be positive".to_owned(),
            });
        }
        Ok(Self {
            cooldown: TimeDelta::seconds(i64::from(config.cooldown_seconds)),
            last: BTreeMap::new(),
        })
    }

    /// Let the announcement through, or mute it if the same subject had one
    /// of the same kind within the cooldown.
    pub fn admit(&mut self, announcement: &Announcement, now: DateTime<Utc>) -> Verdict {
        if !matches!(
            announcement.kind,
            NotificationKind::RestEntered | NotificationKind::RestLeft
        ) {
            return Verdict::Accept;
        }
        let Some(subject) = &announcement.subject else {
            return Verdict::Accept;
        };
        let key = (subject.id, announcement.kind);
        let muted = self
            .last
            .get(&key)
            .is_some_and(|previous| now.signed_duration_since(*previous) < self.cooldown);
        if muted {
            debug!(participant = %subject.name, kind = %announcement.kind, "Announcement muted");
            return Verdict::Veto;
        }
        self.last.insert(key, now);
        Verdict::Accept
    }

    /// Drop everything remembered about a participant.
    pub fn forget(&mut self, participant: ParticipantId) {
        self.last.retain(|(id, _), _| *id != participant);
    }
}

impl Extension for SpamFilter {
    fn filter(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        announcement: &mut Announcement,
    ) -> Result<Verdict, ExtensionError> {
        Ok(self.admit(announcement, ctx.now))
    }

    fn observe(
        &mut self,
        _ctx: &mut ExtensionContext<'_>,
        event: &SleepEvent,
    ) -> Result<(), ExtensionError> {
        if let SleepEvent::Left(participant) = event {
            self.forget(participant.id);
        }
        Ok(())
    }
}

/// Factory for the `spam_filter` section.
pub fn factory() -> ExtensionFactory {
    Box::new(|setup| {
        let config: SpamFilterConfig = setup.section.decode()?;
        Ok(Box::new(SpamFilter::new(config)?) as Box<dyn Extension>)
    })
}
