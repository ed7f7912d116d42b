//! Configuration loading and typed config structures for Somnus.
//!
//! The canonical configuration lives in `somnus-config.yaml`. This module
//! defines strongly-typed structs that mirror the YAML structure, provides a
//! loader, and resolves the per-partition override chain:
//!
//! 1. `partitions.<name>` (explicit partition section)
//! 2. `defaults` (global defaults)
//! 3. built-in defaults
//!
//! Thresholds and durations use `-1` in YAML to mean "disabled"; resolution
//! turns those sentinels into `Option`s and rejects anything else negative.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::TimeDelta;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use somnus_types::NotificationKind;

use crate::clock::DayCycle;
use crate::eligibility::Thresholds;

/// Errors that can occur when loading or resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is not acceptable.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

impl From<crate::clock::ClockError> for ConfigError {
    fn from(err: crate::clock::ClockError) -> Self {
        Self::Invalid {
            reason: err.to_string(),
        }
    }
}

/// Top-level Somnus configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SomnusConfig {
    /// Coordinator-wide settings.
    #[serde(default)]
    pub global: GlobalConfig,

    /// Shape of a partition day.
    #[serde(default)]
    pub day_cycle: DayCycleConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Defaults applied to every partition.
    #[serde(default)]
    pub defaults: PartitionOverrides,

    /// Per-partition overrides keyed by partition name.
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionOverrides>,
}

impl SomnusConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yml::from_str(yaml)?;
        Ok(config)
    }

    /// Whether the named partition is never tracked.
    pub fn is_excluded(&self, partition: &str) -> bool {
        self.global
            .excluded_partitions
            .iter()
            .any(|name| name == partition)
    }

    /// Whether the named partition is the default-exempt partition.
    pub fn is_default_exempt(&self, partition: &str) -> bool {
        self.global
            .default_exempt_partition
            .as_deref()
            .is_some_and(|name| name == partition)
    }

    /// Resolve the effective settings for a partition.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a merged value is malformed
    /// (negative threshold other than `-1`, percentage above 100, bad day
    /// cycle, negative radius).
    pub fn settings_for(&self, partition: &str) -> Result<PartitionSettings, ConfigError> {
        let explicit = self.partitions.get(partition);
        let merged = match explicit {
            Some(section) => section.layered_over(&self.defaults),
            None => self.defaults.clone(),
        };
        merged.resolve(self)
    }
}

/// Coordinator-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GlobalConfig {
    /// Partition whose occupants are always exempt (a waiting room).
    #[serde(default)]
    pub default_exempt_partition: Option<String>,

    /// Partitions that are never tracked.
    #[serde(default)]
    pub excluded_partitions: Vec<String>,

    /// Seconds between inactivity sweeps of each partition.
    #[serde(default = "default_inactivity_check_seconds")]
    pub inactivity_check_seconds: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_exempt_partition: None,
            excluded_partitions: Vec::new(),
            inactivity_check_seconds: default_inactivity_check_seconds(),
        }
    }
}

/// Day cycle offsets, in partition ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DayCycleConfig {
    /// Ticks in one full day.
    #[serde(default = "default_ticks_per_day")]
    pub ticks_per_day: u64,

    /// Length of the morning phase.
    #[serde(default = "default_morning_ticks")]
    pub morning_ticks: u64,

    /// Offset at which dusk begins.
    #[serde(default = "default_dusk_start")]
    pub dusk_start: u64,

    /// Offset at which resting becomes possible.
    #[serde(default = "default_night_start")]
    pub night_start: u64,

    /// Offset at which resting stops being possible.
    #[serde(default = "default_night_end")]
    pub night_end: u64,
}

impl Default for DayCycleConfig {
    fn default() -> Self {
        Self {
            ticks_per_day: default_ticks_per_day(),
            morning_ticks: default_morning_ticks(),
            dusk_start: default_dusk_start(),
            night_start: default_night_start(),
            night_end: default_night_end(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// One layer of partition settings. Absent fields fall through to the next
/// layer of the override chain.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PartitionOverrides {
    /// Seconds without activity before a participant counts as inactive
    /// (`-1` disables).
    #[serde(default)]
    pub inactivity_limit_seconds: Option<i64>,

    /// Participant names that are always exempt.
    #[serde(default)]
    pub always_exempt: Option<Vec<String>>,

    /// Absolute number of resting participants that forces an advance
    /// (`-1` disables).
    #[serde(default)]
    pub force_count: Option<i64>,

    /// Percentage of eligible participants that forces an advance
    /// (`-1` disables).
    #[serde(default)]
    pub force_percent: Option<i64>,

    /// Event kinds that count as activity.
    #[serde(default)]
    pub monitored_activity: Option<Vec<String>>,

    /// Radius around a disturbance within which resting participants are
    /// woken.
    #[serde(default)]
    pub disturbance_radius: Option<f64>,

    /// Notification rules keyed by kind.
    #[serde(default)]
    pub notifications: BTreeMap<NotificationKind, NotificationOverride>,

    /// Extension sections keyed by section name.
    #[serde(default)]
    pub extensions: BTreeMap<String, ExtensionSection>,
}

impl PartitionOverrides {
    /// Layer `self` on top of `base`: every field present in `self` wins.
    pub fn layered_over(&self, base: &Self) -> Self {
        let mut notifications = base.notifications.clone();
        for (kind, rule) in &self.notifications {
            let merged = notifications
                .get(kind)
                .map_or_else(|| rule.clone(), |below| rule.layered_over(below));
            notifications.insert(*kind, merged);
        }

        let mut extensions = base.extensions.clone();
        for (name, section) in &self.extensions {
            let merged = extensions
                .get(name)
                .map_or_else(|| section.clone(), |below| section.layered_over(below));
            extensions.insert(name.clone(), merged);
        }

        Self {
            inactivity_limit_seconds: self
                .inactivity_limit_seconds
                .or(base.inactivity_limit_seconds),
            always_exempt: self
                .always_exempt
                .clone()
                .or_else(|| base.always_exempt.clone()),
            force_count: self.force_count.or(base.force_count),
            force_percent: self.force_percent.or(base.force_percent),
            monitored_activity: self
                .monitored_activity
                .clone()
                .or_else(|| base.monitored_activity.clone()),
            disturbance_radius: self.disturbance_radius.or(base.disturbance_radius),
            notifications,
            extensions,
        }
    }

    /// Apply built-in defaults and validate.
    fn resolve(&self, config: &SomnusConfig) -> Result<PartitionSettings, ConfigError> {
        let inactivity_limit = sentinel(
            self.inactivity_limit_seconds.unwrap_or(-1),
            "inactivity_limit_seconds",
        )?
        .map(|secs| TimeDelta::seconds(i64::from(secs)));

        let force_count = sentinel(self.force_count.unwrap_or(-1), "force_count")?;
        let force_percent = sentinel(self.force_percent.unwrap_or(-1), "force_percent")?;
        if force_percent.is_some_and(|p| p > 100) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "force_percent must be between 0 and 100, got {}",
                    force_percent.unwrap_or_default()
                ),
            });
        }

        let disturbance_radius = self
            .disturbance_radius
            .unwrap_or_else(default_disturbance_radius);
        if !disturbance_radius.is_finite() || disturbance_radius < 0.0 {
            return Err(ConfigError::Invalid {
                reason: format!("disturbance_radius must be non-negative, got {disturbance_radius}"),
            });
        }

        let mut notifications = BTreeMap::new();
        for kind in NotificationKind::ALL {
            let layered = self.notifications.get(&kind).map_or_else(
                || builtin_rule(kind),
                |rule| rule.layered_over(&builtin_rule(kind)),
            );
            notifications.insert(kind, layered.resolve(kind)?);
        }

        let inactivity_check_secs = i64::try_from(config.global.inactivity_check_seconds.max(1))
            .map_err(|_err| ConfigError::Invalid {
                reason: "inactivity_check_seconds out of range".to_owned(),
            })?;

        Ok(PartitionSettings {
            inactivity_limit,
            always_exempt: self
                .always_exempt
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect(),
            thresholds: Thresholds {
                count: force_count,
                percent: force_percent,
            },
            monitored_activity: self
                .monitored_activity
                .clone()
                .unwrap_or_else(default_monitored_activity)
                .into_iter()
                .collect(),
            disturbance_radius,
            notifications,
            extensions: self.extensions.clone(),
            day_cycle: DayCycle::new(&config.day_cycle)?,
            inactivity_check: TimeDelta::seconds(inactivity_check_secs),
        })
    }
}

/// One notification rule layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NotificationOverride {
    /// Template; an empty string suppresses the notification.
    #[serde(default)]
    pub format: Option<String>,

    /// Minimum seconds between two notifications for the same subject
    /// (`-1` means unlimited).
    #[serde(default)]
    pub max_frequency: Option<i64>,

    /// Whether to prefix the rendered text with the send time.
    #[serde(default)]
    pub timestamp: Option<bool>,
}

impl NotificationOverride {
    fn layered_over(&self, base: &Self) -> Self {
        Self {
            format: self.format.clone().or_else(|| base.format.clone()),
            max_frequency: self.max_frequency.or(base.max_frequency),
            timestamp: self.timestamp.or(base.timestamp),
        }
    }

    fn resolve(&self, kind: NotificationKind) -> Result<RuleSettings, ConfigError> {
        let field = format!("notifications.{kind}.max_frequency");
        let max_frequency = sentinel(self.max_frequency.unwrap_or(-1), &field)?
            .map(|secs| TimeDelta::seconds(i64::from(secs)));
        Ok(RuleSettings {
            format: self.format.clone().filter(|f| !f.trim().is_empty()),
            max_frequency,
            timestamp: self.timestamp.unwrap_or(false),
        })
    }
}

/// An extension's config section.
///
/// `enabled` gates instantiation; every other key is handed to the
/// extension's factory untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExtensionSection {
    /// Whether the extension is active for the partition.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// Extension-specific parameters.
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yml::Value>,
}

impl ExtensionSection {
    /// Whether this section turns its extension on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    /// Layer `self` on top of `base`, key by key.
    pub fn layered_over(&self, base: &Self) -> Self {
        let mut params = base.params.clone();
        params.extend(self.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            enabled: self.enabled.or(base.enabled),
            params,
        }
    }

    /// Decode the parameters into an extension's typed config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the parameters do not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        let value = serde_yml::to_value(&self.params)?;
        Ok(serde_yml::from_value(value)?)
    }
}

/// Effective, validated settings for one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSettings {
    /// Inactivity limit (`None` disables inactivity exemption).
    pub inactivity_limit: Option<TimeDelta>,
    /// Participant names that are always exempt.
    pub always_exempt: BTreeSet<String>,
    /// Force thresholds.
    pub thresholds: Thresholds,
    /// Event kinds that count as activity.
    pub monitored_activity: BTreeSet<String>,
    /// Disturbance wake radius.
    pub disturbance_radius: f64,
    /// Notification rules.
    pub notifications: BTreeMap<NotificationKind, RuleSettings>,
    /// Extension sections (merged, possibly disabled).
    pub extensions: BTreeMap<String, ExtensionSection>,
    /// Shape of the partition's day.
    pub day_cycle: DayCycle,
    /// Interval between inactivity sweeps.
    pub inactivity_check: TimeDelta,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        let mut notifications = BTreeMap::new();
        for kind in NotificationKind::ALL {
            notifications.insert(
                kind,
                RuleSettings {
                    format: builtin_rule(kind).format,
                    max_frequency: None,
                    timestamp: false,
                },
            );
        }
        Self {
            inactivity_limit: None,
            always_exempt: BTreeSet::new(),
            thresholds: Thresholds::default(),
            monitored_activity: default_monitored_activity().into_iter().collect(),
            disturbance_radius: default_disturbance_radius(),
            notifications,
            extensions: BTreeMap::new(),
            day_cycle: DayCycle::default(),
            inactivity_check: TimeDelta::seconds(30),
        }
    }
}

impl PartitionSettings {
    /// The enabled config section for an extension, if any.
    pub fn enabled_extension(&self, section: &str) -> Option<&ExtensionSection> {
        self.extensions
            .get(section)
            .filter(|section| section.is_enabled())
    }
}

/// A resolved notification rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSettings {
    /// Template, `None` when suppressed.
    pub format: Option<String>,
    /// Cooldown per subject, `None` when unlimited.
    pub max_frequency: Option<TimeDelta>,
    /// Whether to prefix the send time.
    pub timestamp: bool,
}

/// Convert a `-1`-means-disabled integer into an optional `u32`.
fn sentinel(value: i64, field: &str) -> Result<Option<u32>, ConfigError> {
    match value {
        -1 => Ok(None),
        v if v < -1 => Err(ConfigError::Invalid {
            reason: format!("{field} must be -1 or non-negative, got {v}"),
        }),
        v => u32::try_from(v)
            .map(Some)
            .map_err(|_err| ConfigError::Invalid {
                reason: format!("{field} is out of range: {v}"),
            }),
    }
}

/// Built-in template for a notification kind.
fn builtin_rule(kind: NotificationKind) -> NotificationOverride {
    let format = match kind {
        NotificationKind::RestEntered => {
            "{{ name }} is resting. {{ needed }} more needed ({{ resting }}/{{ possible }})."
        }
        NotificationKind::RestLeft => "{{ name }} got up.",
        NotificationKind::Disturbed => "{{ name }} was woken by a disturbance.",
        NotificationKind::ForcedAdvance => {
            "{% if requester %}{{ requester }} advanced{% else %}Enough are resting, advancing{% endif %} the night in {{ partition }}."
        }
        NotificationKind::Status => {
            "{{ needed }} more needed, {{ resting }}/{{ possible }} resting ({{ percent }}%)."
        }
        NotificationKind::InactiveExempted => "{{ name }} is inactive and no longer counted.",
    };
    NotificationOverride {
        format: Some(format.to_owned()),
        max_frequency: Some(-1),
        timestamp: Some(false),
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

const fn default_inactivity_check_seconds() -> u64 {
    30
}

const fn default_ticks_per_day() -> u64 {
    24_000
}

const fn default_morning_ticks() -> u64 {
    1_000
}

const fn default_dusk_start() -> u64 {
    12_000
}

const fn default_night_start() -> u64 {
    12_542
}

const fn default_night_end() -> u64 {
    23_460
}

fn default_log_level() -> String {
    "info".to_owned()
}

const fn default_disturbance_radius() -> f64 {
    8.0
}

fn default_monitored_activity() -> Vec<String> {
    vec![
        "move".to_owned(),
        "chat".to_owned(),
        "command".to_owned(),
        "interact".to_owned(),
    ]
}
