//! Rewards for resting through the night.
//!
//! When a participant gets up after a completed rest, every configured
//! reward is granted. Quantities are scaled by the participation factor
//! (`resting / possible`, capped at 1) unless scaling is turned off, so a
//! lone sleeper in a busy partition earns less than a full house.
//!
//! ```yaml
//! rewards:
//!   enabled: true
//!   list:
//!     - type: experience
//!       amount: 50
//!     - type: effect
//!       effect: regeneration
//!       duration_seconds: 30
//!       amplifier: 1
//!     - type: command
//!       command: "say {{ name }} slept well in {{ partition }}"
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use somnus_core::extension::{Extension, ExtensionContext, ExtensionError, ExtensionFactory};
use somnus_core::host::Host;
use somnus_core::notification::Renderer;
use somnus_core::state::{Participation, SleepEvent};
use somnus_types::Participant;
use tracing::{debug, warn};

/// Config section that enables the extension.
pub const SECTION: &str = "rewards";

/// Partition clock ticks per second of effect duration.
const TICKS_PER_SECOND: u32 = 20;

/// One configured reward.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RewardSpec {
    /// Console command rendered with the participant's details.
    Command {
        /// Template of the command line.
        command: String,
    },
    /// Experience points.
    Experience {
        /// Points at full participation.
        amount: u32,
    },
    /// An item stack.
    Item {
        /// Item identifier.
        item: String,
        /// Stack size at full participation.
        amount: u32,
    },
    /// A timed effect.
    Effect {
        /// Effect identifier.
        effect: String,
        /// Duration at full participation.
        duration_seconds: u32,
        /// Effect level.
        #[serde(default)]
        amplifier: u8,
    },
    /// Health and food restoration.
    HealthFood {
        /// Health points at full participation.
        #[serde(default)]
        health: f64,
        /// Food points at full participation.
        #[serde(default)]
        food: u32,
    },
}

impl RewardSpec {
    fn build(self) -> Box<dyn Reward> {
        match self {
            Self::Command { command } => Box::new(CommandReward { template: command }),
            Self::Experience { amount } => Box::new(ExperienceReward { amount }),
            Self::Item { item, amount } => Box::new(ItemReward { item, amount }),
            Self::Effect {
                effect,
                duration_seconds,
                amplifier,
            } => Box::new(EffectReward {
                effect,
                duration_ticks: duration_seconds.saturating_mul(TICKS_PER_SECOND),
                amplifier,
            }),
            Self::HealthFood { health, food } => Box::new(HealthFoodReward { health, food }),
        }
    }
}

/// Parameters of the `rewards` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RewardsConfig {
    /// Rewards granted in order.
    #[serde(default)]
    pub list: Vec<RewardSpec>,

    /// Scale quantities by the participation factor.
    #[serde(default = "default_scale")]
    pub scale_by_participation: bool,
}

const fn default_scale() -> bool {
    true
}

/// Who is being rewarded, and how generously.
pub struct Recipient<'a> {
    /// The participant.
    pub participant: &'a Participant,
    /// Name of their partition.
    pub partition: &'a str,
    /// Participation of the completed cycle.
    pub participation: Participation,
    /// Multiplier applied to quantities, within `[0, 1]`.
    pub factor: f64,
    /// Template renderer for command rewards.
    pub renderer: &'a Renderer,
}

impl Recipient<'_> {
    /// `amount` scaled by the factor, rounded.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn scale(&self, amount: u32) -> u32 {
        // The factor is within [0, 1], so the product fits in a u32.
        (f64::from(amount) * self.factor.clamp(0.0, 1.0)).round() as u32
    }

    fn args(&self) -> BTreeMap<String, Value> {
        let mut args = BTreeMap::new();
        args.insert("name".to_owned(), Value::from(self.participant.name.as_str()));
        args.insert("id".to_owned(), Value::from(self.participant.id.to_string()));
        args.insert("partition".to_owned(), Value::from(self.partition));
        args.insert("resting".to_owned(), Value::from(self.participation.resting));
        args.insert("possible".to_owned(), Value::from(self.participation.possible));
        args.insert("factor".to_owned(), Value::from(self.factor));
        args
    }
}

/// A reward strategy.
pub trait Reward: Send + fmt::Debug {
    /// Grant the reward.
    fn grant(&self, host: &mut dyn Host, recipient: &Recipient<'_>) -> Result<(), ExtensionError>;
}

#[derive(Debug)]
struct CommandReward {
    template: String,
}

impl Reward for CommandReward {
    fn grant(&self, host: &mut dyn Host, recipient: &Recipient<'_>) -> Result<(), ExtensionError> {
        let command = recipient
            .renderer
            .render(&self.template, &recipient.args())
            .map_err(|e| ExtensionError::Failed {
                reason: e.to_string(),
            })?;
        Ok(host.dispatch_command(&command)?)
    }
}

#[derive(Debug)]
struct ExperienceReward {
    amount: u32,
}

impl Reward for ExperienceReward {
    fn grant(&self, host: &mut dyn Host, recipient: &Recipient<'_>) -> Result<(), ExtensionError> {
        let amount = recipient.scale(self.amount);
        if amount == 0 {
            return Ok(());
        }
        Ok(host.give_experience(recipient.participant.id, amount)?)
    }
}

#[derive(Debug)]
struct ItemReward {
    item: String,
    amount: u32,
}

impl Reward for ItemReward {
    fn grant(&self, host: &mut dyn Host, recipient: &Recipient<'_>) -> Result<(), ExtensionError> {
        let amount = recipient.scale(self.amount);
        if amount == 0 {
            return Ok(());
        }
        Ok(host.give_item(recipient.participant.id, &self.item, amount)?)
    }
}

#[derive(Debug)]
struct EffectReward {
    effect: String,
    duration_ticks: u32,
    amplifier: u8,
}

impl Reward for EffectReward {
    fn grant(&self, host: &mut dyn Host, recipient: &Recipient<'_>) -> Result<(), ExtensionError> {
        let duration = recipient.scale(self.duration_ticks);
        if duration == 0 {
            return Ok(());
        }
        Ok(host.apply_effect(
            recipient.participant.id,
            &self.effect,
            duration,
            self.amplifier,
        )?)
    }
}

#[derive(Debug)]
struct HealthFoodReward {
    health: f64,
    food: u32,
}

impl Reward for HealthFoodReward {
    fn grant(&self, host: &mut dyn Host, recipient: &Recipient<'_>) -> Result<(), ExtensionError> {
        let health = self.health * recipient.factor.clamp(0.0, 1.0);
        let food = recipient.scale(self.food);
        Ok(host.restore(recipient.participant.id, health, food)?)
    }
}

/// Per-partition reward granting.
#[derive(Debug)]
pub struct Rewards {
    rewards: Vec<Box<dyn Reward>>,
    scale_by_participation: bool,
    renderer: Renderer,
}

impl Rewards {
    /// Build from parsed parameters.
    pub fn new(config: RewardsConfig) -> Self {
        Self {
            rewards: config.list.into_iter().map(RewardSpec::build).collect(),
            scale_by_participation: config.scale_by_participation,
            renderer: Renderer::new(),
        }
    }

    /// Number of configured rewards.
    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    /// Whether no reward is configured.
    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }
}

impl Extension for Rewards {
    fn observe(
        &mut self,
        ctx: &mut ExtensionContext<'_>,
        event: &SleepEvent,
    ) -> Result<(), ExtensionError> {
        let SleepEvent::RestCompleted {
            participant,
            participation,
        } = event
        else {
            return Ok(());
        };

        let factor = if self.scale_by_participation {
            participation.factor()
        } else {
            1.0
        };
        let recipient = Recipient {
            participant,
            partition: &ctx.state.partition().name,
            participation: *participation,
            factor,
            renderer: &self.renderer,
        };
        let mut granted = 0_usize;
        for reward in &self.rewards {
            match reward.grant(&mut *ctx.host, &recipient) {
                Ok(()) => granted = granted.saturating_add(1),
                Err(e) => warn!(
                    partition = %recipient.partition,
                    participant = %participant.name,
                    reward = ?reward,
                    error = %e,
                    "Reward not granted"
                ),
            }
        }
        debug!(
            partition = %recipient.partition,
            participant = %participant.name,
            granted,
            factor,
            "Rewards granted"
        );
        Ok(())
    }
}

/// Factory for the `rewards` section.
pub fn factory() -> ExtensionFactory {
    Box::new(|setup| {
        let config: RewardsConfig = setup.section.decode()?;
        Ok(Box::new(Rewards::new(config)) as Box<dyn Extension>)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const YAML: &str = r#"
list:
  - type: command
    command: "give {{ name }} bread"
  - type: experience
    amount: 10
  - type: item
    item: bread
    amount: 3
  - type: effect
    effect: regeneration
    duration_seconds: 5
  - type: health_food
    health: 4.0
    food: 6
"#;

    #[test]
    fn every_reward_type_parses() {
        let config: RewardsConfig = serde_yml::from_str(YAML).unwrap();
        assert_eq!(config.list.len(), 5);
        assert!(config.scale_by_participation);
        assert_eq!(
            config.list.get(3),
            Some(&RewardSpec::Effect {
                effect: "regeneration".to_owned(),
                duration_seconds: 5,
                amplifier: 0,
            })
        );
        assert_eq!(Rewards::new(config).len(), 5);
    }

    #[test]
    fn unknown_reward_type_is_an_error() {
        let parsed: Result<RewardsConfig, _> =
            serde_yml::from_str("list:\n  - type: teleport\n    to: spawn\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn scaling_rounds_to_nearest() {
        let participant = Participant::new(somnus_types::ParticipantId::new(), "p");
        let renderer = Renderer::new();
        let recipient = Recipient {
            participant: &participant,
            partition: "world",
            participation: Participation {
                resting: 1,
                possible: 3,
            },
            factor: 1.0 / 3.0,
            renderer: &renderer,
        };
        assert_eq!(recipient.scale(10), 3);
        assert_eq!(recipient.scale(2), 1);
        assert_eq!(recipient.scale(1), 0);
    }
}
