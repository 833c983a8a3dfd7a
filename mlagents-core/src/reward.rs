//! Reward signals.
use crate::{
    buffer::{AgentBuffer, BufferKey},
    record::Record,
    settings::{RewardSignalSettings, RewardSignalType},
};
use anyhow::Result;

/// Source of rewards that a trainer optimizes.
pub trait RewardProvider: Send {
    /// Name used in buffer keys, value heads and statistics.
    fn name(&self) -> &str;

    fn gamma(&self) -> f32;

    fn strength(&self) -> f32;

    /// Whether the value bootstraps past the end of an episode.
    fn ignore_done(&self) -> bool {
        false
    }

    /// Scaled rewards of every step of `mini_batch`.
    fn evaluate(&self, mini_batch: &AgentBuffer) -> Result<Vec<f32>>;

    /// Trains the provider, if it has anything to learn.
    fn update(&mut self, _mini_batch: &AgentBuffer) -> Result<Record> {
        Ok(Record::empty())
    }
}

/// Rewards given by the environment.
///
/// With `add_groupmate_rewards`, the rewards of the teammates are added to
/// the agent's own reward. Group rewards are always added.
#[derive(Debug, Clone)]
pub struct ExtrinsicRewardProvider {
    gamma: f32,
    strength: f32,
    add_groupmate_rewards: bool,
}

impl ExtrinsicRewardProvider {
    pub fn new(settings: &RewardSignalSettings) -> Self {
        Self {
            gamma: settings.gamma,
            strength: settings.strength,
            add_groupmate_rewards: false,
        }
    }

    pub fn add_groupmate_rewards(mut self, v: bool) -> Self {
        self.add_groupmate_rewards = v;
        self
    }
}

impl RewardProvider for ExtrinsicRewardProvider {
    fn name(&self) -> &str {
        RewardSignalType::Extrinsic.name()
    }

    fn gamma(&self) -> f32 {
        self.gamma
    }

    fn strength(&self) -> f32 {
        self.strength
    }

    fn evaluate(&self, mini_batch: &AgentBuffer) -> Result<Vec<f32>> {
        let mut rewards = mini_batch.field(&BufferKey::EnvironmentRewards)?.scalars();
        if self.add_groupmate_rewards {
            if let Some(groupmate) = mini_batch.get(&BufferKey::GroupmateRewards) {
                for (r, g) in rewards.iter_mut().zip(groupmate.iter()) {
                    *r += g.iter().sum::<f32>();
                }
            }
        }
        if let Some(group) = mini_batch.get(&BufferKey::GroupReward) {
            for (r, g) in rewards.iter_mut().zip(group.scalars()) {
                *r += g;
            }
        }
        Ok(rewards.into_iter().map(|r| r * self.strength).collect())
    }
}

/// Builds the reward providers of the given settings.
pub fn create_reward_providers<'a>(
    settings: impl IntoIterator<Item = (&'a RewardSignalType, &'a RewardSignalSettings)>,
    add_groupmate_rewards: bool,
) -> Vec<Box<dyn RewardProvider>> {
    settings
        .into_iter()
        .map(|(t, s)| match t {
            RewardSignalType::Extrinsic => Box::new(
                ExtrinsicRewardProvider::new(s).add_groupmate_rewards(add_groupmate_rewards),
            ) as Box<dyn RewardProvider>,
        })
        .collect()
}
