//! Batched per-agent step data for one environment step.
//!
//! Agents requesting a decision are in [`DecisionSteps`], agents whose
//! episode ended since the last step are in [`TerminalSteps`]. An agent can
//! appear in both when it ended an episode and immediately started a new one.
use crate::behavior::BehaviorSpec;
use std::collections::HashMap;

/// Agents that requested a decision.
///
/// `obs[i][j]` is the flattened `i`-th observation of the `j`-th agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionSteps {
    pub obs: Vec<Vec<Vec<f32>>>,
    pub reward: Vec<f32>,
    pub agent_id: Vec<i32>,
    /// `true` marks a discrete action that is unavailable.
    pub action_mask: Option<Vec<Vec<bool>>>,
    pub group_id: Vec<i32>,
    pub group_reward: Vec<f32>,
}

/// Data of a single agent taken from [`DecisionSteps`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionStep {
    pub obs: Vec<Vec<f32>>,
    pub reward: f32,
    pub agent_id: i32,
    pub action_mask: Option<Vec<bool>>,
    pub group_id: i32,
    pub group_reward: f32,
}

impl DecisionSteps {
    /// Steps with no agents for the given behavior.
    pub fn empty(spec: &BehaviorSpec) -> Self {
        Self {
            obs: vec![vec![]; spec.observation_specs.len()],
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.agent_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agent_id.is_empty()
    }

    pub fn agent_id_to_index(&self) -> HashMap<i32, usize> {
        index_map(&self.agent_id)
    }

    /// Row index of an agent.
    pub fn index_of(&self, agent_id: i32) -> Option<usize> {
        self.agent_id.iter().position(|&id| id == agent_id)
    }

    /// The step of the agent at row `index`.
    pub fn at(&self, index: usize) -> DecisionStep {
        DecisionStep {
            obs: self.obs.iter().map(|o| o[index].clone()).collect(),
            reward: self.reward[index],
            agent_id: self.agent_id[index],
            action_mask: self.action_mask.as_ref().map(|m| m[index].clone()),
            group_id: self.group_id.get(index).copied().unwrap_or(0),
            group_reward: self.group_reward.get(index).copied().unwrap_or(0.0),
        }
    }

    pub fn get(&self, agent_id: i32) -> Option<DecisionStep> {
        self.index_of(agent_id).map(|i| self.at(i))
    }

    /// Iterates steps in row order.
    pub fn iter(&self) -> impl Iterator<Item = DecisionStep> + '_ {
        (0..self.len()).map(move |i| self.at(i))
    }
}

/// Agents whose episode ended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminalSteps {
    pub obs: Vec<Vec<Vec<f32>>>,
    pub reward: Vec<f32>,
    /// `true` if the episode ended because of a step limit rather than a terminal state.
    pub interrupted: Vec<bool>,
    pub agent_id: Vec<i32>,
    pub group_id: Vec<i32>,
    pub group_reward: Vec<f32>,
}

/// Data of a single agent taken from [`TerminalSteps`].
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalStep {
    pub obs: Vec<Vec<f32>>,
    pub reward: f32,
    pub interrupted: bool,
    pub agent_id: i32,
    pub group_id: i32,
    pub group_reward: f32,
}

impl TerminalSteps {
    pub fn empty(spec: &BehaviorSpec) -> Self {
        Self {
            obs: vec![vec![]; spec.observation_specs.len()],
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.agent_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agent_id.is_empty()
    }

    pub fn agent_id_to_index(&self) -> HashMap<i32, usize> {
        index_map(&self.agent_id)
    }

    pub fn index_of(&self, agent_id: i32) -> Option<usize> {
        self.agent_id.iter().position(|&id| id == agent_id)
    }

    pub fn at(&self, index: usize) -> TerminalStep {
        TerminalStep {
            obs: self.obs.iter().map(|o| o[index].clone()).collect(),
            reward: self.reward[index],
            interrupted: self.interrupted[index],
            agent_id: self.agent_id[index],
            group_id: self.group_id.get(index).copied().unwrap_or(0),
            group_reward: self.group_reward.get(index).copied().unwrap_or(0.0),
        }
    }

    pub fn get(&self, agent_id: i32) -> Option<TerminalStep> {
        self.index_of(agent_id).map(|i| self.at(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = TerminalStep> + '_ {
        (0..self.len()).map(move |i| self.at(i))
    }
}

fn index_map(ids: &[i32]) -> HashMap<i32, usize> {
    ids.iter().enumerate().map(|(i, &id)| (id, i)).collect()
}

/// A single agent step of either kind, as seen by the agent processor.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStep {
    Decision(DecisionStep),
    Terminal(TerminalStep),
}

impl AgentStep {
    pub fn obs(&self) -> &Vec<Vec<f32>> {
        match self {
            Self::Decision(s) => &s.obs,
            Self::Terminal(s) => &s.obs,
        }
    }

    pub fn reward(&self) -> f32 {
        match self {
            Self::Decision(s) => s.reward,
            Self::Terminal(s) => s.reward,
        }
    }

    pub fn agent_id(&self) -> i32 {
        match self {
            Self::Decision(s) => s.agent_id,
            Self::Terminal(s) => s.agent_id,
        }
    }

    pub fn group_id(&self) -> i32 {
        match self {
            Self::Decision(s) => s.group_id,
            Self::Terminal(s) => s.group_id,
        }
    }

    pub fn group_reward(&self) -> f32 {
        match self {
            Self::Decision(s) => s.group_reward,
            Self::Terminal(s) => s.group_reward,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    pub fn interrupted(&self) -> bool {
        match self {
            Self::Decision(_) => false,
            Self::Terminal(s) => s.interrupted,
        }
    }

    pub fn action_mask(&self) -> Option<&Vec<bool>> {
        match self {
            Self::Decision(s) => s.action_mask.as_ref(),
            Self::Terminal(_) => None,
        }
    }
}
