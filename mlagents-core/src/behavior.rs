//! Observation and action specifications of a behavior.
//!
//! A behavior (historically a *brain*) is a named group of agents sharing one
//! policy. Its [`BehaviorSpec`] is built once from the environment handshake
//! and is read-only afterwards.
use crate::error::MlAgentsError;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// How the dimensions of an observation should be interpreted.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum DimensionProperty {
    Unspecified,
    None,
    Translational,
    VariableSize,
}

/// Semantic role of an observation.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ObservationType {
    Default,
    GoalSignal,
}

/// Shape and metadata of a single observation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ObservationSpec {
    pub shape: Vec<usize>,
    pub dimension_property: Vec<DimensionProperty>,
    pub observation_type: ObservationType,
    pub name: String,
}

impl ObservationSpec {
    /// A spec with default metadata for the given shape.
    pub fn new(shape: Vec<usize>, name: impl Into<String>) -> Self {
        let dimension_property = vec![DimensionProperty::Unspecified; shape.len()];
        Self {
            shape,
            dimension_property,
            observation_type: ObservationType::Default,
            name: name.into(),
        }
    }

    /// Number of scalars in one observation.
    pub fn flat_size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Rank 3 observations are images in height, width, channel order.
    pub fn is_visual(&self) -> bool {
        self.shape.len() == 3
    }
}

/// Action space of a behavior. Hybrid spaces have both parts non-empty.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct ActionSpec {
    pub continuous_size: usize,
    pub discrete_branches: Vec<usize>,
}

impl ActionSpec {
    pub fn new(continuous_size: usize, discrete_branches: Vec<usize>) -> Self {
        Self {
            continuous_size,
            discrete_branches,
        }
    }

    pub fn create_continuous(continuous_size: usize) -> Self {
        Self::new(continuous_size, vec![])
    }

    pub fn create_discrete(discrete_branches: Vec<usize>) -> Self {
        Self::new(0, discrete_branches)
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous_size > 0 && self.discrete_branches.is_empty()
    }

    pub fn is_discrete(&self) -> bool {
        self.continuous_size == 0 && !self.discrete_branches.is_empty()
    }

    /// Number of discrete branches.
    pub fn discrete_size(&self) -> usize {
        self.discrete_branches.len()
    }

    /// Sum of the branch sizes, i.e. the width of an action mask.
    pub fn discrete_mask_size(&self) -> usize {
        self.discrete_branches.iter().sum()
    }

    pub fn total_size(&self) -> usize {
        self.continuous_size + self.discrete_size()
    }

    /// Zero actions for `n_agents` agents.
    pub fn empty_action(&self, n_agents: usize) -> ActionTuple {
        ActionTuple {
            continuous: vec![vec![0.0; self.continuous_size]; n_agents],
            discrete: vec![vec![0; self.discrete_size()]; n_agents],
        }
    }

    /// Uniformly random actions for `n_agents` agents.
    ///
    /// Continuous values are drawn from `[-1, 1)`.
    pub fn random_action(&self, n_agents: usize) -> ActionTuple {
        let continuous = (0..n_agents)
            .map(|_| {
                (0..self.continuous_size)
                    .map(|_| fastrand::f32() * 2.0 - 1.0)
                    .collect()
            })
            .collect();
        let discrete = (0..n_agents)
            .map(|_| {
                self.discrete_branches
                    .iter()
                    .map(|&b| fastrand::usize(..b.max(1)) as i32)
                    .collect()
            })
            .collect();
        ActionTuple {
            continuous,
            discrete,
        }
    }

    /// Fails if `other` does not describe the same action space.
    pub fn check_matches(&self, other: &ActionSpec) -> Result<()> {
        if self != other {
            return Err(MlAgentsError::Config(format!(
                "action spec {:?} does not match {:?}",
                self, other
            ))
            .into());
        }
        Ok(())
    }
}

/// Observation and action specification of a behavior.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BehaviorSpec {
    pub observation_specs: Vec<ObservationSpec>,
    pub action_spec: ActionSpec,
}

impl BehaviorSpec {
    pub fn new(observation_specs: Vec<ObservationSpec>, action_spec: ActionSpec) -> Self {
        Self {
            observation_specs,
            action_spec,
        }
    }

    /// Flat sizes of all observations.
    pub fn observation_sizes(&self) -> Vec<usize> {
        self.observation_specs.iter().map(|s| s.flat_size()).collect()
    }
}

/// Actions of a batch of agents, one row per agent.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct ActionTuple {
    pub continuous: Vec<Vec<f32>>,
    pub discrete: Vec<Vec<i32>>,
}

impl ActionTuple {
    /// Number of agents in the tuple.
    pub fn len(&self) -> usize {
        self.continuous.len().max(self.discrete.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The action of the agent at row `i`.
    pub fn row(&self, i: usize) -> AgentAction {
        AgentAction {
            continuous: self.continuous.get(i).cloned().unwrap_or_default(),
            discrete: self.discrete.get(i).cloned().unwrap_or_default(),
        }
    }
}

/// Action of a single agent.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct AgentAction {
    pub continuous: Vec<f32>,
    pub discrete: Vec<i32>,
}

/// Log probabilities of a batch of actions, one row per agent.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct LogProbsTuple {
    pub continuous: Vec<Vec<f32>>,
    pub discrete: Vec<Vec<f32>>,
}

impl LogProbsTuple {
    /// Log probabilities of the agent at row `i`.
    pub fn row(&self, i: usize) -> AgentLogProbs {
        AgentLogProbs {
            continuous: self.continuous.get(i).cloned().unwrap_or_default(),
            discrete: self.discrete.get(i).cloned().unwrap_or_default(),
        }
    }
}

/// Log probabilities of the action of a single agent.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct AgentLogProbs {
    pub continuous: Vec<f32>,
    pub discrete: Vec<f32>,
}

/// Parsed behavior identifier of the form `name?team=N`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BehaviorIdentifiers {
    pub behavior_id: String,
    pub brain_name: String,
    pub team_id: i32,
}

impl BehaviorIdentifiers {
    /// Parses a behavior id. Ids without a `team` query get team 0.
    pub fn from_name_behavior_id(name_behavior_id: &str) -> Self {
        let mut parts = name_behavior_id.splitn(2, '?');
        let brain_name = parts.next().unwrap_or_default().to_string();
        let team_id = parts
            .next()
            .and_then(|q| {
                q.split('&')
                    .filter_map(|kv| kv.split_once('='))
                    .find(|(k, _)| *k == "team")
                    .and_then(|(_, v)| v.parse().ok())
            })
            .unwrap_or(0);
        Self {
            behavior_id: name_behavior_id.to_string(),
            brain_name,
            team_id,
        }
    }
}

/// Agent id unique across environment workers.
pub fn get_global_agent_id(worker_id: usize, agent_id: i32) -> String {
    format!("agent_id={}-{}", worker_id, agent_id)
}

/// Group id unique across environment workers.
pub fn get_global_group_id(worker_id: usize, group_id: i32) -> String {
    format!("group_id={}-{}", worker_id, group_id)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_behavior_identifiers() {
        let ids = BehaviorIdentifiers::from_name_behavior_id("Striker?team=1");
        assert_eq!(ids.brain_name, "Striker");
        assert_eq!(ids.team_id, 1);

        let ids = BehaviorIdentifiers::from_name_behavior_id("3DBall");
        assert_eq!(ids.brain_name, "3DBall");
        assert_eq!(ids.team_id, 0);
    }

    #[test]
    fn test_action_spec_sizes() {
        let spec = ActionSpec::new(2, vec![3, 2]);
        assert!(!spec.is_continuous());
        assert!(!spec.is_discrete());
        assert_eq!(spec.discrete_size(), 2);
        assert_eq!(spec.discrete_mask_size(), 5);
        assert_eq!(spec.total_size(), 4);

        let random = spec.random_action(4);
        assert_eq!(random.len(), 4);
        assert!(random.discrete.iter().all(|r| r[0] < 3 && r[1] < 2));
        assert!(random
            .continuous
            .iter()
            .flatten()
            .all(|v| (-1.0..1.0).contains(v)));

        assert!(spec.check_matches(&ActionSpec::create_continuous(2)).is_err());
    }
}
