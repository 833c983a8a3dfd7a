//! Policy.
use crate::{
    behavior::{get_global_agent_id, ActionTuple, BehaviorSpec, LogProbsTuple},
    error::MlAgentsError,
    steps::DecisionSteps,
};
use anyhow::Result;
use log::warn;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};

/// Output of a forward pass of a policy on a batch of decision requests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    /// Sampled actions.
    pub action: ActionTuple,
    /// Actions sent to the environment, e.g. clipped continuous values.
    pub env_action: ActionTuple,
    pub log_probs: LogProbsTuple,
    pub entropy: Vec<f32>,
    /// Value estimates per reward signal.
    pub value_estimates: HashMap<String, Vec<f32>>,
    /// Memories after the step, one row per agent, for recurrent policies.
    pub memory: Option<Vec<Vec<f32>>>,
}

/// Actions of a batch of agents together with everything the agent processor records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionInfo {
    pub action: ActionTuple,
    pub env_action: ActionTuple,
    pub outputs: RunOutput,
    pub agent_ids: Vec<i32>,
}

impl ActionInfo {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.agent_ids.is_empty()
    }
}

/// A named parameter tensor as flat values.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NamedWeights {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Immutable snapshot of policy parameters, passed to other trainers through policy queues.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PolicyWeights {
    pub step: u64,
    pub weights: Vec<NamedWeights>,
}

/// Recurrent memories and previous actions of the agents served by a policy.
///
/// Entries are keyed by global agent id and zero-initialised on first
/// request.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    m_size: usize,
    discrete_size: usize,
    memory_dict: HashMap<String, Vec<f32>>,
    previous_memory_dict: HashMap<String, Vec<f32>>,
    previous_action_dict: HashMap<String, Vec<i32>>,
}

impl MemoryStore {
    pub fn new(m_size: usize, discrete_size: usize) -> Self {
        Self {
            m_size,
            discrete_size,
            ..Default::default()
        }
    }

    pub fn m_size(&self) -> usize {
        self.m_size
    }

    /// Stores the memories of the given agents, keeping the replaced ones as previous memories.
    pub fn save_memories(&mut self, agent_ids: &[String], memories: Option<&[Vec<f32>]>) {
        let memories = match memories {
            Some(m) => m,
            None => return,
        };
        for (id, memory) in agent_ids.iter().zip(memories.iter()) {
            if let Some(old) = self.memory_dict.insert(id.clone(), memory.clone()) {
                self.previous_memory_dict.insert(id.clone(), old);
            }
        }
    }

    pub fn retrieve_memories(&self, agent_ids: &[String]) -> Vec<Vec<f32>> {
        self.lookup(&self.memory_dict, agent_ids)
    }

    pub fn retrieve_previous_memories(&self, agent_ids: &[String]) -> Vec<Vec<f32>> {
        self.lookup(&self.previous_memory_dict, agent_ids)
    }

    fn lookup(&self, dict: &HashMap<String, Vec<f32>>, agent_ids: &[String]) -> Vec<Vec<f32>> {
        agent_ids
            .iter()
            .map(|id| {
                dict.get(id)
                    .cloned()
                    .unwrap_or_else(|| vec![0.0; self.m_size])
            })
            .collect()
    }

    pub fn remove_memories(&mut self, agent_ids: &[String]) {
        for id in agent_ids {
            self.memory_dict.remove(id);
            self.previous_memory_dict.remove(id);
        }
    }

    /// Stores the discrete actions of the given agents.
    pub fn save_previous_action(&mut self, agent_ids: &[String], action: &ActionTuple) {
        for (i, id) in agent_ids.iter().enumerate() {
            if let Some(discrete) = action.discrete.get(i) {
                self.previous_action_dict.insert(id.clone(), discrete.clone());
            }
        }
    }

    pub fn retrieve_previous_action(&self, agent_ids: &[String]) -> Vec<Vec<i32>> {
        agent_ids
            .iter()
            .map(|id| {
                self.previous_action_dict
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| vec![0; self.discrete_size])
            })
            .collect()
    }

    pub fn remove_previous_action(&mut self, agent_ids: &[String]) {
        for id in agent_ids {
            self.previous_action_dict.remove(id);
        }
    }

    pub fn clear(&mut self) {
        self.memory_dict.clear();
        self.previous_memory_dict.clear();
        self.previous_action_dict.clear();
    }
}

/// Action availability of a batch of decision requests, `1` for available.
///
/// Continuous-only behaviors have no mask. Fails with a configuration error
/// when the masks do not cover the discrete branches of the behavior.
pub fn extract_masks(
    decision_requests: &DecisionSteps,
    behavior_spec: &BehaviorSpec,
) -> Result<Option<Vec<Vec<f32>>>> {
    let action_spec = &behavior_spec.action_spec;
    if action_spec.discrete_size() == 0 {
        return Ok(None);
    }
    let width = action_spec.discrete_mask_size();
    let mask = match &decision_requests.action_mask {
        Some(mask) => mask,
        None => return Ok(Some(vec![vec![1.0; width]; decision_requests.len()])),
    };
    if mask.len() != decision_requests.len() {
        return Err(MlAgentsError::Config(format!(
            "{} action masks for {} decision requests",
            mask.len(),
            decision_requests.len()
        ))
        .into());
    }
    if let Some(row) = mask.iter().find(|row| row.len() != width) {
        return Err(MlAgentsError::Config(format!(
            "action mask of width {} does not match the {} actions of branches {:?}",
            row.len(),
            width,
            action_spec.discrete_branches
        ))
        .into());
    }
    Ok(Some(
        mask.iter()
            .map(|row| row.iter().map(|&m| if m { 0.0 } else { 1.0 }).collect())
            .collect(),
    ))
}

/// A policy maps decision requests of a behavior to actions.
///
/// Implementations own the network parameters and a [`MemoryStore`].
/// Memory bookkeeping and the step counter are provided on top of those.
pub trait Policy {
    fn behavior_spec(&self) -> &BehaviorSpec;

    fn memory_store(&self) -> &MemoryStore;

    fn memory_store_mut(&mut self) -> &mut MemoryStore;

    /// Forward pass on a batch of decision requests.
    ///
    /// Reads the stored memories of `global_agent_ids` but does not update them.
    fn evaluate(
        &mut self,
        decision_requests: &DecisionSteps,
        global_agent_ids: &[String],
    ) -> Result<RunOutput>;

    fn get_current_step(&self) -> u64;

    /// Sets the step counter and returns it.
    fn set_step(&mut self, step: u64) -> u64;

    fn use_recurrent(&self) -> bool;

    fn sequence_length(&self) -> usize;

    fn get_weights(&self) -> Result<PolicyWeights>;

    fn load_weights(&mut self, weights: &PolicyWeights) -> Result<()>;

    /// Saves the parameters in the given directory.
    fn save(&self, path: &Path) -> Result<()>;

    /// Loads the parameters from the given directory.
    fn load(&mut self, path: &Path) -> Result<()>;

    /// Increments the step counter and returns the new value.
    fn increment_step(&mut self, n_steps: u64) -> u64 {
        let step = self.get_current_step() + n_steps;
        self.set_step(step)
    }

    /// Size of the memory of one agent, 0 for feed-forward policies.
    fn m_size(&self) -> usize {
        self.memory_store().m_size()
    }

    /// Decides the actions of the requesting agents and updates their memories.
    fn get_action(
        &mut self,
        decision_requests: &DecisionSteps,
        worker_id: usize,
    ) -> Result<ActionInfo> {
        if decision_requests.is_empty() {
            return Ok(ActionInfo::empty());
        }
        let global_agent_ids: Vec<String> = decision_requests
            .agent_id
            .iter()
            .map(|&id| get_global_agent_id(worker_id, id))
            .collect();

        let run_out = self.evaluate(decision_requests, &global_agent_ids)?;
        self.memory_store_mut()
            .save_memories(&global_agent_ids, run_out.memory.as_deref());
        if run_out
            .action
            .continuous
            .iter()
            .flatten()
            .any(|v| v.is_nan())
        {
            warn!("NaN action detected");
        }

        Ok(ActionInfo {
            action: run_out.action.clone(),
            env_action: run_out.env_action.clone(),
            outputs: run_out,
            agent_ids: decision_requests.agent_id.clone(),
        })
    }

    fn save_memories(&mut self, agent_ids: &[String], memories: Option<&[Vec<f32>]>) {
        self.memory_store_mut().save_memories(agent_ids, memories);
    }

    fn retrieve_memories(&self, agent_ids: &[String]) -> Vec<Vec<f32>> {
        self.memory_store().retrieve_memories(agent_ids)
    }

    fn retrieve_previous_memories(&self, agent_ids: &[String]) -> Vec<Vec<f32>> {
        self.memory_store().retrieve_previous_memories(agent_ids)
    }

    fn remove_memories(&mut self, agent_ids: &[String]) {
        self.memory_store_mut().remove_memories(agent_ids);
    }

    fn save_previous_action(&mut self, agent_ids: &[String], action: &ActionTuple) {
        self.memory_store_mut().save_previous_action(agent_ids, action);
    }

    fn retrieve_previous_action(&self, agent_ids: &[String]) -> Vec<Vec<i32>> {
        self.memory_store().retrieve_previous_action(agent_ids)
    }

    fn remove_previous_action(&mut self, agent_ids: &[String]) {
        self.memory_store_mut().remove_previous_action(agent_ids);
    }

    /// Forgets all memories and previous actions.
    fn reset(&mut self) {
        self.memory_store_mut().clear();
    }
}
