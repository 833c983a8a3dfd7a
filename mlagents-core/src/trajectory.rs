//! Per-agent experience between an episode start and a done flag or horizon cut.
use crate::{
    behavior::{AgentAction, AgentLogProbs},
    buffer::{AgentBuffer, AgentBufferField, BufferKey},
};
use anyhow::Result;

/// Snapshot of a teammate at one step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentStatus {
    pub obs: Vec<Vec<f32>>,
    pub reward: f32,
    pub action: AgentAction,
    pub done: bool,
}

/// Everything recorded for one agent at one step.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentExperience {
    pub obs: Vec<Vec<f32>>,
    pub reward: f32,
    pub done: bool,
    pub action: AgentAction,
    pub action_probs: AgentLogProbs,
    /// `true` marks an unavailable discrete action.
    pub action_mask: Option<Vec<bool>>,
    pub prev_action: Vec<i32>,
    pub interrupted: bool,
    pub memory: Option<Vec<f32>>,
    pub group_status: Vec<AgentStatus>,
    pub group_reward: f32,
}

/// Ordered experiences of one agent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trajectory {
    pub steps: Vec<AgentExperience>,
    /// Observation following the last step.
    pub next_obs: Vec<Vec<f32>>,
    /// Observations of the teammates following the last step.
    pub next_group_obs: Vec<Vec<Vec<f32>>>,
    pub agent_id: String,
    pub behavior_id: String,
}

impl Trajectory {
    /// Converts the trajectory into a per-agent buffer with one row per step.
    ///
    /// Next observations are shifted by one step and the last row takes
    /// `next_obs`. Action masks are inverted so that `1` marks an available
    /// action.
    pub fn to_agentbuffer(&self) -> AgentBuffer {
        let mut buffer = AgentBuffer::new();
        let n_steps = self.steps.len();

        for (t, exp) in self.steps.iter().enumerate() {
            let next = self.steps.get(t + 1);
            let next_obs = next.map_or(&self.next_obs, |e| &e.obs);

            for (i, obs) in exp.obs.iter().enumerate() {
                buffer.append(ObsUtil::get_name_at(i), obs.clone());
                let row = next_obs.get(i).cloned().unwrap_or_default();
                buffer.append(ObsUtil::get_name_at_next(i), row);
            }

            // Teammates
            let next_status = next.map_or(&exp.group_status, |e| &e.group_status);
            buffer.append(
                BufferKey::GroupContinuousAction,
                exp.group_status
                    .iter()
                    .flat_map(|s| s.action.continuous.iter().copied())
                    .collect(),
            );
            buffer.append(
                BufferKey::GroupDiscreteAction,
                exp.group_status
                    .iter()
                    .flat_map(|s| s.action.discrete.iter().map(|&a| a as f32))
                    .collect(),
            );
            buffer.append(
                BufferKey::GroupNextContAction,
                next_status
                    .iter()
                    .flat_map(|s| s.action.continuous.iter().copied())
                    .collect(),
            );
            buffer.append(
                BufferKey::GroupNextDiscAction,
                next_status
                    .iter()
                    .flat_map(|s| s.action.discrete.iter().map(|&a| a as f32))
                    .collect(),
            );
            buffer.append(
                BufferKey::GroupmateRewards,
                exp.group_status.iter().map(|s| s.reward).collect(),
            );
            buffer.append(
                BufferKey::GroupDones,
                exp.group_status
                    .iter()
                    .map(|s| if s.done { 1.0 } else { 0.0 })
                    .collect(),
            );
            buffer.append_scalar(BufferKey::GroupReward, exp.group_reward);

            for i in 0..exp.obs.len() {
                let group_obs = exp
                    .group_status
                    .iter()
                    .flat_map(|s| s.obs.get(i).cloned().unwrap_or_default())
                    .collect();
                buffer.append(GroupObsUtil::get_name_at(i), group_obs);

                let group_next_obs = match next {
                    Some(e) => e
                        .group_status
                        .iter()
                        .flat_map(|s| s.obs.get(i).cloned().unwrap_or_default())
                        .collect(),
                    None => self
                        .next_group_obs
                        .iter()
                        .flat_map(|o| o.get(i).cloned().unwrap_or_default())
                        .collect(),
                };
                buffer.append(GroupObsUtil::get_name_at_next(i), group_next_obs);
            }

            if let Some(memory) = &exp.memory {
                buffer.append(BufferKey::Memory, memory.clone());
            }
            buffer.append_scalar(BufferKey::Masks, 1.0);
            buffer.append_bool(BufferKey::Done, exp.done);

            // Actions
            buffer.append(BufferKey::ContinuousAction, exp.action.continuous.clone());
            buffer.append(
                BufferKey::DiscreteAction,
                exp.action.discrete.iter().map(|&a| a as f32).collect(),
            );
            let (next_cont, next_disc) = match next {
                Some(e) => (
                    e.action.continuous.clone(),
                    e.action.discrete.iter().map(|&a| a as f32).collect(),
                ),
                None => (
                    vec![0.0; exp.action.continuous.len()],
                    vec![0.0; exp.action.discrete.len()],
                ),
            };
            buffer.append(BufferKey::NextContAction, next_cont);
            buffer.append(BufferKey::NextDiscAction, next_disc);
            buffer.append(
                BufferKey::ContinuousLogProbs,
                exp.action_probs.continuous.clone(),
            );
            buffer.append(BufferKey::DiscreteLogProbs, exp.action_probs.discrete.clone());

            let action_mask = match &exp.action_mask {
                Some(mask) => mask.iter().map(|&m| if m { 0.0 } else { 1.0 }).collect(),
                None => vec![1.0; exp.action.discrete.len()],
            };
            buffer.append(BufferKey::ActionMask, action_mask);
            buffer.append(
                BufferKey::PrevAction,
                exp.prev_action.iter().map(|&a| a as f32).collect(),
            );
            buffer.append_scalar(BufferKey::EnvironmentRewards, exp.reward);
        }
        debug_assert_eq!(buffer.num_experiences(), n_steps);
        buffer
    }

    /// Whether the last step ended the episode.
    pub fn done_reached(&self) -> bool {
        self.steps.last().map_or(false, |s| s.done)
    }

    /// Whether every teammate was done at the last step.
    pub fn all_group_dones_reached(&self) -> bool {
        self.steps
            .last()
            .map_or(true, |s| s.group_status.iter().all(|g| g.done))
    }

    /// Whether the episode was cut by a step limit.
    pub fn interrupted(&self) -> bool {
        self.steps.last().map_or(false, |s| s.interrupted)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Buffer keys of the observations of an agent.
pub struct ObsUtil;

impl ObsUtil {
    pub fn get_name_at(index: usize) -> BufferKey {
        BufferKey::Obs(index)
    }

    pub fn get_name_at_next(index: usize) -> BufferKey {
        BufferKey::NextObs(index)
    }

    /// The observation fields of a buffer, in index order.
    pub fn from_buffer(buffer: &AgentBuffer, num_obs: usize) -> Result<Vec<&AgentBufferField>> {
        (0..num_obs)
            .map(|i| buffer.field(&Self::get_name_at(i)))
            .collect()
    }

    /// The next-observation fields of a buffer, in index order.
    pub fn from_buffer_next(
        buffer: &AgentBuffer,
        num_obs: usize,
    ) -> Result<Vec<&AgentBufferField>> {
        (0..num_obs)
            .map(|i| buffer.field(&Self::get_name_at_next(i)))
            .collect()
    }
}

/// Buffer keys of the observations of the teammates of an agent.
pub struct GroupObsUtil;

impl GroupObsUtil {
    pub fn get_name_at(index: usize) -> BufferKey {
        BufferKey::GroupObs(index)
    }

    pub fn get_name_at_next(index: usize) -> BufferKey {
        BufferKey::GroupNextObs(index)
    }

    /// Splits the group observations of a buffer per teammate.
    ///
    /// Returns `[obs index][teammate][step]`. `obs_sizes` holds the flat size
    /// of each observation. Steps where a teammate is absent are filled with
    /// NaN.
    pub fn from_buffer(
        buffer: &AgentBuffer,
        obs_sizes: &[usize],
    ) -> Result<Vec<Vec<Vec<Vec<f32>>>>> {
        Self::split(buffer, obs_sizes, Self::get_name_at)
    }

    /// As [`GroupObsUtil::from_buffer`] for the next observations.
    pub fn from_buffer_next(
        buffer: &AgentBuffer,
        obs_sizes: &[usize],
    ) -> Result<Vec<Vec<Vec<Vec<f32>>>>> {
        Self::split(buffer, obs_sizes, Self::get_name_at_next)
    }

    fn split(
        buffer: &AgentBuffer,
        obs_sizes: &[usize],
        key: fn(usize) -> BufferKey,
    ) -> Result<Vec<Vec<Vec<Vec<f32>>>>> {
        obs_sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let field = buffer.field(&key(i))?;
                Ok(split_teammates(field, size))
            })
            .collect()
    }
}

/// Splits rows of concatenated per-teammate values into `[teammate][step]`.
///
/// The number of teammates is the largest seen at any step; missing entries are NaN.
pub fn split_teammates(field: &AgentBufferField, size: usize) -> Vec<Vec<Vec<f32>>> {
    if size == 0 {
        return vec![];
    }
    let n_teammates = field.iter().map(|r| r.len() / size).max().unwrap_or(0);
    (0..n_teammates)
        .map(|k| {
            field
                .iter()
                .map(|row| match row.get(k * size..(k + 1) * size) {
                    Some(values) => values.to_vec(),
                    None => vec![f32::NAN; size],
                })
                .collect()
        })
        .collect()
}
