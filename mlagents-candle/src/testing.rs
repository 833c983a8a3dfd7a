//! Fixtures shared by the tests of the trainers.
use anyhow::Result;
use mlagents_core::{
    behavior::{ActionSpec, AgentAction, AgentLogProbs, BehaviorSpec, ObservationSpec},
    demo::write_demo,
    messages::{
        ActionSpecMessage, AgentActionMessage, AgentInfoActionPairMessage, AgentInfoMessage,
        BrainParametersMessage, DemonstrationMetaMessage, ObservationMessage,
    },
    settings::{NetworkSettings, TrainerSettings},
    trajectory::{AgentExperience, AgentStatus, Trajectory},
};
use std::path::Path;

pub(crate) fn vector_spec(obs_size: usize, action_spec: ActionSpec) -> BehaviorSpec {
    BehaviorSpec::new(vec![ObservationSpec::new(vec![obs_size], "vector")], action_spec)
}

/// Default settings with tiny networks.
pub(crate) fn small_settings() -> TrainerSettings {
    TrainerSettings::default()
        .network_settings(NetworkSettings::default().hidden_units(8).num_layers(1))
}

/// Trajectory of `length` steps with a reward of 1 per step.
///
/// Every action is 0.1 (continuous) or 1 (discrete), the first discrete
/// action of each branch is masked out.
pub(crate) fn fake_trajectory(
    agent_id: &str,
    length: usize,
    obs_size: usize,
    action_spec: &ActionSpec,
    done: bool,
    memory_size: Option<usize>,
    num_teammates: usize,
) -> Trajectory {
    let action = AgentAction {
        continuous: vec![0.1; action_spec.continuous_size],
        discrete: vec![1; action_spec.discrete_branches.len()],
    };
    let mask = match action_spec.discrete_branches.is_empty() {
        true => None,
        false => Some(
            action_spec
                .discrete_branches
                .iter()
                .flat_map(|&b| (0..b).map(|i| i == 0))
                .collect(),
        ),
    };
    let steps = (0..length)
        .map(|t| {
            let last = done && t + 1 == length;
            AgentExperience {
                obs: vec![vec![0.1 * t as f32; obs_size]],
                reward: 1.0,
                done: last,
                action: action.clone(),
                action_probs: AgentLogProbs {
                    continuous: vec![-1.0; action_spec.continuous_size],
                    discrete: vec![-0.7; action_spec.discrete_branches.len()],
                },
                action_mask: mask.clone(),
                prev_action: vec![0; action_spec.discrete_branches.len()],
                interrupted: false,
                memory: memory_size.map(|m| vec![0.0; m]),
                group_status: (0..num_teammates)
                    .map(|k| AgentStatus {
                        obs: vec![vec![0.5 + 0.1 * k as f32; obs_size]],
                        reward: 0.0,
                        action: action.clone(),
                        done: last,
                    })
                    .collect(),
                group_reward: 0.5,
            }
        })
        .collect();
    Trajectory {
        steps,
        next_obs: vec![vec![0.1 * length as f32; obs_size]],
        next_group_obs: vec![vec![vec![0.5; obs_size]]; num_teammates],
        agent_id: agent_id.to_string(),
        behavior_id: "test_brain".to_string(),
    }
}

/// Writes a demonstration of `n_steps` steps with 2 observations and 1 continuous action.
pub(crate) fn write_fake_demo(path: &Path, n_steps: usize) -> Result<()> {
    let meta = DemonstrationMetaMessage {
        api_version: 1,
        demonstration_name: "fake".to_string(),
        number_steps: n_steps,
        number_episodes: n_steps / 4,
        mean_reward: 1.0,
    };
    let brain_params = BrainParametersMessage {
        brain_name: "Fake".to_string(),
        is_training: true,
        action_spec: Some(ActionSpecMessage {
            num_continuous_actions: 1,
            discrete_branch_sizes: vec![],
        }),
        ..Default::default()
    };
    let pairs: Vec<_> = (0..n_steps)
        .map(|i| AgentInfoActionPairMessage {
            agent_info: AgentInfoMessage {
                reward: 1.0,
                done: i % 4 == 3,
                id: 0,
                observations: vec![ObservationMessage::float(vec![2], vec![i as f32 * 0.1; 2])],
                ..Default::default()
            },
            action_info: AgentActionMessage {
                continuous_actions: vec![0.5],
                ..Default::default()
            },
        })
        .collect();
    write_demo(path, &meta, &brain_params, &pairs)
}
