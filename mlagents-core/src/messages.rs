//! Messages exchanged with the environment and their conversion to step batches.
//!
//! The transport is not part of this crate. Messages are plain serde structs
//! so that demonstration files and tests can carry them.
use crate::{
    behavior::{ActionSpec, BehaviorSpec, DimensionProperty, ObservationSpec, ObservationType},
    error::MlAgentsError,
    steps::{DecisionSteps, TerminalSteps},
};
use anyhow::Result;
use image::ImageBuffer;
use log::warn;
use serde::{Deserialize, Serialize};

/// Payload of an observation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum ObservationData {
    /// Flattened float values.
    Float(Vec<f32>),
    /// PNG or JPEG bytes of an image.
    Compressed(Vec<u8>),
}

/// One observation of an agent.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ObservationMessage {
    pub shape: Vec<usize>,
    pub data: ObservationData,
    pub dimension_properties: Vec<DimensionProperty>,
    pub observation_type: ObservationType,
    pub name: String,
}

impl ObservationMessage {
    /// A float observation with default metadata.
    pub fn float(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self {
            dimension_properties: vec![DimensionProperty::Unspecified; shape.len()],
            shape,
            data: ObservationData::Float(values),
            observation_type: ObservationType::Default,
            name: String::new(),
        }
    }

    /// A compressed image observation with default metadata.
    pub fn compressed(shape: Vec<usize>, bytes: Vec<u8>) -> Self {
        Self {
            dimension_properties: vec![DimensionProperty::Unspecified; shape.len()],
            shape,
            data: ObservationData::Compressed(bytes),
            observation_type: ObservationType::Default,
            name: String::new(),
        }
    }
}

/// State of one agent at one step.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct AgentInfoMessage {
    pub reward: f32,
    pub done: bool,
    pub max_step_reached: bool,
    pub id: i32,
    /// `true` marks an unavailable discrete action, for all branches concatenated.
    pub action_mask: Vec<bool>,
    pub observations: Vec<ObservationMessage>,
    pub group_id: i32,
    pub group_reward: f32,
}

/// Action space as sent by the environment.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct ActionSpecMessage {
    pub num_continuous_actions: usize,
    pub discrete_branch_sizes: Vec<usize>,
}

/// Parameters of a behavior sent once in the handshake.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct BrainParametersMessage {
    pub brain_name: String,
    pub is_training: bool,
    pub action_spec: Option<ActionSpecMessage>,
    /// Used when `action_spec` is absent.
    pub vector_action_size_deprecated: Vec<usize>,
    /// `0` for discrete, `1` for continuous. Used when `action_spec` is absent.
    pub vector_action_space_type_deprecated: i32,
}

/// Header of a demonstration file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct DemonstrationMetaMessage {
    pub api_version: i32,
    pub demonstration_name: String,
    pub number_steps: usize,
    pub number_episodes: usize,
    pub mean_reward: f32,
}

/// Action taken by an agent.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct AgentActionMessage {
    /// Flat actions of older recordings.
    pub vector_actions_deprecated: Vec<f32>,
    pub continuous_actions: Vec<f32>,
    pub discrete_actions: Vec<i32>,
    pub value: f32,
}

/// A recorded step: agent state and the action taken in it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct AgentInfoActionPairMessage {
    pub agent_info: AgentInfoMessage,
    pub action_info: AgentActionMessage,
}

/// Decodes a compressed image into `[0, 1]` floats in height, width, channel order.
///
/// With `grayscale`, the channels are averaged into a single one.
pub fn process_pixels(image_bytes: &[u8], grayscale: bool) -> Result<Vec<f32>> {
    let image = image::load_from_memory(image_bytes)
        .map_err(|e| MlAgentsError::Decode(format!("image: {}", e)))?
        .to_rgb8();
    let pixels = image.pixels().map(|p| p.0);

    let values = if grayscale {
        pixels
            .map(|[r, g, b]| (r as f32 + g as f32 + b as f32) / (3.0 * 255.0))
            .collect()
    } else {
        pixels
            .flat_map(|rgb| rgb.iter().map(|&c| c as f32 / 255.0).collect::<Vec<_>>())
            .collect()
    };
    Ok(values)
}

/// Encodes an RGB image of shape `[h, w, 3]` with values in `[0, 1]` as PNG.
pub fn compress_pixels(values: &[f32], height: u32, width: u32) -> Result<Vec<u8>> {
    let raw = values
        .iter()
        .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect::<Vec<_>>();
    let image = ImageBuffer::<image::Rgb<u8>, _>::from_vec(width, height, raw)
        .ok_or_else(|| MlAgentsError::Decode("pixel buffer does not match shape".into()))?;
    let mut bytes = vec![];
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut bytes, image::ImageOutputFormat::Png)
        .map_err(|e| MlAgentsError::Decode(format!("image: {}", e)))?;
    Ok(bytes)
}

/// Replaces non-finite values of vector observations in place.
///
/// NaN becomes `0` and infinities the largest finite values of their sign.
/// At most one warning is logged per call. Returns whether anything was
/// replaced.
pub fn sanitize_observations(rows: &mut [Vec<f32>]) -> bool {
    let mut has_nan = false;
    let mut has_inf = false;
    for v in rows.iter_mut().flat_map(|r| r.iter_mut()) {
        if v.is_nan() {
            has_nan = true;
            *v = 0.0;
        } else if v.is_infinite() {
            has_inf = true;
            *v = if *v > 0.0 { f32::MAX } else { f32::MIN };
        }
    }
    if has_nan {
        warn!("An agent had a NaN observation in the environment");
    } else if has_inf {
        warn!("An agent had an infinite observation in the environment");
    }
    has_nan || has_inf
}

/// Batched `i`-th observation of the given agents, one flattened row per agent.
pub fn observation_to_array(
    agent_infos: &[&AgentInfoMessage],
    obs_index: usize,
    spec: &ObservationSpec,
) -> Result<Vec<Vec<f32>>> {
    let mut rows = agent_infos
        .iter()
        .map(|info| {
            let obs = info.observations.get(obs_index).ok_or_else(|| {
                MlAgentsError::Decode(format!("agent {} has no observation {}", info.id, obs_index))
            })?;
            let row = match &obs.data {
                ObservationData::Float(values) => values.clone(),
                ObservationData::Compressed(bytes) => {
                    let grayscale = spec.shape.get(2) == Some(&1);
                    process_pixels(bytes, grayscale)?
                }
            };
            if row.len() != spec.flat_size() {
                return Err(MlAgentsError::Decode(format!(
                    "observation {} of agent {} has {} values, expected shape {:?}",
                    obs_index,
                    info.id,
                    row.len(),
                    spec.shape
                ))
                .into());
            }
            Ok(row)
        })
        .collect::<Result<Vec<_>>>()?;

    if !spec.is_visual() {
        sanitize_observations(&mut rows);
    }
    Ok(rows)
}

/// Splits agent infos into agents requesting a decision and agents that ended an episode.
pub fn steps_from_messages(
    agent_infos: &[AgentInfoMessage],
    behavior_spec: &BehaviorSpec,
) -> Result<(DecisionSteps, TerminalSteps)> {
    let (terminal, decision): (Vec<&AgentInfoMessage>, Vec<&AgentInfoMessage>) =
        agent_infos.iter().partition(|info| info.done);

    let obs_of = |infos: &[&AgentInfoMessage]| -> Result<Vec<Vec<Vec<f32>>>> {
        behavior_spec
            .observation_specs
            .iter()
            .enumerate()
            .map(|(i, spec)| observation_to_array(infos, i, spec))
            .collect()
    };

    let action_spec = &behavior_spec.action_spec;
    let action_mask = if action_spec.discrete_size() > 0
        && decision.iter().any(|info| !info.action_mask.is_empty())
    {
        let width = action_spec.discrete_mask_size();
        Some(
            decision
                .iter()
                .map(|info| {
                    if info.action_mask.len() == width {
                        info.action_mask.clone()
                    } else {
                        vec![false; width]
                    }
                })
                .collect(),
        )
    } else {
        None
    };

    let decision_steps = DecisionSteps {
        obs: obs_of(&decision)?,
        reward: decision.iter().map(|i| i.reward).collect(),
        agent_id: decision.iter().map(|i| i.id).collect(),
        action_mask,
        group_id: decision.iter().map(|i| i.group_id).collect(),
        group_reward: decision.iter().map(|i| i.group_reward).collect(),
    };
    let terminal_steps = TerminalSteps {
        obs: obs_of(&terminal)?,
        reward: terminal.iter().map(|i| i.reward).collect(),
        interrupted: terminal.iter().map(|i| i.max_step_reached).collect(),
        agent_id: terminal.iter().map(|i| i.id).collect(),
        group_id: terminal.iter().map(|i| i.group_id).collect(),
        group_reward: terminal.iter().map(|i| i.group_reward).collect(),
    };
    Ok((decision_steps, terminal_steps))
}

/// Builds the behavior spec from the handshake parameters and a sample agent info.
pub fn behavior_spec_from_messages(
    brain_params: &BrainParametersMessage,
    agent_info: &AgentInfoMessage,
) -> BehaviorSpec {
    let observation_specs = agent_info
        .observations
        .iter()
        .map(|obs| {
            let mut spec = ObservationSpec::new(obs.shape.clone(), obs.name.clone());
            if obs.dimension_properties.len() == obs.shape.len() {
                spec.dimension_property = obs.dimension_properties.clone();
            }
            spec.observation_type = obs.observation_type;
            spec
        })
        .collect();

    let action_spec = match &brain_params.action_spec {
        Some(a) => ActionSpec::new(a.num_continuous_actions, a.discrete_branch_sizes.clone()),
        None if brain_params.vector_action_space_type_deprecated == 0 => {
            ActionSpec::create_discrete(brain_params.vector_action_size_deprecated.clone())
        }
        None => ActionSpec::create_continuous(
            brain_params
                .vector_action_size_deprecated
                .first()
                .copied()
                .unwrap_or(0),
        ),
    };
    BehaviorSpec::new(observation_specs, action_spec)
}
