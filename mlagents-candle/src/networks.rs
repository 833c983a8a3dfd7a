//! Observation encoders, network bodies, value heads and the actor.
//!
//! A [`NetworkBody`] encodes every observation of an agent, concatenates
//! the encodings and feeds them through a dense encoder and, with memory,
//! an LSTM. Memories of an agent are the hidden and cell states of the LSTM
//! concatenated, so their size is twice the LSTM width.
use crate::{
    distributions::{ActionModel, ActionOutput, ActionTensors, LogProbTensors},
    mlp::{Mlp, MlpConfig},
    model::SubModel1,
};
use anyhow::Result;
use candle_core::{Tensor, Var};
use candle_nn::{
    conv2d, linear,
    rnn::{lstm, LSTMConfig, LSTMState, LSTM, RNN},
    Conv2d, Conv2dConfig, Init, Linear, Module, VarBuilder,
};
use mlagents_core::{
    behavior::{ActionSpec, ObservationSpec},
    error::MlAgentsError,
    settings::{EncoderType, NetworkSettings},
};
use rand::Rng;
use std::collections::BTreeMap;

/// Normalized observations are clipped to this range.
const NORMALIZATION_CLIP: f64 = 5.0;

/// Running mean and variance of vector observations.
///
/// The statistics are variables of the network so that they are saved and
/// shared with the network weights, but no gradient flows into them.
pub struct Normalizer {
    running_mean: Var,
    running_variance: Var,
    normalization_steps: Var,
}

impl Normalizer {
    pub fn new(vb: VarBuilder, size: usize) -> Result<Self> {
        let var = |name: &str, shape: usize, v: f64| -> Result<Var> {
            Ok(Var::from_tensor(&vb.get_with_hints(shape, name, Init::Const(v))?)?)
        };
        Ok(Self {
            running_mean: var("running_mean", size, 0.0)?,
            running_variance: var("running_variance", size, 1.0)?,
            normalization_steps: var("normalization_steps", 1, 1.0)?,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = self.running_mean.as_tensor().detach();
        let var = self
            .running_variance
            .as_tensor()
            .broadcast_div(self.normalization_steps.as_tensor())?
            .detach();
        Ok(xs
            .broadcast_sub(&mean)?
            .broadcast_div(&var.sqrt()?)?
            .clamp(-NORMALIZATION_CLIP, NORMALIZATION_CLIP)?)
    }

    /// Adds a batch `[n, size]` to the statistics.
    pub fn update(&self, xs: &Tensor) -> Result<()> {
        let xs = xs.detach();
        let mean = self.running_mean.as_tensor();
        let steps = self.normalization_steps.as_tensor();
        let total_steps = (steps + xs.dim(0)? as f64)?;

        let to_old_mean = xs.broadcast_sub(mean)?;
        let new_mean = (mean + to_old_mean.broadcast_div(&total_steps)?.sum(0)?)?;
        let to_new_mean = xs.broadcast_sub(&new_mean)?;
        let new_variance =
            (self.running_variance.as_tensor() + (to_new_mean * to_old_mean)?.sum(0)?)?;

        self.running_mean.set(&new_mean)?;
        self.running_variance.set(&new_variance)?;
        self.normalization_steps.set(&total_steps)?;
        Ok(())
    }
}

/// Convolutional or dense encoder of an image observation.
pub struct VisualEncoder {
    convs: Vec<Conv2d>,
    dense: Linear,
    shape: (usize, usize, usize),
}

impl VisualEncoder {
    /// Smallest height or width the convolutions accept.
    pub const MIN_RESOLUTION: usize = 20;

    pub fn new(
        vb: VarBuilder,
        shape: &[usize],
        output_size: usize,
        encoder_type: EncoderType,
    ) -> Result<Self> {
        let (h, w, c) = match shape {
            [h, w, c] => (*h, *w, *c),
            _ => {
                return Err(
                    MlAgentsError::Config(format!("{:?} is not an image shape", shape)).into(),
                )
            }
        };
        let (convs, flat_size) = match encoder_type {
            EncoderType::FullyConnected => (vec![], h * w * c),
            EncoderType::Simple => {
                if h < Self::MIN_RESOLUTION || w < Self::MIN_RESOLUTION {
                    return Err(MlAgentsError::Config(format!(
                        "visual observations of {}x{} are smaller than the minimum {}x{} of the simple encoder",
                        h,
                        w,
                        Self::MIN_RESOLUTION,
                        Self::MIN_RESOLUTION
                    ))
                    .into());
                }
                let stride = |s| Conv2dConfig {
                    stride: s,
                    ..Default::default()
                };
                let convs = vec![
                    conv2d(c, 16, 8, stride(4), vb.pp("conv0"))?,
                    conv2d(16, 32, 4, stride(2), vb.pp("conv1"))?,
                ];
                let out = |x: usize, k: usize, s: usize| (x - k) / s + 1;
                let (h, w) = (out(out(h, 8, 4), 4, 2), out(out(w, 8, 4), 4, 2));
                (convs, 32 * h * w)
            }
        };
        let dense = linear(flat_size, output_size, vb.pp("dense"))?;
        Ok(Self {
            convs,
            dense,
            shape: (h, w, c),
        })
    }

    /// Encodes flattened images `[n, h * w * c]` in height, width, channel order.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (h, w, c) = self.shape;
        let n = xs.dim(0)?;
        let mut xs = match self.convs.is_empty() {
            true => xs.clone(),
            false => xs.reshape((n, h, w, c))?.permute((0, 3, 1, 2))?.contiguous()?,
        };
        for conv in self.convs.iter() {
            xs = conv.forward(&xs)?.relu()?;
        }
        Ok(self.dense.forward(&xs.flatten_from(1)?)?.relu()?)
    }
}

/// Encoder of a single observation.
pub enum ObsEncoder {
    /// Vector observations are passed through, optionally normalized.
    Vector {
        size: usize,
        normalizer: Option<Normalizer>,
    },
    Visual {
        size: usize,
        encoder: VisualEncoder,
    },
}

impl ObsEncoder {
    pub fn new(
        vb: VarBuilder,
        spec: &ObservationSpec,
        settings: &NetworkSettings,
    ) -> Result<Self> {
        if spec.is_visual() {
            let size = settings.hidden_units;
            let encoder = VisualEncoder::new(vb, &spec.shape, size, settings.vis_encode_type)?;
            Ok(Self::Visual { size, encoder })
        } else {
            let size = spec.flat_size();
            let normalizer = match settings.normalize {
                true => Some(Normalizer::new(vb.pp("normalizer"), size)?),
                false => None,
            };
            Ok(Self::Vector { size, normalizer })
        }
    }

    pub fn output_size(&self) -> usize {
        match self {
            Self::Vector { size, .. } | Self::Visual { size, .. } => *size,
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Vector {
                normalizer: Some(n),
                ..
            } => n.forward(xs),
            Self::Vector { .. } => Ok(xs.clone()),
            Self::Visual { encoder, .. } => encoder.forward(xs),
        }
    }

    pub fn update_normalization(&self, xs: &Tensor) -> Result<()> {
        if let Self::Vector {
            normalizer: Some(n),
            ..
        } = self
        {
            n.update(xs)?;
        }
        Ok(())
    }
}

/// Encoders of all observations followed by a dense encoder and an optional LSTM.
pub struct NetworkBody {
    encoders: Vec<ObsEncoder>,
    linear_encoder: Mlp,
    lstm: Option<LSTM>,
    h_size: usize,
    m_size: usize,
}

impl NetworkBody {
    /// Builds the body of the given observations.
    ///
    /// With `encoded_act_size > 0`, an action of that size is concatenated to
    /// the observation encodings, as in action-value networks.
    pub fn new(
        vb: VarBuilder,
        observation_specs: &[ObservationSpec],
        settings: &NetworkSettings,
        encoded_act_size: usize,
    ) -> Result<Self> {
        if settings.num_layers == 0 {
            return Err(MlAgentsError::Config("num_layers must be positive".to_string()).into());
        }
        let encoders = observation_specs
            .iter()
            .enumerate()
            .map(|(i, spec)| ObsEncoder::new(vb.pp(format!("obs{}", i)), spec, settings))
            .collect::<Result<Vec<_>>>()?;
        let total_enc_size =
            encoders.iter().map(|e| e.output_size()).sum::<usize>() + encoded_act_size;
        let h_size = settings.hidden_units;
        let linear_encoder = Mlp::build(
            vb.pp("linear_encoder"),
            MlpConfig::encoder(total_enc_size, settings.num_layers, h_size),
        )?;
        let (lstm, m_size) = match &settings.memory {
            Some(memory) => {
                let hidden = memory.memory_size / 2;
                let lstm = lstm(h_size, hidden, LSTMConfig::default(), vb.pp("lstm"))?;
                (Some(lstm), memory.memory_size)
            }
            None => (None, 0),
        };
        Ok(Self {
            encoders,
            linear_encoder,
            lstm,
            h_size,
            m_size,
        })
    }

    /// Size of the memory of one agent, 0 without LSTM.
    pub fn memory_size(&self) -> usize {
        self.m_size
    }

    /// Size of the encoding returned by [`NetworkBody::forward`].
    pub fn output_size(&self) -> usize {
        match self.lstm {
            Some(_) => self.m_size / 2,
            None => self.h_size,
        }
    }

    pub fn update_normalization(&self, obs: &[Tensor]) -> Result<()> {
        for (encoder, xs) in self.encoders.iter().zip(obs.iter()) {
            encoder.update_normalization(xs)?;
        }
        Ok(())
    }

    /// Concatenated encodings of the observations, before the dense encoder.
    pub fn encode_observations(&self, obs: &[Tensor]) -> Result<Tensor> {
        if obs.len() != self.encoders.len() {
            return Err(MlAgentsError::Config(format!(
                "expected {} observations, got {}",
                self.encoders.len(),
                obs.len()
            ))
            .into());
        }
        let encodings = self
            .encoders
            .iter()
            .zip(obs.iter())
            .map(|(e, xs)| e.forward(xs))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&encodings, 1)?)
    }

    /// Encodes `n` steps.
    ///
    /// With an LSTM, the steps form `n / sequence_length` sequences and
    /// `memories` holds the initial memory of each sequence, `[n_seq, m_size]`.
    /// Returns the encoding `[n, output_size]` and the memories after the
    /// last step of each sequence.
    pub fn forward(
        &self,
        obs: &[Tensor],
        actions: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: usize,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let encoded = self.encode_observations(obs)?;
        let encoded = match actions {
            Some(a) => Tensor::cat(&[&encoded, a], 1)?,
            None => encoded,
        };
        let encoding = self.linear_encoder.forward(&encoded)?;
        match &self.lstm {
            None => Ok((encoding, None)),
            Some(lstm) => {
                let (encoding, memories) =
                    lstm_sequences(lstm, &encoding, memories, sequence_length, self.m_size)?;
                Ok((encoding, Some(memories)))
            }
        }
    }
}

/// Runs an LSTM over `n` encoded steps forming `n / sequence_length` sequences.
///
/// `memories` holds the initial memory of each sequence, `[n_seq, m_size]`,
/// zero when `None`. Returns the outputs `[n, m_size / 2]` and the memories
/// after the last step of each sequence.
pub(crate) fn lstm_sequences(
    lstm: &LSTM,
    encoding: &Tensor,
    memories: Option<&Tensor>,
    sequence_length: usize,
    m_size: usize,
) -> Result<(Tensor, Tensor)> {
    let (n, h_size) = encoding.dims2()?;
    let seq_len = sequence_length.max(1);
    if n % seq_len != 0 {
        return Err(MlAgentsError::Config(format!(
            "{} steps can not be split into sequences of {}",
            n, seq_len
        ))
        .into());
    }
    let n_seq = n / seq_len;
    let half = m_size / 2;
    let mut state = match memories {
        Some(m) => LSTMState::new(m.narrow(1, 0, half)?, m.narrow(1, half, half)?),
        None => lstm.zero_state(n_seq)?,
    };

    let encoding = encoding.reshape((n_seq, seq_len, h_size))?;
    let mut outputs = Vec::with_capacity(seq_len);
    for t in 0..seq_len {
        let x = encoding.narrow(1, t, 1)?.squeeze(1)?.contiguous()?;
        state = lstm.step(&x, &state)?;
        outputs.push(state.h().clone());
    }
    let outputs = Tensor::stack(&outputs, 1)?.reshape((n, half))?;
    let memories = Tensor::cat(&[state.h(), state.c()], 1)?;
    Ok((outputs, memories))
}

/// One linear head per reward stream.
pub struct ValueHeads {
    heads: Vec<(String, Linear)>,
}

impl ValueHeads {
    pub fn new(
        vb: VarBuilder,
        stream_names: &[String],
        input_size: usize,
        output_size: usize,
    ) -> Result<Self> {
        let heads = stream_names
            .iter()
            .map(|name| Ok((name.clone(), linear(input_size, output_size, vb.pp(name))?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { heads })
    }

    /// Outputs `[n, output_size]` per stream.
    pub fn forward(&self, xs: &Tensor) -> Result<BTreeMap<String, Tensor>> {
        self.heads
            .iter()
            .map(|(name, head)| Ok((name.clone(), head.forward(xs)?)))
            .collect()
    }
}

/// Critic estimating a value per reward stream.
///
/// Action-value networks take an action as an additional input and output
/// one value per discrete action.
pub struct ValueNetwork {
    body: NetworkBody,
    heads: ValueHeads,
}

impl ValueNetwork {
    pub fn new(
        vb: VarBuilder,
        stream_names: &[String],
        observation_specs: &[ObservationSpec],
        settings: &NetworkSettings,
        encoded_act_size: usize,
        outputs_per_stream: usize,
    ) -> Result<Self> {
        let body = NetworkBody::new(vb.pp("body"), observation_specs, settings, encoded_act_size)?;
        let heads = ValueHeads::new(
            vb.pp("value_heads"),
            stream_names,
            body.output_size(),
            outputs_per_stream,
        )?;
        Ok(Self { body, heads })
    }

    pub fn memory_size(&self) -> usize {
        self.body.memory_size()
    }

    pub fn update_normalization(&self, obs: &[Tensor]) -> Result<()> {
        self.body.update_normalization(obs)
    }

    /// Outputs of every stream, `[n, outputs_per_stream]`.
    pub fn forward(
        &self,
        obs: &[Tensor],
        actions: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: usize,
    ) -> Result<(BTreeMap<String, Tensor>, Option<Tensor>)> {
        let (encoding, memories) = self.body.forward(obs, actions, memories, sequence_length)?;
        Ok((self.heads.forward(&encoding)?, memories))
    }

    /// Value estimates of every stream, `[n]`.
    pub fn critic_pass(
        &self,
        obs: &[Tensor],
        memories: Option<&Tensor>,
        sequence_length: usize,
    ) -> Result<(BTreeMap<String, Tensor>, Option<Tensor>)> {
        let (values, memories) = self.forward(obs, None, memories, sequence_length)?;
        let values = values
            .into_iter()
            .map(|(k, v)| Ok((k, v.squeeze(1)?)))
            .collect::<Result<_>>()?;
        Ok((values, memories))
    }
}

/// Actor of a policy: a [`NetworkBody`] followed by an [`ActionModel`].
pub struct SimpleActor {
    body: NetworkBody,
    action_model: ActionModel,
}

impl SimpleActor {
    pub fn new(
        vb: VarBuilder,
        observation_specs: &[ObservationSpec],
        settings: &NetworkSettings,
        action_spec: &ActionSpec,
        conditional_sigma: bool,
        tanh_squash: bool,
    ) -> Result<Self> {
        let body = NetworkBody::new(vb.pp("body"), observation_specs, settings, 0)?;
        let action_model = ActionModel::new(
            vb.pp("action_model"),
            body.output_size(),
            action_spec,
            conditional_sigma,
            tanh_squash,
        )?;
        Ok(Self { body, action_model })
    }

    pub fn memory_size(&self) -> usize {
        self.body.memory_size()
    }

    pub fn update_normalization(&self, obs: &[Tensor]) -> Result<()> {
        self.body.update_normalization(obs)
    }

    /// Samples actions. Returns them with their statistics and the memories after the step.
    pub fn get_action_and_stats<R: Rng + ?Sized>(
        &self,
        obs: &[Tensor],
        masks: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: usize,
        rng: &mut R,
    ) -> Result<(ActionOutput, Option<Tensor>)> {
        let (encoding, memories) = self.body.forward(obs, None, memories, sequence_length)?;
        let output = self.action_model.forward(&encoding, masks, rng)?;
        Ok((output, memories))
    }

    /// Log probabilities and entropy of recorded actions.
    pub fn get_stats(
        &self,
        obs: &[Tensor],
        actions: &ActionTensors,
        masks: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: usize,
    ) -> Result<(LogProbTensors, Tensor)> {
        let (encoding, _) = self.body.forward(obs, None, memories, sequence_length)?;
        self.action_model.evaluate(&encoding, masks, actions)
    }

    pub fn env_action(&self, actions: &ActionTensors) -> Result<ActionTensors> {
        self.action_model.env_action(actions)
    }

    pub fn action_spec(&self) -> &ActionSpec {
        self.action_model.action_spec()
    }
}
