use crate::{
    mlp::{Mlp, MlpConfig},
    model::SubModel1,
    networks::{lstm_sequences, ObsEncoder, ValueHeads},
    util::{rows_to_tensor, vec_to_tensor},
};
use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{
    rnn::{lstm, LSTMConfig, LSTM},
    VarBuilder,
};
use mlagents_core::{
    behavior::{ActionSpec, ObservationSpec},
    error::MlAgentsError,
    settings::NetworkSettings,
};
use std::collections::BTreeMap;

/// Observations, and optionally the action, of one agent of a group.
#[derive(Debug, Clone)]
pub struct AgentInputs {
    /// One `[n, d]` tensor per observation, zero at steps where the agent is absent.
    pub obs: Vec<Tensor>,
    /// Continuous actions followed by the one-hot discrete actions, `[n, a]`.
    pub action: Option<Tensor>,
    /// 1 at steps where the agent is present, `[n]`.
    pub present: Tensor,
}

impl AgentInputs {
    /// Inputs of an agent present at every step.
    pub fn present(obs: Vec<Tensor>) -> Result<Self> {
        let first = obs
            .first()
            .ok_or_else(|| MlAgentsError::Config("an agent needs observations".to_string()))?;
        let n = first.dim(0)?;
        let present = Tensor::ones(n, candle_core::DType::F32, first.device())?;
        Ok(Self {
            obs,
            action: None,
            present,
        })
    }

    /// Inputs from rows `obs[i][t]` of the i-th observation at step t.
    ///
    /// Absent teammates are padded with NaN; a step whose first observation
    /// is NaN is absent and all its NaN values become zero.
    pub fn from_rows(
        obs: &[Vec<Vec<f32>>],
        action: Option<Vec<Vec<f32>>>,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let first = obs
            .first()
            .ok_or_else(|| MlAgentsError::Config("an agent needs observations".to_string()))?;
        let present: Vec<f32> = first
            .iter()
            .map(|row| match row.first() {
                Some(v) if v.is_nan() => 0.0,
                _ => 1.0,
            })
            .collect();
        let zero_nans = |rows: &[Vec<f32>]| -> Vec<Vec<f32>> {
            rows.iter()
                .map(|r| r.iter().map(|v| if v.is_nan() { 0.0 } else { *v }).collect())
                .collect()
        };
        let obs = obs
            .iter()
            .map(|rows| rows_to_tensor(&zero_nans(rows), device))
            .collect::<Result<Vec<_>>>()?;
        let action = action
            .map(|rows| rows_to_tensor(&zero_nans(&rows), device))
            .transpose()?;
        Ok(Self {
            obs,
            action,
            present: vec_to_tensor(&present, device)?,
        })
    }

    /// Steps `start..start + len`.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            obs: self
                .obs
                .iter()
                .map(|o| o.narrow(0, start, len))
                .collect::<candle_core::Result<Vec<_>>>()?,
            action: self
                .action
                .as_ref()
                .map(|a| a.narrow(0, start, len))
                .transpose()?,
            present: self.present.narrow(0, start, len)?,
        })
    }
}

/// Flat actions of a teammate: continuous values then one-hot branches.
///
/// NaN discrete actions, as for an absent teammate, encode as all zeros.
pub(crate) fn flat_action_row(continuous: &[f32], discrete: &[f32], spec: &ActionSpec) -> Vec<f32> {
    let mut row = Vec::with_capacity(spec.continuous_size + spec.discrete_mask_size());
    row.extend((0..spec.continuous_size).map(|i| continuous.get(i).copied().unwrap_or(0.0)));
    for (b, &size) in spec.discrete_branches.iter().enumerate() {
        let mut one_hot = vec![0.0; size];
        if let Some(&a) = discrete.get(b) {
            if a.is_finite() && a >= 0.0 && (a as usize) < size {
                one_hot[a as usize] = 1.0;
            }
        }
        row.extend(one_hot);
    }
    row
}

/// Critic over a variable number of agents.
///
/// Every agent is embedded on its own, from its observations alone or
/// together with its action, and the embeddings of the present agents are
/// averaged. The average goes through a dense encoder, an optional LSTM
/// and one value head per reward stream.
pub struct ComaCritic {
    encoders: Vec<ObsEncoder>,
    obs_embedding: Mlp,
    obs_action_embedding: Mlp,
    linear_encoder: Mlp,
    lstm: Option<LSTM>,
    m_size: usize,
    heads: ValueHeads,
}

impl ComaCritic {
    pub fn new(
        vb: VarBuilder,
        stream_names: &[String],
        observation_specs: &[ObservationSpec],
        settings: &NetworkSettings,
        action_spec: &ActionSpec,
    ) -> Result<Self> {
        if settings.num_layers == 0 {
            return Err(MlAgentsError::Config("num_layers must be positive".to_string()).into());
        }
        let encoders = observation_specs
            .iter()
            .enumerate()
            .map(|(i, spec)| ObsEncoder::new(vb.pp(format!("obs{}", i)), spec, settings))
            .collect::<Result<Vec<_>>>()?;
        let obs_size: usize = encoders.iter().map(|e| e.output_size()).sum();
        let action_size = action_spec.continuous_size + action_spec.discrete_mask_size();
        let h_size = settings.hidden_units;

        let obs_embedding = Mlp::build(vb.pp("obs_embedding"), MlpConfig::encoder(obs_size, 1, h_size))?;
        let obs_action_embedding = Mlp::build(
            vb.pp("obs_action_embedding"),
            MlpConfig::encoder(obs_size + action_size, 1, h_size),
        )?;
        let linear_encoder = Mlp::build(
            vb.pp("linear_encoder"),
            MlpConfig::encoder(h_size, settings.num_layers, h_size),
        )?;
        let (lstm, m_size) = match &settings.memory {
            Some(memory) => (
                Some(lstm(h_size, memory.memory_size / 2, LSTMConfig::default(), vb.pp("lstm"))?),
                memory.memory_size,
            ),
            None => (None, 0),
        };
        let encoding_size = match lstm {
            Some(_) => m_size / 2,
            None => h_size,
        };
        let heads = ValueHeads::new(vb.pp("value_heads"), stream_names, encoding_size, 1)?;

        Ok(Self {
            encoders,
            obs_embedding,
            obs_action_embedding,
            linear_encoder,
            lstm,
            m_size,
            heads,
        })
    }

    pub fn memory_size(&self) -> usize {
        self.m_size
    }

    /// Updates the normalizers with the observations of the trained agent.
    pub fn update_normalization(&self, obs: &[Tensor]) -> Result<()> {
        for (encoder, xs) in self.encoders.iter().zip(obs.iter()) {
            encoder.update_normalization(xs)?;
        }
        Ok(())
    }

    fn embed(&self, agent: &AgentInputs, with_action: bool) -> Result<Tensor> {
        if agent.obs.len() != self.encoders.len() {
            return Err(MlAgentsError::Config(format!(
                "expected {} observations, got {}",
                self.encoders.len(),
                agent.obs.len()
            ))
            .into());
        }
        let mut encodings = self
            .encoders
            .iter()
            .zip(agent.obs.iter())
            .map(|(e, xs)| e.forward(xs))
            .collect::<Result<Vec<_>>>()?;
        match (with_action, &agent.action) {
            (true, Some(a)) => {
                encodings.push(a.clone());
                self.obs_action_embedding.forward(&Tensor::cat(&encodings, 1)?)
            }
            (true, None) => Err(MlAgentsError::Config("a teammate has no action".to_string()).into()),
            (false, _) => self.obs_embedding.forward(&Tensor::cat(&encodings, 1)?),
        }
    }

    /// Mean of the embeddings of the present agents, `[n, h]`.
    fn pool(&self, embeddings: &[Tensor], present: &[Tensor]) -> Result<Tensor> {
        let embeddings = Tensor::stack(embeddings, 1)?;
        let present = Tensor::stack(present, 1)?;
        let count = present.sum_keepdim(1)?.clamp(1.0, f64::MAX)?;
        let sum = embeddings
            .broadcast_mul(&present.unsqueeze(D::Minus1)?)?
            .sum(1)?;
        Ok(sum.broadcast_div(&count)?)
    }

    fn forward(
        &self,
        embeddings: &[Tensor],
        present: &[Tensor],
        memories: Option<&Tensor>,
        sequence_length: usize,
    ) -> Result<(BTreeMap<String, Tensor>, Option<Tensor>)> {
        let pooled = self.pool(embeddings, present)?;
        let encoding = self.linear_encoder.forward(&pooled)?;
        let (encoding, memories) = match &self.lstm {
            None => (encoding, None),
            Some(lstm) => {
                let (encoding, memories) =
                    lstm_sequences(lstm, &encoding, memories, sequence_length, self.m_size)?;
                (encoding, Some(memories))
            }
        };
        let values = self
            .heads
            .forward(&encoding)?
            .into_iter()
            .map(|(k, v)| Ok((k, v.squeeze(1)?)))
            .collect::<Result<_>>()?;
        Ok((values, memories))
    }

    /// Values of the state of the group, `[n]` per stream.
    ///
    /// `agents` holds the trained agent first, then its teammates.
    pub fn critic_pass(
        &self,
        agents: &[AgentInputs],
        memories: Option<&Tensor>,
        sequence_length: usize,
    ) -> Result<(BTreeMap<String, Tensor>, Option<Tensor>)> {
        let embeddings = agents
            .iter()
            .map(|a| self.embed(a, false))
            .collect::<Result<Vec<_>>>()?;
        let present: Vec<Tensor> = agents.iter().map(|a| a.present.clone()).collect();
        self.forward(&embeddings, &present, memories, sequence_length)
    }

    /// Values of the state given the actions of the teammates, `[n]` per stream.
    pub fn baseline(
        &self,
        agent: &AgentInputs,
        teammates: &[AgentInputs],
        memories: Option<&Tensor>,
        sequence_length: usize,
    ) -> Result<(BTreeMap<String, Tensor>, Option<Tensor>)> {
        let mut embeddings = vec![self.embed(agent, false)?];
        let mut present = vec![agent.present.clone()];
        for teammate in teammates {
            embeddings.push(self.embed(teammate, true)?);
            present.push(teammate.present.clone());
        }
        self.forward(&embeddings, &present, memories, sequence_length)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn critic(varmap: &VarMap) -> Result<ComaCritic> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        ComaCritic::new(
            vb,
            &["extrinsic".to_string()],
            &[ObservationSpec::new(vec![3], "vector")],
            &NetworkSettings::default().hidden_units(8).num_layers(1),
            &ActionSpec::new(1, vec![2]),
        )
    }

    #[test]
    fn test_flat_action_row() {
        let spec = ActionSpec::new(1, vec![2, 3]);
        assert_eq!(
            flat_action_row(&[0.5], &[1.0, 2.0], &spec),
            vec![0.5, 0.0, 1.0, 0.0, 0.0, 1.0]
        );
        // Missing teammates have neither continuous nor discrete actions.
        assert_eq!(flat_action_row(&[], &[f32::NAN, f32::NAN], &spec), vec![0.0; 6]);
    }

    #[test]
    fn test_absent_teammates_are_ignored() -> Result<()> {
        let varmap = VarMap::new();
        let critic = critic(&varmap)?;
        let agent = AgentInputs::present(vec![Tensor::ones((2, 3), DType::F32, &Device::Cpu)?])?;

        // The teammate is present at the first step only.
        let rows = vec![vec![vec![0.5; 3], vec![f32::NAN; 3]]];
        let teammate = AgentInputs::from_rows(&rows, Some(vec![vec![0.1, 1.0, 0.0]; 2]), &Device::Cpu)?;
        assert_eq!(teammate.present.to_vec1::<f32>()?, vec![1.0, 0.0]);
        assert_eq!(teammate.obs[0].to_vec2::<f32>()?[1], vec![0.0; 3]);

        let (alone, _) = critic.critic_pass(&[agent.clone()], None, 1)?;
        let (group, _) = critic.critic_pass(&[agent.clone(), teammate.clone()], None, 1)?;
        let alone = alone["extrinsic"].to_vec1::<f32>()?;
        let group = group["extrinsic"].to_vec1::<f32>()?;
        assert_ne!(alone[0], group[0]);
        assert!((alone[1] - group[1]).abs() < 1e-6);

        let (baseline, memories) = critic.baseline(&agent, &[teammate], None, 1)?;
        assert_eq!(baseline["extrinsic"].dims(), [2]);
        assert!(memories.is_none());
        Ok(())
    }
}
