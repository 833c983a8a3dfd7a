use crate::{
    distributions::{ActionTensors, LogProbTensors},
    loss::{trust_region_policy_loss, trust_region_value_loss},
    networks::ValueNetwork,
    opt::{Optimizer, OptimizerConfig},
    policy::CandlePolicy,
    sequence::{evaluate_by_sequence, MemoryDict},
    util::{
        field_to_tensor, masked_mean, obs_to_tensors, rows_to_tensor, scalars_to_tensor,
        sequence_starts, to_scalar,
    },
};
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::trace;
use mlagents_core::{
    buffer::{AgentBuffer, BufferKey},
    error::MlAgentsError,
    policy::Policy,
    record::{Record, RecordValue},
    reward::{create_reward_providers, RewardProvider},
    schedule::DecayedValue,
    settings::{Hyperparameters, PpoSettings, TrainerSettings},
};
use std::collections::BTreeMap;

/// Value estimates of the steps of a trajectory.
#[derive(Debug, Clone, Default)]
pub struct TrajectoryValues {
    /// Estimate of every step per reward stream.
    pub value_estimates: BTreeMap<String, Vec<f32>>,
    /// Estimate of the observation after the last step, 0 for a finished episode.
    pub value_next: BTreeMap<String, f32>,
    /// Critic memory at the start of the sequence of each step, for recurrent critics.
    pub memories: Option<Vec<Vec<f32>>>,
}

/// Evaluates a critic on a trajectory, sequence by sequence for recurrent critics.
///
/// The memory of a recurrent critic is carried between the trajectories of
/// an agent and dropped when its episode ends.
#[allow(clippy::too_many_arguments)]
pub(crate) fn trajectory_value_estimates(
    critic: &ValueNetwork,
    memory_dict: &mut MemoryDict,
    reward_signals: &[Box<dyn RewardProvider>],
    obs: &[Tensor],
    next_obs: &[Vec<f32>],
    sequence_length: usize,
    done: bool,
    agent_id: &str,
) -> Result<TrajectoryValues> {
    let device = obs
        .first()
        .map(|o| o.device().clone())
        .unwrap_or(Device::Cpu);
    let n = obs.first().map_or(Ok(0), |o| o.dim(0))?;
    let next_obs = next_obs
        .iter()
        .map(|o| rows_to_tensor(&[o.clone()], &device))
        .collect::<Result<Vec<_>>>()?;

    let (values, next_memory, memories) = match critic.memory_size() > 0 {
        true => {
            let initial = memory_dict.get(agent_id, &device)?;
            let eval = evaluate_by_sequence(n, sequence_length, initial, |start, len, memory| {
                let seq_obs = obs
                    .iter()
                    .map(|o| o.narrow(0, start, len))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                let (values, memory) = critic.critic_pass(&seq_obs, Some(memory), len)?;
                let memory = memory.ok_or_else(|| {
                    MlAgentsError::Config("a recurrent critic returned no memory".to_string())
                })?;
                Ok((values, memory))
            })?;
            (eval.values, Some(eval.next_memory), Some(eval.memories))
        }
        false => {
            let (values, _) = critic.critic_pass(obs, None, 1)?;
            (values, None, None)
        }
    };
    let (next_values, _) = critic.critic_pass(&next_obs, next_memory.as_ref(), 1)?;

    let mut value_estimates = BTreeMap::new();
    let mut value_next = BTreeMap::new();
    for signal in reward_signals.iter() {
        let name = signal.name().to_string();
        let missing = || MlAgentsError::Config(format!("the critic has no head {}", name));
        let v = values.get(&name).ok_or_else(missing)?.to_vec1::<f32>()?;
        let next = match done && !signal.ignore_done() {
            true => 0.0,
            false => next_values.get(&name).ok_or_else(missing)?.to_vec1::<f32>()?[0],
        };
        value_estimates.insert(name.clone(), v);
        value_next.insert(name, next);
    }

    match (done, &next_memory) {
        (true, _) => memory_dict.remove(agent_id),
        (false, Some(m)) => memory_dict.set(agent_id, m)?,
        (false, None) => {}
    }

    Ok(TrajectoryValues {
        value_estimates,
        value_next,
        memories,
    })
}

/// The initial memories of the sequences of a batch, `None` without memory.
pub(crate) fn batch_memories(
    batch: &AgentBuffer,
    key: &BufferKey,
    use_recurrent: bool,
    sequence_length: usize,
    device: &Device,
) -> Result<Option<Tensor>> {
    match use_recurrent {
        true => Ok(Some(sequence_starts(
            batch.field(key)?,
            sequence_length,
            device,
        )?)),
        false => Ok(None),
    }
}

/// Action masks of a batch, `None` without discrete actions.
pub(crate) fn batch_action_masks(
    batch: &AgentBuffer,
    policy: &CandlePolicy,
) -> Result<Option<Tensor>> {
    match policy.behavior_spec().action_spec.discrete_size() > 0 {
        true => Ok(Some(field_to_tensor(
            batch.field(&BufferKey::ActionMask)?,
            policy.device(),
        )?)),
        false => Ok(None),
    }
}

/// PPO optimizer of a [`CandlePolicy`] and a critic with one head per reward signal.
pub struct PpoOptimizer {
    hyperparameters: PpoSettings,
    critic_varmap: VarMap,
    critic: ValueNetwork,
    optimizer: Optimizer,
    reward_signals: Vec<Box<dyn RewardProvider>>,
    decay_learning_rate: DecayedValue,
    decay_epsilon: DecayedValue,
    decay_beta: DecayedValue,
    critic_memory_dict: MemoryDict,
    device: Device,
}

impl PpoOptimizer {
    pub fn new(policy: &CandlePolicy, trainer_settings: &TrainerSettings) -> Result<Self> {
        let hyperparameters = match &trainer_settings.hyperparameters {
            Hyperparameters::Ppo(h) => h.clone(),
            h => {
                return Err(MlAgentsError::Config(format!(
                    "PPO optimizer got {} hyperparameters",
                    h.trainer_type()
                ))
                .into())
            }
        };
        let reward_signals = create_reward_providers(trainer_settings.reward_signals.iter(), false);
        let stream_names: Vec<String> = reward_signals.iter().map(|r| r.name().to_string()).collect();

        let device = policy.device().clone();
        let critic_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&critic_varmap, DType::F32, &device);
        let critic = ValueNetwork::new(
            vb.pp("critic"),
            &stream_names,
            &policy.behavior_spec().observation_specs,
            policy.network_settings(),
            0,
            1,
        )?;

        let mut vars = policy.varmap().all_vars();
        vars.extend(critic_varmap.all_vars());
        let optimizer = OptimizerConfig::default()
            .learning_rate(hyperparameters.learning_rate as f64)
            .build(vars)?;

        let max_steps = trainer_settings.max_steps;
        let decay_learning_rate = DecayedValue::new(
            hyperparameters.learning_rate_schedule,
            hyperparameters.learning_rate,
            1e-10,
            max_steps,
        );
        let decay_epsilon = DecayedValue::new(
            hyperparameters.epsilon_schedule(),
            hyperparameters.epsilon,
            0.1,
            max_steps,
        );
        let decay_beta = DecayedValue::new(
            hyperparameters.beta_schedule(),
            hyperparameters.beta,
            1e-5,
            max_steps,
        );

        Ok(Self {
            hyperparameters,
            critic_memory_dict: MemoryDict::new(critic.memory_size()),
            critic_varmap,
            critic,
            optimizer,
            reward_signals,
            decay_learning_rate,
            decay_epsilon,
            decay_beta,
            device,
        })
    }

    pub fn hyperparameters(&self) -> &PpoSettings {
        &self.hyperparameters
    }

    pub fn reward_signals(&self) -> &[Box<dyn RewardProvider>] {
        &self.reward_signals
    }

    pub fn critic_varmap(&self) -> &VarMap {
        &self.critic_varmap
    }

    pub fn update_normalization(&self, policy: &CandlePolicy, buffer: &AgentBuffer) -> Result<()> {
        if policy.network_settings().normalize {
            let obs = obs_to_tensors(buffer, policy.num_obs(), &self.device)?;
            self.critic.update_normalization(&obs)?;
        }
        Ok(())
    }

    /// Value estimates of a trajectory converted into a buffer.
    ///
    /// `done` is whether the episode ended for real, not by a step limit.
    pub fn get_trajectory_value_estimates(
        &mut self,
        policy: &CandlePolicy,
        batch: &AgentBuffer,
        next_obs: &[Vec<f32>],
        done: bool,
        agent_id: &str,
    ) -> Result<TrajectoryValues> {
        let obs = obs_to_tensors(batch, policy.num_obs(), &self.device)?;
        trajectory_value_estimates(
            &self.critic,
            &mut self.critic_memory_dict,
            &self.reward_signals,
            &obs,
            next_obs,
            policy.sequence_length(),
            done,
            agent_id,
        )
    }

    /// One gradient step on a mini batch of `num_sequences` sequences.
    pub fn update(
        &mut self,
        policy: &CandlePolicy,
        batch: &AgentBuffer,
        num_sequences: usize,
    ) -> Result<Record> {
        let step = policy.get_current_step();
        let learning_rate = self.decay_learning_rate.get_value(step) as f64;
        let epsilon = self.decay_epsilon.get_value(step) as f64;
        let beta = self.decay_beta.get_value(step) as f64;
        let seq_len = policy.sequence_length();
        let device = &self.device;
        trace!(
            "PPO update on {} sequences of {} steps",
            num_sequences,
            seq_len
        );

        let mut old_values = BTreeMap::new();
        let mut returns = BTreeMap::new();
        for signal in self.reward_signals.iter() {
            let name = signal.name().to_string();
            let key = BufferKey::ValueEstimates(name.clone());
            old_values.insert(name.clone(), scalars_to_tensor(batch, &key, device)?);
            let key = BufferKey::Returns(name.clone());
            returns.insert(name, scalars_to_tensor(batch, &key, device)?);
        }

        let obs = obs_to_tensors(batch, policy.num_obs(), device)?;
        let action_spec = &policy.behavior_spec().action_spec;
        let actions = ActionTensors::from_buffer(batch, action_spec, device)?;
        let masks = batch_action_masks(batch, policy)?;
        let use_recurrent = policy.use_recurrent();
        let memories = batch_memories(batch, &BufferKey::Memory, use_recurrent, seq_len, device)?;
        let value_memories =
            batch_memories(batch, &BufferKey::CriticMemory, use_recurrent, seq_len, device)?;

        let (log_probs, entropy) = policy.evaluate_actions(
            &obs,
            &actions,
            masks.as_ref(),
            memories.as_ref(),
            seq_len,
        )?;
        let (values, _) = self.critic.critic_pass(&obs, value_memories.as_ref(), seq_len)?;
        let old_log_probs = LogProbTensors::from_buffer(batch, action_spec, device)?.flatten()?;
        let log_probs = log_probs.flatten()?;
        let loss_masks = scalars_to_tensor(batch, &BufferKey::Masks, device)?;

        let value_loss =
            trust_region_value_loss(&values, &old_values, &returns, epsilon, &loss_masks)?;
        let advantages = scalars_to_tensor(batch, &BufferKey::Advantages, device)?;
        let policy_loss = trust_region_policy_loss(
            &advantages,
            &log_probs,
            &old_log_probs,
            &loss_masks,
            epsilon,
        )?;
        let entropy = masked_mean(&entropy, &loss_masks)?;
        let loss = ((&policy_loss + (0.5 * &value_loss)?)? - (beta * &entropy)?)?;

        self.optimizer.set_learning_rate(learning_rate);
        self.optimizer.backward_step(&loss)?;

        Ok(Record::from_slice(&[
            (
                "Losses/Policy Loss",
                RecordValue::Scalar(to_scalar(&policy_loss)?.abs()),
            ),
            ("Losses/Value Loss", RecordValue::Scalar(to_scalar(&value_loss)?)),
            ("Policy/Learning Rate", RecordValue::Scalar(learning_rate as f32)),
            ("Policy/Epsilon", RecordValue::Scalar(epsilon as f32)),
            ("Policy/Beta", RecordValue::Scalar(beta as f32)),
        ]))
    }

    /// Trains the reward providers on a mini batch.
    pub fn update_reward_signals(&mut self, batch: &AgentBuffer) -> Result<Record> {
        let mut record = Record::empty();
        for signal in self.reward_signals.iter_mut() {
            record.merge_inplace(signal.update(batch)?);
        }
        Ok(record)
    }
}
