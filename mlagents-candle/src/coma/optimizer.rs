use super::networks::{flat_action_row, AgentInputs, ComaCritic};
use crate::{
    distributions::{ActionTensors, LogProbTensors},
    loss::{trust_region_policy_loss, trust_region_value_loss},
    opt::{Optimizer, OptimizerConfig},
    policy::CandlePolicy,
    ppo::{batch_action_masks, batch_memories},
    sequence::{evaluate_by_sequence, MemoryDict, SequenceEvaluation},
    util::{masked_mean, obs_to_tensors, rows_to_tensor, scalars_to_tensor, to_scalar},
};
use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use log::trace;
use mlagents_core::{
    behavior::BehaviorSpec,
    buffer::{AgentBuffer, BufferKey},
    error::MlAgentsError,
    policy::Policy,
    record::{Record, RecordValue},
    reward::{create_reward_providers, RewardProvider},
    schedule::DecayedValue,
    settings::{Hyperparameters, PpoSettings, TrainerSettings},
    trajectory::{split_teammates, GroupObsUtil},
};
use std::collections::BTreeMap;

/// Value and baseline estimates of the steps of a trajectory.
#[derive(Debug, Clone, Default)]
pub struct ComaTrajectoryValues {
    pub value_estimates: BTreeMap<String, Vec<f32>>,
    pub baseline_estimates: BTreeMap<String, Vec<f32>>,
    /// Value of the group state after the last step, 0 once the group is done.
    pub value_next: BTreeMap<String, f32>,
    pub value_memories: Option<Vec<Vec<f32>>>,
    pub baseline_memories: Option<Vec<Vec<f32>>>,
}

/// The teammates of the steps of a buffer with their actions.
pub(crate) fn teammate_inputs(
    buffer: &AgentBuffer,
    spec: &BehaviorSpec,
    device: &Device,
) -> Result<Vec<AgentInputs>> {
    let obs_sizes: Vec<usize> = spec.observation_specs.iter().map(|o| o.flat_size()).collect();
    let n = buffer.num_experiences();
    let group_obs = GroupObsUtil::from_buffer(buffer, &obs_sizes)?;
    let n_teammates = group_obs.iter().map(|o| o.len()).max().unwrap_or(0);

    let action_spec = &spec.action_spec;
    let split = |key: BufferKey, size: usize| {
        buffer
            .get(&key)
            .map(|f| split_teammates(f, size))
            .unwrap_or_default()
    };
    let continuous = split(BufferKey::GroupContinuousAction, action_spec.continuous_size);
    let discrete = split(BufferKey::GroupDiscreteAction, action_spec.discrete_size());

    (0..n_teammates)
        .map(|k| {
            let obs: Vec<Vec<Vec<f32>>> = group_obs
                .iter()
                .zip(obs_sizes.iter())
                .map(|(o, &size)| {
                    o.get(k)
                        .cloned()
                        .unwrap_or_else(|| vec![vec![f32::NAN; size]; n])
                })
                .collect();
            let actions = (0..n)
                .map(|t| {
                    let c = continuous.get(k).and_then(|rows| rows.get(t));
                    let d = discrete.get(k).and_then(|rows| rows.get(t));
                    flat_action_row(
                        c.map_or(&[][..], |r| r.as_slice()),
                        d.map_or(&[][..], |r| r.as_slice()),
                        action_spec,
                    )
                })
                .collect();
            AgentInputs::from_rows(&obs, Some(actions), device)
        })
        .collect()
}

/// COMA optimizer: PPO-style policy updates with a counterfactual baseline.
pub struct ComaOptimizer {
    hyperparameters: PpoSettings,
    critic_varmap: VarMap,
    critic: ComaCritic,
    optimizer: Optimizer,
    reward_signals: Vec<Box<dyn RewardProvider>>,
    decay_learning_rate: DecayedValue,
    decay_epsilon: DecayedValue,
    decay_beta: DecayedValue,
    value_memory_dict: MemoryDict,
    baseline_memory_dict: MemoryDict,
    device: Device,
}

impl ComaOptimizer {
    pub fn new(policy: &CandlePolicy, trainer_settings: &TrainerSettings) -> Result<Self> {
        let hyperparameters = match &trainer_settings.hyperparameters {
            Hyperparameters::Coma(h) => h.clone(),
            h => {
                return Err(MlAgentsError::Config(format!(
                    "COMA optimizer got {} hyperparameters",
                    h.trainer_type()
                ))
                .into())
            }
        };
        // Teammates share their rewards.
        let reward_signals = create_reward_providers(trainer_settings.reward_signals.iter(), true);
        let stream_names: Vec<String> = reward_signals.iter().map(|r| r.name().to_string()).collect();

        let device = policy.device().clone();
        let critic_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&critic_varmap, DType::F32, &device);
        let spec = policy.behavior_spec();
        let critic = ComaCritic::new(
            vb.pp("critic"),
            &stream_names,
            &spec.observation_specs,
            policy.network_settings(),
            &spec.action_spec,
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
            value_memory_dict: MemoryDict::new(critic.memory_size()),
            baseline_memory_dict: MemoryDict::new(critic.memory_size()),
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

    /// Value and baseline estimates of a trajectory converted into a buffer.
    ///
    /// `done` is whether the episode of the whole group ended for real.
    #[allow(clippy::too_many_arguments)]
    pub fn get_trajectory_and_baseline_value_estimates(
        &mut self,
        policy: &CandlePolicy,
        batch: &AgentBuffer,
        next_obs: &[Vec<f32>],
        next_group_obs: &[Vec<Vec<f32>>],
        done: bool,
        agent_id: &str,
    ) -> Result<ComaTrajectoryValues> {
        let device = self.device.clone();
        let n = batch.num_experiences();
        let agent = AgentInputs::present(obs_to_tensors(batch, policy.num_obs(), &device)?)?;
        let teammates = teammate_inputs(batch, policy.behavior_spec(), &device)?;
        let mut group = vec![agent.clone()];
        group.extend(teammates.iter().map(|t| AgentInputs {
            action: None,
            ..t.clone()
        }));

        let critic = &self.critic;
        let (values, baselines, value_memory, baseline_memory, memories) =
            match critic.memory_size() > 0 {
                true => {
                    let seq_len = policy.sequence_length();
                    let value_eval: SequenceEvaluation = evaluate_by_sequence(
                        n,
                        seq_len,
                        self.value_memory_dict.get(agent_id, &device)?,
                        |start, len, memory| {
                            let seq = group
                                .iter()
                                .map(|a| a.narrow(start, len))
                                .collect::<Result<Vec<_>>>()?;
                            let (values, memory) = critic.critic_pass(&seq, Some(memory), len)?;
                            Ok((values, memory.ok_or_else(no_memory)?))
                        },
                    )?;
                    let baseline_eval = evaluate_by_sequence(
                        n,
                        seq_len,
                        self.baseline_memory_dict.get(agent_id, &device)?,
                        |start, len, memory| {
                            let seq_agent = agent.narrow(start, len)?;
                            let seq_teammates = teammates
                                .iter()
                                .map(|t| t.narrow(start, len))
                                .collect::<Result<Vec<_>>>()?;
                            let (values, memory) =
                                critic.baseline(&seq_agent, &seq_teammates, Some(memory), len)?;
                            Ok((values, memory.ok_or_else(no_memory)?))
                        },
                    )?;
                    (
                        value_eval.values,
                        baseline_eval.values,
                        Some(value_eval.next_memory),
                        Some(baseline_eval.next_memory),
                        Some((value_eval.memories, baseline_eval.memories)),
                    )
                }
                false => {
                    let (values, _) = critic.critic_pass(&group, None, 1)?;
                    let (baselines, _) = critic.baseline(&agent, &teammates, None, 1)?;
                    (values, baselines, None, None, None)
                }
            };

        // The group after the last step.
        let mut next_group = vec![AgentInputs::present(
            next_obs
                .iter()
                .map(|o| rows_to_tensor(&[o.clone()], &device))
                .collect::<Result<Vec<_>>>()?,
        )?];
        for teammate_obs in next_group_obs.iter() {
            let rows: Vec<Vec<Vec<f32>>> = teammate_obs.iter().map(|o| vec![o.clone()]).collect();
            next_group.push(AgentInputs::from_rows(&rows, None, &device)?);
        }
        let (next_values, _) = critic.critic_pass(&next_group, value_memory.as_ref(), 1)?;

        let mut estimates = ComaTrajectoryValues::default();
        for signal in self.reward_signals.iter() {
            let name = signal.name().to_string();
            let missing = || MlAgentsError::Config(format!("the critic has no head {}", name));
            let v = values.get(&name).ok_or_else(missing)?.to_vec1::<f32>()?;
            let b = baselines.get(&name).ok_or_else(missing)?.to_vec1::<f32>()?;
            let next = match done && !signal.ignore_done() {
                true => 0.0,
                false => next_values.get(&name).ok_or_else(missing)?.to_vec1::<f32>()?[0],
            };
            estimates.value_estimates.insert(name.clone(), v);
            estimates.baseline_estimates.insert(name.clone(), b);
            estimates.value_next.insert(name, next);
        }
        if let Some((value_memories, baseline_memories)) = memories {
            estimates.value_memories = Some(value_memories);
            estimates.baseline_memories = Some(baseline_memories);
        }

        match (done, value_memory, baseline_memory) {
            (true, _, _) => {
                self.value_memory_dict.remove(agent_id);
                self.baseline_memory_dict.remove(agent_id);
            }
            (false, Some(v), Some(b)) => {
                self.value_memory_dict.set(agent_id, &v)?;
                self.baseline_memory_dict.set(agent_id, &b)?;
            }
            _ => {}
        }
        Ok(estimates)
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
        trace!("COMA update on {} sequences of {} steps", num_sequences, seq_len);

        let mut old_values = BTreeMap::new();
        let mut old_baselines = BTreeMap::new();
        let mut returns = BTreeMap::new();
        for signal in self.reward_signals.iter() {
            let name = signal.name().to_string();
            let key = BufferKey::ValueEstimates(name.clone());
            old_values.insert(name.clone(), scalars_to_tensor(batch, &key, device)?);
            let key = BufferKey::BaselineEstimates(name.clone());
            old_baselines.insert(name.clone(), scalars_to_tensor(batch, &key, device)?);
            let key = BufferKey::Returns(name.clone());
            returns.insert(name, scalars_to_tensor(batch, &key, device)?);
        }

        let obs = obs_to_tensors(batch, policy.num_obs(), device)?;
        let agent = AgentInputs::present(obs.clone())?;
        let teammates = teammate_inputs(batch, policy.behavior_spec(), device)?;
        let mut group = vec![agent.clone()];
        group.extend(teammates.iter().map(|t| AgentInputs {
            action: None,
            ..t.clone()
        }));

        let action_spec = &policy.behavior_spec().action_spec;
        let actions = ActionTensors::from_buffer(batch, action_spec, device)?;
        let masks = batch_action_masks(batch, policy)?;
        let use_recurrent = policy.use_recurrent();
        let memories = batch_memories(batch, &BufferKey::Memory, use_recurrent, seq_len, device)?;
        let value_memories =
            batch_memories(batch, &BufferKey::CriticMemory, use_recurrent, seq_len, device)?;
        let baseline_memories =
            batch_memories(batch, &BufferKey::BaselineMemory, use_recurrent, seq_len, device)?;

        let (log_probs, entropy) = policy.evaluate_actions(
            &obs,
            &actions,
            masks.as_ref(),
            memories.as_ref(),
            seq_len,
        )?;
        let (values, _) = self.critic.critic_pass(&group, value_memories.as_ref(), seq_len)?;
        let (baselines, _) =
            self.critic
                .baseline(&agent, &teammates, baseline_memories.as_ref(), seq_len)?;
        let old_log_probs = LogProbTensors::from_buffer(batch, action_spec, device)?.flatten()?;
        let log_probs = log_probs.flatten()?;
        let loss_masks = scalars_to_tensor(batch, &BufferKey::Masks, device)?;

        let baseline_loss =
            trust_region_value_loss(&baselines, &old_baselines, &returns, epsilon, &loss_masks)?;
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
        let critic_loss = (&value_loss + (0.5 * &baseline_loss)?)?;
        let loss = ((&policy_loss + (0.5 * critic_loss)?)? - (beta * &entropy)?)?;

        self.optimizer.set_learning_rate(learning_rate);
        self.optimizer.backward_step(&loss)?;

        Ok(Record::from_slice(&[
            (
                "Losses/Policy Loss",
                RecordValue::Scalar(to_scalar(&policy_loss)?.abs()),
            ),
            ("Losses/Value Loss", RecordValue::Scalar(to_scalar(&value_loss)?)),
            ("Losses/Baseline Loss", RecordValue::Scalar(to_scalar(&baseline_loss)?)),
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

fn no_memory() -> MlAgentsError {
    MlAgentsError::Config("a recurrent critic returned no memory".to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{fake_trajectory, small_settings, vector_spec};
    use mlagents_core::{
        behavior::ActionSpec,
        settings::{MemorySettings, NetworkSettings},
    };

    fn settings() -> TrainerSettings {
        small_settings().hyperparameters(Hyperparameters::Coma(PpoSettings::default()))
    }

    #[test]
    fn test_teammate_inputs() -> Result<()> {
        let spec = ActionSpec::new(1, vec![3]);
        let batch = fake_trajectory("a", 4, 2, &spec, true, None, 2).to_agentbuffer();
        let teammates = teammate_inputs(&batch, &vector_spec(2, spec), &Device::Cpu)?;
        assert_eq!(teammates.len(), 2);
        let obs = teammates[1].obs[0].to_vec2::<f32>()?;
        assert!(obs[0].iter().all(|v| (v - 0.6).abs() < 1e-6));
        let actions = teammates[0]
            .action
            .as_ref()
            .map(|a| a.to_vec2::<f32>())
            .transpose()?;
        assert_eq!(actions.map(|a| a[0].clone()), Some(vec![0.1, 0.0, 1.0, 0.0]));
        Ok(())
    }

    #[test]
    fn test_recurrent_estimates_carry_memories() -> Result<()> {
        let settings = settings().network_settings(
            NetworkSettings::default()
                .hidden_units(8)
                .num_layers(1)
                .memory(Some(MemorySettings {
                    sequence_length: 4,
                    memory_size: 6,
                })),
        );
        let spec = ActionSpec::new(1, vec![3]);
        let policy = CandlePolicy::new(vector_spec(2, spec.clone()), &settings, false, false, Device::Cpu)?;
        let mut optimizer = ComaOptimizer::new(&policy, &settings)?;

        let trajectory = fake_trajectory("a", 6, 2, &spec, false, Some(6), 1);
        let batch = trajectory.to_agentbuffer();
        let estimates = optimizer.get_trajectory_and_baseline_value_estimates(
            &policy,
            &batch,
            &trajectory.next_obs,
            &trajectory.next_group_obs,
            false,
            "a",
        )?;
        assert_eq!(estimates.value_estimates["extrinsic"].len(), 6);
        assert_eq!(estimates.baseline_estimates["extrinsic"].len(), 6);
        // A trajectory of 6 steps starts with a sequence of 2 from a zero memory.
        let memories = estimates.value_memories.unwrap_or_default();
        assert_eq!(memories.len(), 6);
        assert_eq!(memories[0], vec![0.0; 6]);
        assert_eq!(memories[0], memories[1]);
        assert_ne!(memories[1], memories[2]);
        assert_eq!(optimizer.value_memory_dict.len(), 1);
        assert_eq!(optimizer.baseline_memory_dict.len(), 1);

        // The end of the episode drops the memories of the agent.
        optimizer.get_trajectory_and_baseline_value_estimates(
            &policy,
            &batch,
            &trajectory.next_obs,
            &trajectory.next_group_obs,
            true,
            "a",
        )?;
        assert!(optimizer.value_memory_dict.is_empty());
        assert!(optimizer.baseline_memory_dict.is_empty());
        Ok(())
    }

    #[test]
    fn test_done_zeroes_next_value() -> Result<()> {
        let settings = settings();
        let spec = ActionSpec::create_discrete(vec![2]);
        let policy = CandlePolicy::new(vector_spec(2, spec.clone()), &settings, false, false, Device::Cpu)?;
        let mut optimizer = ComaOptimizer::new(&policy, &settings)?;
        let trajectory = fake_trajectory("a", 3, 2, &spec, true, None, 1);
        let batch = trajectory.to_agentbuffer();
        let estimates = optimizer.get_trajectory_and_baseline_value_estimates(
            &policy,
            &batch,
            &trajectory.next_obs,
            &trajectory.next_group_obs,
            true,
            "a",
        )?;
        assert_eq!(estimates.value_next["extrinsic"], 0.0);
        assert!(estimates.value_memories.is_none());
        Ok(())
    }
}
