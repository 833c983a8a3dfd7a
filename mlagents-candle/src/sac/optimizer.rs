use super::ent_coef::{branch_sums, EntCoef};
use crate::{
    distributions::{one_hot, ActionTensors, LogProbTensors},
    networks::ValueNetwork,
    opt::{Optimizer, OptimizerConfig},
    policy::CandlePolicy,
    ppo::{batch_action_masks, batch_memories, trajectory_value_estimates, TrajectoryValues},
    sequence::MemoryDict,
    util::{
        copy_vars, masked_mean, next_obs_to_tensors, obs_to_tensors, scalars_to_tensor,
        sequence_rows, to_scalar, track, vec_to_tensor,
    },
};
use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use log::trace;
use mlagents_core::{
    behavior::ActionSpec,
    buffer::{AgentBuffer, BufferKey},
    error::MlAgentsError,
    policy::Policy,
    record::{Record, RecordValue},
    reward::{create_reward_providers, RewardProvider},
    schedule::DecayedValue,
    settings::{Hyperparameters, SacSettings, TrainerSettings},
};
use std::collections::BTreeMap;

/// Estimate of a discrete action-value head for the actions taken, `[n]`.
///
/// The heads output one value per action of every branch; the values of
/// the chosen actions are averaged over the branches.
fn condense_q_stream(q: &Tensor, actions: &Tensor, branches: &[usize]) -> Result<Tensor> {
    let chosen = (q * one_hot(actions, branches)?)?.sum(D::Minus1)?;
    Ok((chosen / branches.len() as f64)?)
}

/// Expected value of discrete action-value heads under the policy, `[n]`.
fn expected_q(q: &Tensor, action_probs: &Tensor, branches: &[usize]) -> Result<Tensor> {
    Ok(branch_sums(&(q * action_probs)?, branches)?.mean(D::Minus1)?)
}

/// SAC optimizer: twin action-value networks, a value network with a
/// slowly tracking target copy, and tuned entropy coefficients.
pub struct SacOptimizer {
    hyperparameters: SacSettings,
    action_spec: ActionSpec,
    q_varmap: VarMap,
    q1: ValueNetwork,
    q2: ValueNetwork,
    value_varmap: VarMap,
    value: ValueNetwork,
    target_varmap: VarMap,
    target: ValueNetwork,
    ent_coef: EntCoef,
    policy_optimizer: Optimizer,
    value_optimizer: Optimizer,
    reward_signals: Vec<Box<dyn RewardProvider>>,
    decay_learning_rate: DecayedValue,
    critic_memory_dict: MemoryDict,
    device: Device,
}

impl SacOptimizer {
    pub fn new(policy: &CandlePolicy, trainer_settings: &TrainerSettings) -> Result<Self> {
        let hyperparameters = match &trainer_settings.hyperparameters {
            Hyperparameters::Sac(h) => h.clone(),
            h => {
                return Err(MlAgentsError::Config(format!(
                    "SAC optimizer got {} hyperparameters",
                    h.trainer_type()
                ))
                .into())
            }
        };
        let reward_signals = create_reward_providers(trainer_settings.reward_signals.iter(), false);
        let stream_names: Vec<String> = reward_signals.iter().map(|r| r.name().to_string()).collect();
        let device = policy.device().clone();
        let spec = policy.behavior_spec();
        let action_spec = spec.action_spec.clone();
        let settings = policy.network_settings();

        // Action-value heads see the continuous actions as inputs and output
        // one value per discrete action.
        let num_value_outs = action_spec.discrete_mask_size().max(1);
        let q_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&q_varmap, DType::F32, &device);
        let q_net = |name: &str| {
            ValueNetwork::new(
                vb.pp(name),
                &stream_names,
                &spec.observation_specs,
                settings,
                action_spec.continuous_size,
                num_value_outs,
            )
        };
        let q1 = q_net("q1")?;
        let q2 = q_net("q2")?;

        let value_varmap = VarMap::new();
        let target_varmap = VarMap::new();
        let value_net = |varmap: &VarMap| {
            let vb = VarBuilder::from_varmap(varmap, DType::F32, &device);
            ValueNetwork::new(vb.pp("value"), &stream_names, &spec.observation_specs, settings, 0, 1)
        };
        let value = value_net(&value_varmap)?;
        let target = value_net(&target_varmap)?;
        copy_vars(&target_varmap, &value_varmap)?;

        let learning_rate = hyperparameters.learning_rate;
        let policy_optimizer = OptimizerConfig::default()
            .learning_rate(learning_rate as f64)
            .build(policy.varmap().all_vars())?;
        let mut value_vars = q_varmap.all_vars();
        value_vars.extend(value_varmap.all_vars());
        let value_optimizer = OptimizerConfig::default()
            .learning_rate(learning_rate as f64)
            .build(value_vars)?;
        let ent_coef = EntCoef::new(&action_spec, hyperparameters.init_entcoef, learning_rate as f64, &device)?;
        let decay_learning_rate = DecayedValue::new(
            hyperparameters.learning_rate_schedule,
            learning_rate,
            1e-10,
            trainer_settings.max_steps,
        );

        Ok(Self {
            hyperparameters,
            action_spec,
            critic_memory_dict: MemoryDict::new(value.memory_size()),
            q_varmap,
            q1,
            q2,
            value_varmap,
            value,
            target_varmap,
            target,
            ent_coef,
            policy_optimizer,
            value_optimizer,
            reward_signals,
            decay_learning_rate,
            device,
        })
    }

    pub fn hyperparameters(&self) -> &SacSettings {
        &self.hyperparameters
    }

    pub fn reward_signals(&self) -> &[Box<dyn RewardProvider>] {
        &self.reward_signals
    }

    /// Variables to checkpoint besides the policy, by name.
    pub fn modules(&self) -> Vec<(&'static str, &VarMap)> {
        vec![
            ("q_network", &self.q_varmap),
            ("value", &self.value_varmap),
            ("target", &self.target_varmap),
            ("entropy_coefficient", self.ent_coef.varmap()),
        ]
    }

    pub fn update_normalization(&self, policy: &CandlePolicy, buffer: &AgentBuffer) -> Result<()> {
        if policy.network_settings().normalize {
            let obs = obs_to_tensors(buffer, policy.num_obs(), &self.device)?;
            for net in [&self.q1, &self.q2, &self.value, &self.target] {
                net.update_normalization(&obs)?;
            }
        }
        Ok(())
    }

    /// Value estimates of a trajectory, for reporting and recurrent memories.
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
            &self.value,
            &mut self.critic_memory_dict,
            &self.reward_signals,
            &obs,
            next_obs,
            policy.sequence_length(),
            done,
            agent_id,
        )
    }

    fn q_losses(
        &self,
        q1_out: &BTreeMap<String, Tensor>,
        q2_out: &BTreeMap<String, Tensor>,
        actions: &ActionTensors,
        target_values: &BTreeMap<String, Tensor>,
        rewards: &BTreeMap<String, Tensor>,
        dones: &Tensor,
        loss_masks: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let stream = |q: &Tensor| -> Result<Tensor> {
            match &actions.discrete {
                Some(a) => condense_q_stream(q, a, &self.action_spec.discrete_branches),
                None => Ok(q.squeeze(1)?),
            }
        };
        let mut q1_losses = vec![];
        let mut q2_losses = vec![];
        for signal in self.reward_signals.iter() {
            let name = signal.name();
            let missing = || MlAgentsError::Config(format!("no head for reward stream {}", name));
            let not_done = match signal.ignore_done() {
                true => dones.ones_like()?,
                false => (1.0 - dones)?,
            };
            let next_values = target_values.get(name).ok_or_else(missing)?;
            let q_backup = (rewards.get(name).ok_or_else(missing)?
                + (not_done * next_values)?.affine(signal.gamma() as f64, 0.0)?)?
            .detach();
            let q1 = stream(q1_out.get(name).ok_or_else(missing)?)?;
            let q2 = stream(q2_out.get(name).ok_or_else(missing)?)?;
            q1_losses.push((0.5 * masked_mean(&(&q_backup - q1)?.sqr()?, loss_masks)?)?);
            q2_losses.push((0.5 * masked_mean(&(&q_backup - q2)?.sqr()?, loss_masks)?)?);
        }
        Ok((
            Tensor::stack(&q1_losses, 0)?.mean(0)?,
            Tensor::stack(&q2_losses, 0)?.mean(0)?,
        ))
    }

    fn value_loss(
        &self,
        log_probs: &LogProbTensors,
        values: &BTreeMap<String, Tensor>,
        q1p_out: &BTreeMap<String, Tensor>,
        q2p_out: &BTreeMap<String, Tensor>,
        loss_masks: &Tensor,
    ) -> Result<Tensor> {
        let branches = &self.action_spec.discrete_branches;
        // Entropy bonus of the sampled actions, `[n]`.
        let mut entropy_bonus: Option<Tensor> = None;
        if let (Some(coef), Some(lp)) = (self.ent_coef.discrete()?, &log_probs.all_discrete) {
            let per_action = (lp * lp.exp()?)?;
            let bonus = branch_sums(&per_action, branches)?
                .broadcast_mul(&coef)?
                .mean(D::Minus1)?;
            entropy_bonus = Some(bonus);
        }
        if let (Some(coef), Some(lp)) = (self.ent_coef.continuous()?, &log_probs.continuous) {
            let bonus = lp.sum(D::Minus1)?.broadcast_mul(&coef)?;
            entropy_bonus = Some(match entropy_bonus {
                Some(b) => (b + bonus)?,
                None => bonus,
            });
        }

        let mut losses = vec![];
        for (name, v) in values.iter() {
            let missing = || MlAgentsError::Config(format!("no head for reward stream {}", name));
            let q1p = q1p_out.get(name).ok_or_else(missing)?;
            let q2p = q2p_out.get(name).ok_or_else(missing)?;
            let min_policy_q = match &log_probs.all_discrete {
                Some(lp) => {
                    let probs = lp.exp()?;
                    expected_q(q1p, &probs, branches)?.minimum(&expected_q(q2p, &probs, branches)?)?
                }
                None => q1p.squeeze(1)?.minimum(&q2p.squeeze(1)?)?,
            };
            let v_backup = match &entropy_bonus {
                Some(b) => (min_policy_q - b)?,
                None => min_policy_q,
            }
            .detach();
            losses.push((0.5 * masked_mean(&(v - v_backup)?.sqr()?, loss_masks)?)?);
        }
        Ok(Tensor::stack(&losses, 0)?.mean(0)?)
    }

    fn policy_loss(
        &self,
        log_probs: &LogProbTensors,
        q1p_out: &BTreeMap<String, Tensor>,
        loss_masks: &Tensor,
    ) -> Result<Tensor> {
        let q1p: Vec<Tensor> = q1p_out.values().cloned().collect();
        let mean_q1 = Tensor::stack(&q1p, 0)?.mean(0)?;
        let n = mean_q1.dim(0)?;
        let mut batch_loss = Tensor::zeros(n, DType::F32, &self.device)?;

        let all_mean_q1 = match (&log_probs.all_discrete, self.ent_coef.discrete()?) {
            (Some(lp), Some(coef)) => {
                let branches = &self.action_spec.discrete_branches;
                let probs = lp.exp()?;
                let entropy_term = branch_sums(&(lp * &probs)?, branches)?.broadcast_mul(&coef)?;
                let q_term = branch_sums(&(&mean_q1 * &probs)?, branches)?;
                batch_loss = (batch_loss + (entropy_term - q_term)?.sum(D::Minus1)?)?;
                (&mean_q1 * &probs)?.sum(D::Minus1)?
            }
            _ => mean_q1.squeeze(1)?,
        };
        if let (Some(lp), Some(coef)) = (&log_probs.continuous, self.ent_coef.continuous()?) {
            let entropy_term = lp.sum(D::Minus1)?.broadcast_mul(&coef)?;
            batch_loss = (batch_loss + (entropy_term - all_mean_q1)?)?;
        }
        masked_mean(&batch_loss, loss_masks)
    }

    /// One update of all networks on a mini batch of `num_sequences` sequences.
    pub fn update(
        &mut self,
        policy: &mut CandlePolicy,
        batch: &AgentBuffer,
        num_sequences: usize,
    ) -> Result<Record> {
        let device = self.device.clone();
        let seq_len = policy.sequence_length();
        let learning_rate = self.decay_learning_rate.get_value(policy.get_current_step()) as f64;
        trace!("SAC update on {} sequences of {} steps", num_sequences, seq_len);

        let mut rewards = BTreeMap::new();
        for signal in self.reward_signals.iter() {
            let r = signal.evaluate(batch)?;
            rewards.insert(signal.name().to_string(), vec_to_tensor(&r, &device)?);
        }
        let obs = obs_to_tensors(batch, policy.num_obs(), &device)?;
        let next_obs = next_obs_to_tensors(batch, policy.num_obs(), &device)?;
        let actions = ActionTensors::from_buffer(batch, &self.action_spec, &device)?;
        let masks = batch_action_masks(batch, policy)?;
        let use_recurrent = policy.use_recurrent();
        let memories = batch_memories(batch, &BufferKey::Memory, use_recurrent, seq_len, &device)?;
        let (value_memories, next_value_memories, q_memories) = match use_recurrent {
            true => {
                let field = batch.field(&BufferKey::CriticMemory)?;
                let starts = sequence_rows(field, seq_len, 0, &device)?;
                // Action-value networks are not run while acting, so they start from zero.
                let zeros = starts.zeros_like()?;
                (Some(starts), Some(sequence_rows(field, seq_len, 1, &device)?), Some(zeros))
            }
            false => (None, None, None),
        };
        let loss_masks = scalars_to_tensor(batch, &BufferKey::Masks, &device)?;
        let dones = scalars_to_tensor(batch, &BufferKey::Done, &device)?;

        let output = policy.sample_actions(&obs, masks.as_ref(), memories.as_ref(), seq_len)?;
        let log_probs = output.log_probs;
        let (values, _) = self.value.critic_pass(&obs, value_memories.as_ref(), seq_len)?;
        let sampled_cont = output.actions.continuous.as_ref();
        let (q1p_out, _) = self.q1.forward(&obs, sampled_cont, q_memories.as_ref(), seq_len)?;
        let (q2p_out, _) = self.q2.forward(&obs, sampled_cont, q_memories.as_ref(), seq_len)?;
        let recorded_cont = actions.continuous.as_ref();
        let (q1_out, _) = self.q1.forward(&obs, recorded_cont, q_memories.as_ref(), seq_len)?;
        let (q2_out, _) = self.q2.forward(&obs, recorded_cont, q_memories.as_ref(), seq_len)?;
        let (target_values, _) =
            self.target
                .critic_pass(&next_obs, next_value_memories.as_ref(), seq_len)?;
        let target_values: BTreeMap<String, Tensor> = target_values
            .into_iter()
            .map(|(k, v)| (k, v.detach()))
            .collect();

        let (q1_loss, q2_loss) = self.q_losses(
            &q1_out,
            &q2_out,
            &actions,
            &target_values,
            &rewards,
            &dones,
            &loss_masks,
        )?;
        let value_loss = self.value_loss(&log_probs, &values, &q1p_out, &q2p_out, &loss_masks)?;
        let policy_loss = self.policy_loss(&log_probs, &q1p_out, &loss_masks)?;
        let total_value_loss = ((&q1_loss + &q2_loss)? + &value_loss)?;

        self.policy_optimizer.set_learning_rate(learning_rate);
        self.policy_optimizer.backward_step(&policy_loss)?;
        self.value_optimizer.set_learning_rate(learning_rate);
        self.value_optimizer.backward_step(&total_value_loss)?;
        self.ent_coef.update(&log_probs, &loss_masks, learning_rate)?;
        track(&self.target_varmap, &self.value_varmap, self.hyperparameters.tau as f64)?;

        let record = Record::from_slice(&[
            ("Losses/Policy Loss", RecordValue::Scalar(to_scalar(&policy_loss)?)),
            ("Losses/Value Loss", RecordValue::Scalar(to_scalar(&value_loss)?)),
            ("Losses/Q1 Loss", RecordValue::Scalar(to_scalar(&q1_loss)?)),
            ("Losses/Q2 Loss", RecordValue::Scalar(to_scalar(&q2_loss)?)),
            ("Policy/Learning Rate", RecordValue::Scalar(learning_rate as f32)),
        ]);
        Ok(record.merge(self.ent_coef.record()?))
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{fake_trajectory, small_settings, vector_spec};

    fn optimizer(action_spec: ActionSpec) -> Result<(CandlePolicy, SacOptimizer)> {
        let settings = small_settings().hyperparameters(Hyperparameters::Sac(SacSettings::default()));
        let policy = CandlePolicy::new(vector_spec(3, action_spec), &settings, true, true, Device::Cpu)?;
        let optimizer = SacOptimizer::new(&policy, &settings)?;
        Ok((policy, optimizer))
    }

    #[test]
    fn test_condense_q_stream() -> Result<()> {
        let q = Tensor::new(&[[1f32, 2., 3., 10., 20.]], &Device::Cpu)?;
        let actions = Tensor::new(&[[2u32, 0]], &Device::Cpu)?;
        let v = condense_q_stream(&q, &actions, &[3, 2])?;
        assert_eq!(v.to_vec1::<f32>()?, vec![6.5]);
        Ok(())
    }

    #[test]
    fn test_update_hybrid_actions() -> Result<()> {
        let spec = ActionSpec::new(2, vec![3, 2]);
        let (mut policy, mut optimizer) = optimizer(spec.clone())?;
        let batch = fake_trajectory("a", 8, 3, &spec, true, None, 0).to_agentbuffer();
        let target_before = crate::util::varmap_to_weights(&optimizer.target_varmap, 0)?;

        let record = optimizer.update(&mut policy, &batch, 8)?;
        for key in [
            "Losses/Policy Loss",
            "Losses/Value Loss",
            "Losses/Q1 Loss",
            "Losses/Q2 Loss",
            "Policy/Continuous Entropy Coeff",
            "Policy/Discrete Entropy Coeff",
            "Policy/Learning Rate",
        ] {
            assert!(record.get_scalar(key)?.is_finite(), "{}", key);
        }
        // The target network moves toward the updated value network.
        let target_after = crate::util::varmap_to_weights(&optimizer.target_varmap, 0)?;
        assert_ne!(target_before, target_after);
        Ok(())
    }

    #[test]
    fn test_update_continuous_actions() -> Result<()> {
        let spec = ActionSpec::create_continuous(2);
        let (mut policy, mut optimizer) = optimizer(spec.clone())?;
        let batch = fake_trajectory("a", 8, 3, &spec, false, None, 0).to_agentbuffer();
        let before = policy.get_weights()?;
        let record = optimizer.update(&mut policy, &batch, 8)?;
        assert!(record.get_scalar("Policy/Discrete Entropy Coeff").is_err());
        assert_ne!(policy.get_weights()?, before);
        Ok(())
    }
}
