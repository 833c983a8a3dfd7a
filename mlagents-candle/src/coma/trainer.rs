use super::optimizer::ComaOptimizer;
use crate::{
    policy::CandlePolicy, saver::ModelSaver, trainer_factory::TrainerContext, util::mean_records,
};
use anyhow::Result;
use log::{debug, info};
use mlagents_core::{
    behavior::BehaviorSpec,
    buffer::{AgentBuffer, BufferKey},
    policy::{Policy, PolicyWeights},
    returns::lambda_return,
    settings::TrainerSettings,
    trainer::{capitalize, Trainer, TrainerState, ENVIRONMENT_REWARDS},
    trajectory::Trajectory,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{collections::HashMap, path::Path};

/// On-policy trainer of cooperating agents sharing a group reward.
///
/// Returns are TD(lambda) targets of the group value; the advantage of an
/// agent is its return minus the baseline, the value of the group given the
/// actions of its teammates.
pub struct ComaTrainer {
    state: TrainerState,
    policy: CandlePolicy,
    optimizer: ComaOptimizer,
    update_buffer: AgentBuffer,
    saver: ModelSaver,
    /// Group rewards of the current episode per agent.
    collected_group_rewards: HashMap<String, f32>,
    rng: StdRng,
}

impl ComaTrainer {
    pub fn new(
        brain_name: &str,
        behavior_spec: BehaviorSpec,
        trainer_settings: TrainerSettings,
        ctx: &TrainerContext,
    ) -> Result<Self> {
        trainer_settings.validate(brain_name)?;
        let policy = CandlePolicy::new(
            behavior_spec,
            &trainer_settings,
            false,
            false,
            ctx.device.clone(),
        )?;
        let optimizer = ComaOptimizer::new(&policy, &trainer_settings)?;

        let mut saver = ModelSaver::new(ctx.model_path(brain_name), trainer_settings.keep_checkpoints);
        saver.register("policy", policy.varmap());
        saver.register("critic", optimizer.critic_varmap());
        let rng = StdRng::seed_from_u64(trainer_settings.seed);

        Ok(Self {
            state: TrainerState::new(
                brain_name,
                trainer_settings,
                ctx.is_training,
                ctx.stats_reporter.clone(),
            ),
            policy,
            optimizer,
            update_buffer: AgentBuffer::new(),
            saver,
            collected_group_rewards: HashMap::new(),
            rng,
        })
    }

    pub fn policy(&self) -> &CandlePolicy {
        &self.policy
    }

    pub fn update_buffer(&self) -> &AgentBuffer {
        &self.update_buffer
    }

    /// Restores the networks and the step from a checkpoint directory.
    pub fn initialize_or_load(&mut self, path: Option<&Path>) -> Result<()> {
        let step = self.saver.initialize_or_load(path)?;
        self.policy.set_step(step);
        self.state.set_step(step);
        Ok(())
    }
}

impl Trainer for ComaTrainer {
    fn state(&self) -> &TrainerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TrainerState {
        &mut self.state
    }

    fn process_trajectory(&mut self, trajectory: Trajectory) -> Result<()> {
        let agent_id = trajectory.agent_id.clone();
        let mut agent_buffer = trajectory.to_agentbuffer();

        if self.state.is_training {
            self.policy.update_normalization(&agent_buffer)?;
            self.optimizer.update_normalization(&self.policy, &agent_buffer)?;
        }

        // The group value is only zero once every teammate is done too.
        let done = trajectory.done_reached()
            && trajectory.all_group_dones_reached()
            && !trajectory.interrupted();
        let values = self.optimizer.get_trajectory_and_baseline_value_estimates(
            &self.policy,
            &agent_buffer,
            &trajectory.next_obs,
            &trajectory.next_group_obs,
            done,
            &agent_id,
        )?;
        if let Some(memories) = values.value_memories {
            agent_buffer.set(BufferKey::CriticMemory, memories);
        }
        if let Some(memories) = values.baseline_memories {
            agent_buffer.set(BufferKey::BaselineMemory, memories);
        }

        let env_rewards: f32 = agent_buffer
            .field(&BufferKey::EnvironmentRewards)?
            .scalars()
            .iter()
            .sum();
        self.state
            .collect_reward(ENVIRONMENT_REWARDS, &agent_id, env_rewards);
        let group_rewards: f32 = agent_buffer
            .field(&BufferKey::GroupReward)?
            .scalars()
            .iter()
            .sum();
        *self
            .collected_group_rewards
            .entry(agent_id.clone())
            .or_default() += group_rewards;

        let n = agent_buffer.num_experiences();
        let mut advantages = vec![0.0; n];
        let mut returns = vec![0.0; n];
        let n_signals = self.optimizer.reward_signals().len().max(1) as f32;
        let lambd = self.optimizer.hyperparameters().lambd;
        for signal in self.optimizer.reward_signals().iter() {
            let name = signal.name().to_string();
            let v = &values.value_estimates[&name];
            let b = &values.baseline_estimates[&name];
            let v_next = values.value_next[&name];
            let reporter = &self.state.stats_reporter;
            let cap = capitalize(&name);
            reporter.add_stat(
                &self.state.brain_name,
                &format!("Policy/{} Value Estimate", cap),
                v.iter().sum::<f32>() / v.len().max(1) as f32,
            );
            reporter.add_stat(
                &self.state.brain_name,
                &format!("Policy/{} Baseline Estimate", cap),
                b.iter().sum::<f32>() / b.len().max(1) as f32,
            );

            let rewards = signal.evaluate(&agent_buffer)?;
            self.state
                .collect_reward(&name, &agent_id, rewards.iter().sum());
            let ret = lambda_return(&rewards, v, signal.gamma(), lambd, v_next);
            let adv: Vec<f32> = ret.iter().zip(b.iter()).map(|(r, b)| r - b).collect();
            for t in 0..n {
                advantages[t] += adv[t] / n_signals;
                returns[t] += ret[t] / n_signals;
            }

            agent_buffer.set_scalars(BufferKey::Rewards(name.clone()), rewards);
            agent_buffer.set_scalars(BufferKey::ValueEstimates(name.clone()), v.clone());
            agent_buffer.set_scalars(BufferKey::BaselineEstimates(name.clone()), b.clone());
            agent_buffer.set_scalars(BufferKey::Returns(name.clone()), ret);
            agent_buffer.set_scalars(BufferKey::Advantage(name), adv);
        }
        agent_buffer.set_scalars(BufferKey::Advantages, advantages);
        agent_buffer.set_scalars(BufferKey::DiscountedReturns, returns);

        agent_buffer.resequence_and_append(
            &mut self.update_buffer,
            None,
            self.policy.sequence_length(),
        )?;

        if trajectory.done_reached() {
            let group_reward = self.collected_group_rewards.remove(&agent_id).unwrap_or(0.0);
            self.state.stats_reporter.add_stat(
                &self.state.brain_name,
                "Environment/Group Cumulative Reward",
                group_reward,
            );
            self.state.update_end_episode_stats(&agent_id);
        }
        self.process_trajectory_steps(trajectory.len())?;
        self.policy.set_step(self.state.get_step());
        Ok(())
    }

    fn is_ready_update(&self) -> bool {
        self.update_buffer.num_experiences() > self.optimizer.hyperparameters().buffer_size
    }

    fn update_policy(&mut self) -> Result<bool> {
        let hyperparameters = self.optimizer.hyperparameters().clone();
        let seq_len = self.policy.sequence_length().max(1);
        let batch_size = hyperparameters.batch_size;
        let batch_size = (batch_size - batch_size % seq_len).max(seq_len);
        let num_sequences = (hyperparameters.batch_size / seq_len).max(1);

        let advantages = self.update_buffer.field(&BufferKey::Advantages)?.scalars();
        let n = advantages.len().max(1) as f32;
        let mean = advantages.iter().sum::<f32>() / n;
        let std = (advantages.iter().map(|a| (a - mean).powi(2)).sum::<f32>() / n).sqrt();
        self.update_buffer.set_scalars(
            BufferKey::Advantages,
            advantages
                .iter()
                .map(|a| (a - mean) / (std + 1e-10))
                .collect(),
        );

        let buffer_length = self.update_buffer.num_experiences();
        let mut records = vec![];
        for _ in 0..hyperparameters.num_epoch {
            self.update_buffer.shuffle(seq_len, &mut self.rng);
            let mut start = 0;
            while start + batch_size <= buffer_length {
                let batch = self.update_buffer.make_mini_batch(start, start + batch_size);
                let record = self.optimizer.update(&self.policy, &batch, num_sequences)?;
                records.push(record.merge(self.optimizer.update_reward_signals(&batch)?));
                start += batch_size;
            }
        }
        debug!(
            "COMA update of {} on {} steps with {} mini batches",
            self.state.brain_name,
            buffer_length,
            records.len()
        );
        mean_records(&records).report(&self.state.stats_reporter, &self.state.brain_name);

        self.update_buffer.reset_agent();
        Ok(true)
    }

    fn get_policy_weights(&self, _behavior_id: &str) -> Result<PolicyWeights> {
        self.policy.get_weights()
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        let path = self
            .saver
            .save_checkpoint(&self.state.brain_name, self.state.get_step())?;
        info!("Saved {} at {:?}", self.state.brain_name, path);
        Ok(())
    }

    fn clear_update_buffer(&mut self) {
        self.update_buffer.reset_agent();
    }

    fn end_episode(&mut self) {
        self.collected_group_rewards.clear();
        self.state.end_episode();
    }
}
