use super::optimizer::PpoOptimizer;
use crate::{
    bc::BcModule, policy::CandlePolicy, saver::ModelSaver, trainer_factory::TrainerContext,
    util::mean_records,
};
use anyhow::Result;
use log::{debug, info};
use mlagents_core::{
    behavior::BehaviorSpec,
    buffer::{AgentBuffer, BufferKey},
    policy::{Policy, PolicyWeights},
    returns::get_gae,
    settings::TrainerSettings,
    trainer::{capitalize, Trainer, TrainerState, ENVIRONMENT_REWARDS},
    trajectory::Trajectory,
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;

/// On-policy trainer with a clipped surrogate objective.
///
/// Trajectories are turned into GAE advantages as they arrive; once the
/// update buffer holds more than `buffer_size` steps, the policy is trained
/// for `num_epoch` epochs and the buffer is cleared.
pub struct PpoTrainer {
    state: TrainerState,
    policy: CandlePolicy,
    optimizer: PpoOptimizer,
    bc_module: Option<BcModule>,
    update_buffer: AgentBuffer,
    saver: ModelSaver,
    rng: StdRng,
}

impl PpoTrainer {
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
        let optimizer = PpoOptimizer::new(&policy, &trainer_settings)?;
        let hyperparameters = optimizer.hyperparameters();
        let bc_module = trainer_settings
            .behavioral_cloning
            .as_ref()
            .map(|bc| {
                BcModule::new(
                    &policy,
                    bc,
                    hyperparameters.learning_rate,
                    hyperparameters.batch_size,
                    hyperparameters.num_epoch,
                )
            })
            .transpose()?;

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
            bc_module,
            update_buffer: AgentBuffer::new(),
            saver,
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

impl Trainer for PpoTrainer {
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

        let done = trajectory.done_reached() && !trajectory.interrupted();
        let values = self.optimizer.get_trajectory_value_estimates(
            &self.policy,
            &agent_buffer,
            &trajectory.next_obs,
            done,
            &agent_id,
        )?;
        if let Some(memories) = values.memories {
            agent_buffer.set(BufferKey::CriticMemory, memories);
        }

        let env_rewards: f32 = agent_buffer
            .field(&BufferKey::EnvironmentRewards)?
            .scalars()
            .iter()
            .sum();
        self.state
            .collect_reward(ENVIRONMENT_REWARDS, &agent_id, env_rewards);

        let n = agent_buffer.num_experiences();
        let mut advantages = vec![0.0; n];
        let mut returns = vec![0.0; n];
        let n_signals = self.optimizer.reward_signals().len().max(1) as f32;
        let hyperparameters = self.optimizer.hyperparameters().clone();
        for signal in self.optimizer.reward_signals().iter() {
            let name = signal.name().to_string();
            let v = &values.value_estimates[&name];
            let v_next = values.value_next[&name];
            self.state.stats_reporter.add_stat(
                &self.state.brain_name,
                &format!("Policy/{} Value Estimate", capitalize(&name)),
                v.iter().sum::<f32>() / v.len().max(1) as f32,
            );

            let rewards = signal.evaluate(&agent_buffer)?;
            self.state
                .collect_reward(&name, &agent_id, rewards.iter().sum());
            let adv = get_gae(&rewards, v, v_next, signal.gamma(), hyperparameters.lambd);
            let ret: Vec<f32> = adv.iter().zip(v.iter()).map(|(a, v)| a + v).collect();
            for t in 0..n {
                advantages[t] += adv[t] / n_signals;
                returns[t] += ret[t] / n_signals;
            }

            agent_buffer.set_scalars(BufferKey::Rewards(name.clone()), rewards);
            agent_buffer.set_scalars(BufferKey::ValueEstimates(name.clone()), v.clone());
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

        // Normalized advantages
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
            "PPO update of {} on {} steps with {} mini batches",
            self.state.brain_name,
            buffer_length,
            records.len()
        );
        mean_records(&records).report(&self.state.stats_reporter, &self.state.brain_name);

        if let Some(bc_module) = self.bc_module.as_mut() {
            bc_module
                .update(&mut self.policy)?
                .report(&self.state.stats_reporter, &self.state.brain_name);
        }

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
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{fake_trajectory, small_settings, vector_spec};
    use mlagents_core::{
        behavior::ActionSpec,
        settings::{Hyperparameters, MemorySettings, NetworkSettings, PpoSettings},
        stats::StatsReporter,
    };
    use tempdir::TempDir;

    fn settings() -> TrainerSettings {
        small_settings().hyperparameters(Hyperparameters::Ppo(
            PpoSettings::default().batch_size(8).buffer_size(16).num_epoch(2),
        ))
    }

    fn trainer(settings: TrainerSettings, dir: &TempDir) -> Result<PpoTrainer> {
        let ctx = TrainerContext::new(dir.path(), StatsReporter::new(vec![]));
        PpoTrainer::new("3DBall", vector_spec(3, ActionSpec::new(2, vec![3])), settings, &ctx)
    }

    #[test_log::test]
    fn test_process_trajectory() -> Result<()> {
        let dir = TempDir::new("ppo")?;
        let mut trainer = trainer(settings(), &dir)?;
        let spec = ActionSpec::new(2, vec![3]);

        trainer.process_trajectory(fake_trajectory("a", 10, 3, &spec, true, None, 0))?;
        let buffer = trainer.update_buffer();
        assert_eq!(buffer.num_experiences(), 10);
        assert_eq!(trainer.get_step(), 10);
        for key in [
            BufferKey::Advantages,
            BufferKey::DiscountedReturns,
            BufferKey::Returns("extrinsic".to_string()),
            BufferKey::ValueEstimates("extrinsic".to_string()),
        ] {
            assert_eq!(buffer.field(&key)?.len(), 10);
        }
        let reporter = trainer.state().stats_reporter.clone();
        assert_eq!(reporter.get_mean_stat("3DBall", "Environment/Cumulative Reward"), 10.0);
        assert_eq!(reporter.get_num_stats("3DBall", "Policy/Extrinsic Value Estimate"), 1);
        assert!(!trainer.is_ready_update());

        // An unfinished trajectory leaves the episode open.
        trainer.process_trajectory(fake_trajectory("b", 10, 3, &spec, false, None, 0))?;
        assert_eq!(reporter.get_num_stats("3DBall", "Environment/Cumulative Reward"), 1);
        assert!(trainer.is_ready_update());
        Ok(())
    }

    #[test_log::test]
    fn test_update_policy() -> Result<()> {
        let dir = TempDir::new("ppo")?;
        let mut trainer = trainer(settings(), &dir)?;
        let spec = ActionSpec::new(2, vec![3]);
        let before = trainer.get_policy_weights("3DBall")?;
        for i in 0..3 {
            let agent = format!("agent{}", i);
            trainer.process_trajectory(fake_trajectory(&agent, 6, 3, &spec, i == 2, None, 0))?;
        }
        assert!(trainer.is_ready_update());
        assert!(trainer.update_policy()?);
        assert_eq!(trainer.update_buffer().num_experiences(), 0);

        let after = trainer.get_policy_weights("3DBall")?;
        assert_ne!(before, after);
        let reporter = &trainer.state().stats_reporter;
        assert_eq!(reporter.get_num_stats("3DBall", "Losses/Policy Loss"), 1);
        assert!(reporter.get_mean_stat("3DBall", "Losses/Value Loss").is_finite());
        assert!(reporter.get_mean_stat("3DBall", "Policy/Learning Rate") > 0.0);
        Ok(())
    }

    #[test_log::test]
    fn test_recurrent_update() -> Result<()> {
        let dir = TempDir::new("ppo")?;
        let settings = settings().network_settings(
            NetworkSettings::default()
                .hidden_units(8)
                .num_layers(1)
                .memory(Some(MemorySettings {
                    sequence_length: 4,
                    memory_size: 6,
                })),
        );
        let mut trainer = trainer(settings, &dir)?;
        let spec = ActionSpec::new(2, vec![3]);

        // 10 steps become 3 windows of 4 with the first one padded.
        trainer.process_trajectory(fake_trajectory("a", 10, 3, &spec, false, Some(6), 0))?;
        let buffer = trainer.update_buffer();
        assert_eq!(buffer.num_experiences(), 12);
        assert_eq!(buffer.field(&BufferKey::CriticMemory)?.rows()[0].len(), 6);
        assert_eq!(buffer.field(&BufferKey::Masks)?.scalars()[..2], [0.0, 0.0]);

        trainer.process_trajectory(fake_trajectory("a", 10, 3, &spec, true, Some(6), 0))?;
        assert!(trainer.update_policy()?);
        Ok(())
    }

    #[test_log::test]
    fn test_checkpoint_and_load() -> Result<()> {
        let dir = TempDir::new("ppo")?;
        let mut trainer = trainer(settings(), &dir)?;
        let spec = ActionSpec::new(2, vec![3]);
        trainer.process_trajectory(fake_trajectory("a", 5, 3, &spec, true, None, 0))?;
        trainer.save_checkpoint()?;
        let path = dir.path().join("3DBall").join("3DBall-5");
        assert!(path.join("policy.safetensors").exists());
        assert!(path.join("critic.safetensors").exists());

        let mut restored = PpoTrainer::new(
            "3DBall",
            vector_spec(3, ActionSpec::new(2, vec![3])),
            settings().seed(1),
            &TrainerContext::new(dir.path(), StatsReporter::new(vec![])),
        )?;
        restored.initialize_or_load(Some(&path))?;
        assert_eq!(restored.get_step(), 5);
        assert_eq!(restored.policy().get_current_step(), 5);
        assert_eq!(
            restored.get_policy_weights("3DBall")?,
            trainer.get_policy_weights("3DBall")?
        );
        Ok(())
    }
}
