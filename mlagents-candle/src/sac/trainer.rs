use super::optimizer::SacOptimizer;
use crate::{
    bc::BcModule, policy::CandlePolicy, saver::ModelSaver, trainer_factory::TrainerContext,
    util::mean_records,
};
use anyhow::Result;
use log::{debug, info, warn};
use mlagents_core::{
    behavior::BehaviorSpec,
    buffer::{AgentBuffer, BufferKey},
    policy::{Policy, PolicyWeights},
    record::Record,
    settings::TrainerSettings,
    trainer::{capitalize, Trainer, TrainerState, ENVIRONMENT_REWARDS},
    trajectory::{ObsUtil, Trajectory},
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::{Path, PathBuf};

const REPLAY_BUFFER_FILE: &str = "last_replay_buffer";

/// Fraction of `buffer_size` kept when the replay buffer overflows.
const BUFFER_TRUNCATE_PERCENT: f32 = 0.8;

/// Off-policy trainer with a replay buffer.
///
/// After `buffer_init_steps` steps, the networks are trained
/// `updates_per_train` times every `train_interval` steps on mini batches
/// sampled from the replay buffer.
pub struct SacTrainer {
    state: TrainerState,
    policy: CandlePolicy,
    optimizer: SacOptimizer,
    bc_module: Option<BcModule>,
    update_buffer: AgentBuffer,
    saver: ModelSaver,
    /// Training rounds done, each of `updates_per_train` updates.
    trains_done: u64,
    reward_signal_trains_done: u64,
    rng: StdRng,
}

impl SacTrainer {
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
            true,
            true,
            ctx.device.clone(),
        )?;
        let optimizer = SacOptimizer::new(&policy, &trainer_settings)?;
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
                    1,
                )
            })
            .transpose()?;

        let mut saver = ModelSaver::new(ctx.model_path(brain_name), trainer_settings.keep_checkpoints);
        saver.register("policy", policy.varmap());
        for (name, varmap) in optimizer.modules() {
            saver.register(name, varmap);
        }
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
            trains_done: 0,
            reward_signal_trains_done: 0,
            rng,
        })
    }

    pub fn policy(&self) -> &CandlePolicy {
        &self.policy
    }

    pub fn update_buffer(&self) -> &AgentBuffer {
        &self.update_buffer
    }

    fn replay_buffer_path(&self) -> PathBuf {
        self.saver.model_path().join(REPLAY_BUFFER_FILE)
    }

    /// Restores the networks, the step and the replay buffer.
    ///
    /// A replay buffer that cannot be read is not an error: training
    /// starts again from an empty one.
    pub fn initialize_or_load(&mut self, path: Option<&Path>) -> Result<()> {
        let step = self.saver.initialize_or_load(path)?;
        self.policy.set_step(step);
        self.state.set_step(step);
        if path.is_some() && self.optimizer.hyperparameters().save_replay_buffer {
            self.load_replay_buffer();
        }
        Ok(())
    }

    pub fn save_replay_buffer(&self) -> Result<()> {
        let path = self.replay_buffer_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        info!(
            "Saving experience replay buffer of {} steps to {:?}",
            self.update_buffer.num_experiences(),
            path
        );
        self.update_buffer.save(path)
    }

    pub fn load_replay_buffer(&mut self) {
        let path = self.replay_buffer_path();
        match self.update_buffer.load(&path) {
            Ok(()) => info!(
                "Loaded experience replay buffer of {} steps from {:?}",
                self.update_buffer.num_experiences(),
                path
            ),
            Err(e) => {
                warn!("Replay buffer was unable to load, starting from scratch. {}", e);
                self.update_buffer = AgentBuffer::new();
            }
        }
    }

    /// Training rounds due at the current step given `interval`, minus those done.
    fn rounds_due(&self, interval: u64, done: u64) -> u64 {
        let init_steps = self.optimizer.hyperparameters().buffer_init_steps;
        let steps = self.state.get_step().saturating_sub(init_steps);
        (steps / interval.max(1)).saturating_sub(done)
    }

    /// Sequences and steps of a mini batch.
    fn batch_shape(&self) -> (usize, usize) {
        let seq_len = self.policy.sequence_length().max(1);
        let num_sequences = (self.optimizer.hyperparameters().batch_size / seq_len).max(1);
        (num_sequences, num_sequences * seq_len)
    }

    fn update_sac_policy(&mut self) -> Result<bool> {
        let hyperparameters = self.optimizer.hyperparameters().clone();
        let rounds = self.rounds_due(hyperparameters.train_interval, self.trains_done);
        let (num_sequences, batch_size) = self.batch_shape();
        let seq_len = self.policy.sequence_length();

        let mut records = vec![];
        for _ in 0..rounds {
            for _ in 0..hyperparameters.updates_per_train {
                let batch = self
                    .update_buffer
                    .sample_mini_batch(batch_size, seq_len, &mut self.rng);
                records.push(self.optimizer.update(&mut self.policy, &batch, num_sequences)?);
            }
        }
        self.trains_done += rounds;
        if records.is_empty() {
            return Ok(false);
        }
        debug!(
            "SAC update of {} with {} mini batches",
            self.state.brain_name,
            records.len()
        );
        mean_records(&records).report(&self.state.stats_reporter, &self.state.brain_name);

        if let Some(bc_module) = self.bc_module.as_mut() {
            bc_module
                .update(&mut self.policy)?
                .report(&self.state.stats_reporter, &self.state.brain_name);
        }
        Ok(true)
    }

    fn update_reward_signals(&mut self) -> Result<()> {
        let hyperparameters = self.optimizer.hyperparameters().clone();
        let rounds = self.rounds_due(
            hyperparameters.reward_signal_train_interval,
            self.reward_signal_trains_done,
        );
        let (_, batch_size) = self.batch_shape();
        let seq_len = self.policy.sequence_length();

        let mut records: Vec<Record> = vec![];
        for _ in 0..rounds {
            for _ in 0..hyperparameters.reward_signal_updates_per_train() {
                let batch = self
                    .update_buffer
                    .sample_mini_batch(batch_size, seq_len, &mut self.rng);
                records.push(self.optimizer.update_reward_signals(&batch)?);
            }
        }
        self.reward_signal_trains_done += rounds;
        mean_records(&records).report(&self.state.stats_reporter, &self.state.brain_name);
        Ok(())
    }
}

impl Trainer for SacTrainer {
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
        for signal in self.optimizer.reward_signals().iter() {
            let name = signal.name();
            let rewards = signal.evaluate(&agent_buffer)?;
            self.state
                .collect_reward(name, &agent_id, rewards.iter().sum());
            if let Some(v) = values.value_estimates.get(name) {
                self.state.stats_reporter.add_stat(
                    &self.state.brain_name,
                    &format!("Policy/{} Value", capitalize(name)),
                    v.iter().sum::<f32>() / v.len().max(1) as f32,
                );
            }
        }

        // A step limit is not a terminal state: the last step bootstraps
        // from its own observation.
        if trajectory.interrupted() {
            if let Some(last) = trajectory.steps.last() {
                for (i, obs) in last.obs.iter().enumerate() {
                    let field = agent_buffer.field_mut(ObsUtil::get_name_at_next(i));
                    let mut rows = field.rows().to_vec();
                    if let Some(row) = rows.last_mut() {
                        *row = obs.clone();
                    }
                    field.set(rows);
                }
                let mut dones = agent_buffer.field(&BufferKey::Done)?.scalars();
                if let Some(d) = dones.last_mut() {
                    *d = 0.0;
                }
                agent_buffer.set_scalars(BufferKey::Done, dones);
            }
        }

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
        let hyperparameters = self.optimizer.hyperparameters();
        self.update_buffer.num_experiences() >= hyperparameters.batch_size
            && self.state.get_step() >= hyperparameters.buffer_init_steps
    }

    fn update_policy(&mut self) -> Result<bool> {
        let updated = self.update_sac_policy()?;
        self.update_reward_signals()?;

        let buffer_size = self.optimizer.hyperparameters().buffer_size;
        if self.update_buffer.num_experiences() > buffer_size {
            let max_length = (buffer_size as f32 * BUFFER_TRUNCATE_PERCENT) as usize;
            self.update_buffer
                .truncate(max_length, self.policy.sequence_length());
        }
        Ok(updated)
    }

    fn get_policy_weights(&self, _behavior_id: &str) -> Result<PolicyWeights> {
        self.policy.get_weights()
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        self.saver
            .save_checkpoint(&self.state.brain_name, self.state.get_step())?;
        Ok(())
    }

    fn save_model(&mut self) -> Result<()> {
        self.save_checkpoint()?;
        if self.optimizer.hyperparameters().save_replay_buffer {
            self.save_replay_buffer()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{fake_trajectory, small_settings, vector_spec};
    use mlagents_core::{
        behavior::ActionSpec,
        settings::{Hyperparameters, SacSettings},
        stats::StatsReporter,
    };
    use tempdir::TempDir;

    fn spec() -> ActionSpec {
        ActionSpec::new(2, vec![3])
    }

    fn trainer(hyperparameters: SacSettings, dir: &TempDir) -> Result<SacTrainer> {
        let settings = small_settings().hyperparameters(Hyperparameters::Sac(hyperparameters));
        let ctx = TrainerContext::new(dir.path(), StatsReporter::new(vec![]));
        SacTrainer::new("Walker", vector_spec(3, spec()), settings, &ctx)
    }

    #[test_log::test]
    fn test_interrupted_trajectory_bootstraps() -> Result<()> {
        let dir = TempDir::new("sac")?;
        let mut trainer = trainer(SacSettings::default().batch_size(8), &dir)?;
        let mut trajectory = fake_trajectory("a", 6, 3, &spec(), true, None, 0);
        if let Some(last) = trajectory.steps.last_mut() {
            last.interrupted = true;
        }
        trainer.process_trajectory(trajectory)?;

        let buffer = trainer.update_buffer();
        assert_eq!(buffer.num_experiences(), 6);
        assert_eq!(buffer.field(&BufferKey::Done)?.scalars()[5], 0.0);
        let next_obs = buffer.field(&BufferKey::NextObs(0))?.rows();
        assert_eq!(next_obs[5], buffer.field(&BufferKey::Obs(0))?.rows()[5]);

        let reporter = &trainer.state().stats_reporter;
        assert_eq!(reporter.get_num_stats("Walker", "Policy/Extrinsic Value"), 1);
        assert_eq!(reporter.get_mean_stat("Walker", "Environment/Cumulative Reward"), 6.0);
        Ok(())
    }

    #[test_log::test]
    fn test_updates_follow_train_interval() -> Result<()> {
        let dir = TempDir::new("sac")?;
        let hyperparameters = SacSettings::default()
            .batch_size(8)
            .buffer_size(100)
            .buffer_init_steps(4)
            .train_interval(3);
        let mut trainer = trainer(hyperparameters, &dir)?;
        trainer.process_trajectory(fake_trajectory("a", 3, 3, &spec(), false, None, 0))?;
        assert!(!trainer.is_ready_update());

        trainer.process_trajectory(fake_trajectory("a", 7, 3, &spec(), true, None, 0))?;
        assert!(trainer.is_ready_update());
        let before = trainer.get_policy_weights("Walker")?;
        // (10 - 4) / 3 rounds are due.
        assert!(trainer.update_policy()?);
        assert_eq!(trainer.trains_done, 2);
        assert_ne!(trainer.get_policy_weights("Walker")?, before);

        // Nothing is due until more steps come in.
        assert!(!trainer.update_policy()?);
        let reporter = &trainer.state().stats_reporter;
        assert_eq!(reporter.get_num_stats("Walker", "Losses/Q1 Loss"), 1);
        assert!(reporter.get_mean_stat("Walker", "Policy/Discrete Entropy Coeff") > 0.0);
        Ok(())
    }

    #[test_log::test]
    fn test_replay_buffer_is_truncated() -> Result<()> {
        let dir = TempDir::new("sac")?;
        let hyperparameters = SacSettings::default()
            .batch_size(4)
            .buffer_size(10)
            .train_interval(20);
        let mut trainer = trainer(hyperparameters, &dir)?;
        trainer.process_trajectory(fake_trajectory("a", 12, 3, &spec(), true, None, 0))?;
        trainer.update_policy()?;
        assert_eq!(trainer.update_buffer().num_experiences(), 8);
        Ok(())
    }

    #[test_log::test]
    fn test_save_and_load_replay_buffer() -> Result<()> {
        let dir = TempDir::new("sac")?;
        let hyperparameters = SacSettings::default().batch_size(4).save_replay_buffer(true);
        let mut trainer = trainer(hyperparameters.clone(), &dir)?;
        trainer.process_trajectory(fake_trajectory("a", 5, 3, &spec(), true, None, 0))?;
        trainer.save_model()?;
        let checkpoint = dir.path().join("Walker").join("Walker-5");
        assert!(checkpoint.join("q_network.safetensors").exists());
        assert!(checkpoint.join("entropy_coefficient.safetensors").exists());
        assert!(dir.path().join("Walker").join(REPLAY_BUFFER_FILE).exists());

        let mut restored = self::trainer(hyperparameters, &dir)?;
        restored.initialize_or_load(Some(&checkpoint))?;
        assert_eq!(restored.get_step(), 5);
        assert_eq!(restored.update_buffer().num_experiences(), 5);
        assert_eq!(
            restored.get_policy_weights("Walker")?,
            trainer.get_policy_weights("Walker")?
        );
        Ok(())
    }

    #[test_log::test]
    fn test_unreadable_replay_buffer_starts_empty() -> Result<()> {
        let dir = TempDir::new("sac")?;
        let mut trainer = trainer(SacSettings::default().save_replay_buffer(true), &dir)?;
        std::fs::create_dir_all(dir.path().join("Walker"))?;
        std::fs::write(dir.path().join("Walker").join(REPLAY_BUFFER_FILE), b"garbage")?;
        trainer.load_replay_buffer();
        assert!(trainer.update_buffer().is_empty());
        Ok(())
    }
}
