use super::module::cloning_loss;
use crate::{
    opt::{Optimizer, OptimizerConfig},
    policy::CandlePolicy,
    saver::ModelSaver,
    trainer_factory::TrainerContext,
    util::to_scalar,
};
use anyhow::Result;
use log::{debug, info};
use mlagents_core::{
    behavior::BehaviorSpec,
    buffer::BufferKey,
    demo::DemoManager,
    error::MlAgentsError,
    policy::{Policy, PolicyWeights},
    record::{Record, RecordValue},
    settings::{BcSettings, Hyperparameters, TrainerSettings},
    trainer::{Trainer, TrainerState, ENVIRONMENT_REWARDS},
    trajectory::Trajectory,
};
use rand::{rngs::StdRng, SeedableRng};
use std::path::Path;

/// Offline trainer imitating recorded demonstrations.
///
/// Demonstrations are reloaded before every update so that files recorded
/// while training are picked up. Trajectories from the environment only
/// feed the reward statistics and the step counter.
pub struct BcTrainer {
    state: TrainerState,
    policy: CandlePolicy,
    hyperparameters: BcSettings,
    demo_manager: DemoManager,
    optimizer: Optimizer,
    saver: ModelSaver,
    rng: StdRng,
}

impl BcTrainer {
    pub fn new(
        brain_name: &str,
        behavior_spec: BehaviorSpec,
        trainer_settings: TrainerSettings,
        ctx: &TrainerContext,
    ) -> Result<Self> {
        trainer_settings.validate(brain_name)?;
        let hyperparameters = match &trainer_settings.hyperparameters {
            Hyperparameters::Bc(h) => h.clone(),
            h => {
                return Err(MlAgentsError::Config(format!(
                    "behavioral cloning trainer got {} hyperparameters",
                    h.trainer_type()
                ))
                .into())
            }
        };
        let demo_path = trainer_settings
            .behavioral_cloning
            .as_ref()
            .map(|bc| bc.demo_path.clone())
            .unwrap_or_default();

        let policy = CandlePolicy::new(
            behavior_spec.clone(),
            &trainer_settings,
            false,
            false,
            ctx.device.clone(),
        )?;
        let demo_manager = DemoManager::new(
            demo_path,
            policy.sequence_length(),
            Some(behavior_spec),
            DemoManager::DEFAULT_BUFFER_SIZE,
        )?;
        let optimizer = OptimizerConfig::default()
            .learning_rate(hyperparameters.learning_rate as f64)
            .build(policy.varmap().all_vars())?;
        let mut saver = ModelSaver::new(ctx.model_path(brain_name), trainer_settings.keep_checkpoints);
        saver.register("policy", policy.varmap());
        let rng = StdRng::seed_from_u64(trainer_settings.seed);

        Ok(Self {
            state: TrainerState::new(
                brain_name,
                trainer_settings,
                ctx.is_training,
                ctx.stats_reporter.clone(),
            ),
            policy,
            hyperparameters,
            demo_manager,
            optimizer,
            saver,
            rng,
        })
    }

    pub fn policy(&self) -> &CandlePolicy {
        &self.policy
    }

    pub fn demo_manager(&self) -> &DemoManager {
        &self.demo_manager
    }

    /// Restores the policy and the step from a checkpoint directory.
    pub fn initialize_or_load(&mut self, path: Option<&Path>) -> Result<()> {
        let step = self.saver.initialize_or_load(path)?;
        self.policy.set_step(step);
        self.state.set_step(step);
        Ok(())
    }

    /// `(sequences, steps)` per mini batch.
    fn batch_shape(&self) -> (usize, usize) {
        let seq_len = self.policy.sequence_length().max(1);
        let num_sequences = (self.hyperparameters.batch_size / seq_len).max(1);
        (num_sequences, num_sequences * seq_len)
    }
}

impl Trainer for BcTrainer {
    fn state(&self) -> &TrainerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut TrainerState {
        &mut self.state
    }

    fn process_trajectory(&mut self, trajectory: Trajectory) -> Result<()> {
        let agent_buffer = trajectory.to_agentbuffer();
        let rewards: f32 = agent_buffer
            .field(&BufferKey::EnvironmentRewards)?
            .scalars()
            .iter()
            .sum();
        self.state
            .collect_reward(ENVIRONMENT_REWARDS, &trajectory.agent_id, rewards);
        if trajectory.done_reached() {
            self.state.update_end_episode_stats(&trajectory.agent_id);
        }
        self.process_trajectory_steps(trajectory.len())?;
        self.policy.set_step(self.state.get_step());
        Ok(())
    }

    fn is_ready_update(&self) -> bool {
        let (_, steps_per_batch) = self.batch_shape();
        self.demo_manager.demo_buffer().num_experiences() >= steps_per_batch
    }

    fn update_policy(&mut self) -> Result<bool> {
        let new_steps = self.demo_manager.refresh()?;
        if new_steps > 0 {
            info!("Picked up {} new demonstration steps", new_steps);
        }

        let (num_sequences, steps_per_batch) = self.batch_shape();
        let seq_len = self.policy.sequence_length();
        let demos = self.demo_manager.demo_buffer();
        let num_batches = (demos.num_experiences() / steps_per_batch)
            .min(self.hyperparameters.batches_per_epoch);
        if num_batches == 0 {
            return Ok(false);
        }

        let mut losses = vec![];
        for _ in 0..num_batches {
            let batch = demos.sample_mini_batch(steps_per_batch, seq_len, &mut self.rng);
            let loss = cloning_loss(&mut self.policy, &batch, num_sequences)?;
            self.optimizer.backward_step(&loss)?;
            losses.push(to_scalar(&loss)?);
        }
        debug!("Cloning update of {} on {} mini batches", self.state.brain_name, num_batches);

        Record::from_slice(&[
            (
                "Losses/Cloning Loss",
                RecordValue::Scalar(losses.iter().sum::<f32>() / losses.len() as f32),
            ),
            (
                "Policy/Learning Rate",
                RecordValue::Scalar(self.optimizer.learning_rate() as f32),
            ),
        ])
        .report(&self.state.stats_reporter, &self.state.brain_name);
        Ok(true)
    }

    fn get_policy_weights(&self, _behavior_id: &str) -> Result<PolicyWeights> {
        self.policy.get_weights()
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        self.saver
            .save_checkpoint(&self.state.brain_name, self.state.get_step())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{fake_trajectory, small_settings, vector_spec, write_fake_demo};
    use mlagents_core::{
        behavior::ActionSpec, settings::BehavioralCloningSettings, stats::StatsReporter,
    };
    use tempdir::TempDir;

    fn trainer(dir: &TempDir) -> Result<BcTrainer> {
        let settings = small_settings()
            .hyperparameters(Hyperparameters::Bc(BcSettings {
                batch_size: 8,
                batches_per_epoch: 3,
                learning_rate: 1e-3,
            }))
            .behavioral_cloning(Some(BehavioralCloningSettings {
                demo_path: dir.path().join("demos"),
                ..Default::default()
            }));
        let ctx = TrainerContext::new(dir.path().join("results"), StatsReporter::new(vec![]));
        BcTrainer::new("Expert", vector_spec(2, ActionSpec::create_continuous(1)), settings, &ctx)
    }

    #[test_log::test]
    fn test_waits_for_demonstrations() -> Result<()> {
        let dir = TempDir::new("bc_trainer")?;
        std::fs::create_dir(dir.path().join("demos"))?;
        let mut trainer = trainer(&dir)?;
        assert!(!trainer.is_ready_update());
        assert!(!trainer.update_policy()?);

        // Files recorded after the start are loaded on the next update.
        write_fake_demo(&dir.path().join("demos").join("a.demo"), 21)?;
        let before = trainer.get_policy_weights("Expert")?;
        assert!(trainer.update_policy()?);
        assert_eq!(trainer.demo_manager().demo_buffer().num_experiences(), 20);
        assert!(trainer.is_ready_update());
        assert_ne!(trainer.get_policy_weights("Expert")?, before);

        let reporter = &trainer.state().stats_reporter;
        assert_eq!(reporter.get_num_stats("Expert", "Losses/Cloning Loss"), 1);
        Ok(())
    }

    #[test_log::test]
    fn test_trajectories_only_count_steps() -> Result<()> {
        let dir = TempDir::new("bc_trainer")?;
        std::fs::create_dir(dir.path().join("demos"))?;
        let mut trainer = trainer(&dir)?;
        let spec = ActionSpec::create_continuous(1);
        trainer.process_trajectory(fake_trajectory("a", 5, 2, &spec, true, None, 0))?;
        assert_eq!(trainer.get_step(), 5);
        let reporter = &trainer.state().stats_reporter;
        assert_eq!(reporter.get_mean_stat("Expert", "Environment/Cumulative Reward"), 5.0);
        Ok(())
    }
}
