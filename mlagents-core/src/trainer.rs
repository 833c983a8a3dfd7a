//! Trainers consume trajectories, update a policy and publish its weights.
//!
//! # Training cycle
//!
//! [`Trainer::advance`] is called repeatedly by the training loop:
//!
//! 1. Drain every trajectory queue, taking at most the number of items that
//!    were in the queue when the cycle started, so that the trajectories
//!    stay close to the current policy.
//! 2. Process each trajectory: write a summary every `summary_freq` steps,
//!    checkpoint every `checkpoint_interval` steps and increment the step
//!    counter by the trajectory length.
//! 3. If the trainer is still training and has enough data, update the
//!    policy and put a snapshot of its weights on every policy queue.
//!
//! Concrete trainers implement the algorithm specific parts and keep the
//! shared bookkeeping in a [`TrainerState`].
use crate::{
    error::MlAgentsError,
    policy::PolicyWeights,
    queue::AgentManagerQueue,
    settings::TrainerSettings,
    stats::StatsReporter,
    trajectory::Trajectory,
};
use anyhow::Result;
use log::{debug, info};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    thread,
    time::Duration,
};

/// Name under which environment rewards are collected.
pub const ENVIRONMENT_REWARDS: &str = "environment";

/// Bookkeeping shared by all trainers.
pub struct TrainerState {
    pub brain_name: String,
    pub trainer_settings: TrainerSettings,
    pub is_training: bool,
    pub stats_reporter: StatsReporter,
    step: u64,
    next_summary_step: u64,
    next_save_step: u64,
    reward_buffer: VecDeque<f32>,
    reward_buffer_cap: usize,
    /// Rewards of the current episode per reward signal and agent.
    collected_rewards: BTreeMap<String, HashMap<String, f32>>,
    trajectory_queues: Vec<AgentManagerQueue<Trajectory>>,
    policy_queues: Vec<AgentManagerQueue<Arc<PolicyWeights>>>,
}

impl TrainerState {
    pub fn new(
        brain_name: impl Into<String>,
        trainer_settings: TrainerSettings,
        is_training: bool,
        stats_reporter: StatsReporter,
    ) -> Self {
        let summary_freq = trainer_settings.summary_freq.max(1);
        let checkpoint_interval = trainer_settings.checkpoint_interval.max(1);
        let mut collected_rewards = BTreeMap::new();
        collected_rewards.insert(ENVIRONMENT_REWARDS.to_string(), HashMap::new());
        Self {
            brain_name: brain_name.into(),
            trainer_settings,
            is_training,
            stats_reporter,
            step: 0,
            next_summary_step: summary_freq,
            next_save_step: checkpoint_interval,
            reward_buffer: VecDeque::new(),
            reward_buffer_cap: 1,
            collected_rewards,
            trajectory_queues: vec![],
            policy_queues: vec![],
        }
    }

    /// Number of recent episode rewards kept in the reward buffer.
    pub fn reward_buffer_cap(mut self, v: usize) -> Self {
        self.reward_buffer_cap = v;
        self
    }

    pub fn get_step(&self) -> u64 {
        self.step
    }

    pub fn get_max_steps(&self) -> u64 {
        self.trainer_settings.max_steps
    }

    /// Sets the step counter, e.g. after restoring a checkpoint.
    pub fn set_step(&mut self, step: u64) {
        self.step = step;
        self.next_summary_step = next_interval_step(step, self.trainer_settings.summary_freq);
        self.next_save_step = next_interval_step(step, self.trainer_settings.checkpoint_interval);
    }

    /// Whether the trainer is training and below its step limit.
    pub fn should_still_train(&self) -> bool {
        self.is_training && self.step <= self.trainer_settings.max_steps
    }

    /// Most recent episode rewards, newest first.
    pub fn reward_buffer(&self) -> &VecDeque<f32> {
        &self.reward_buffer
    }

    /// Adds a reward of the current episode of an agent.
    pub fn collect_reward(&mut self, signal: &str, agent_id: &str, value: f32) {
        *self
            .collected_rewards
            .entry(signal.to_string())
            .or_default()
            .entry(agent_id.to_string())
            .or_default() += value;
    }

    /// Reward of the current episode of an agent.
    pub fn collected_reward(&self, signal: &str, agent_id: &str) -> f32 {
        self.collected_rewards
            .get(signal)
            .and_then(|r| r.get(agent_id))
            .copied()
            .unwrap_or(0.0)
    }

    /// Reports the rewards of a finished episode and resets them.
    pub fn update_end_episode_stats(&mut self, agent_id: &str) {
        for (name, rewards) in self.collected_rewards.iter_mut() {
            let value = rewards.remove(agent_id).unwrap_or(0.0);
            if name == ENVIRONMENT_REWARDS {
                self.stats_reporter.add_stat(
                    &self.brain_name,
                    "Environment/Cumulative Reward",
                    value,
                );
                self.reward_buffer.push_front(value);
                self.reward_buffer.truncate(self.reward_buffer_cap);
            } else {
                self.stats_reporter.add_stat(
                    &self.brain_name,
                    &format!("Policy/{} Reward", capitalize(name)),
                    value,
                );
            }
        }
    }

    /// Clears the episode rewards of all agents.
    pub fn end_episode(&mut self) {
        for rewards in self.collected_rewards.values_mut() {
            rewards.clear();
        }
    }

    /// Writes a summary if `step_after` passes the next summary step.
    pub fn maybe_write_summary(&mut self, step_after: u64) {
        if step_after >= self.next_summary_step && self.step != 0 {
            self.write_summary(self.next_summary_step);
        }
    }

    /// Whether a checkpoint is due once the step reaches `step_after`.
    pub fn checkpoint_due(&self, step_after: u64) -> bool {
        step_after >= self.next_save_step && self.step != 0
    }

    /// Increments the step counter while training.
    pub fn increment_step(&mut self, n_steps: usize) {
        if self.should_still_train() {
            self.set_step(self.step + n_steps as u64);
        }
    }

    /// Writes the statistics collected since the last summary.
    pub fn write_summary(&self, step: u64) {
        self.stats_reporter.add_stat(
            &self.brain_name,
            "Is Training",
            if self.should_still_train() { 1.0 } else { 0.0 },
        );
        self.stats_reporter.write_stats(&self.brain_name, step);
    }

    pub fn subscribe_trajectory_queue(&mut self, queue: AgentManagerQueue<Trajectory>) {
        self.trajectory_queues.push(queue);
    }

    pub fn publish_policy_queue(&mut self, queue: AgentManagerQueue<Arc<PolicyWeights>>) {
        self.policy_queues.push(queue);
    }

    pub fn policy_queues(&self) -> &[AgentManagerQueue<Arc<PolicyWeights>>] {
        &self.policy_queues
    }

    /// Takes the trajectories currently in the queues.
    fn take_trajectories(&self) -> Result<Vec<Trajectory>> {
        let mut trajectories = vec![];
        for queue in self.trajectory_queues.iter() {
            for _ in 0..queue.len() {
                match queue.get_nowait() {
                    Ok(t) => trajectories.push(t),
                    Err(e) => match e.downcast_ref::<MlAgentsError>() {
                        Some(MlAgentsError::QueueEmpty) => break,
                        _ => return Err(e),
                    },
                }
            }
        }
        Ok(trajectories)
    }
}

/// Next multiple of `interval` strictly after `step`.
fn next_interval_step(step: u64, interval: u64) -> u64 {
    let interval = interval.max(1);
    step + (interval - step % interval)
}

/// `curiosity` becomes `Curiosity`, as in statistic names.
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// A trainer of one behavior.
pub trait Trainer {
    fn state(&self) -> &TrainerState;

    fn state_mut(&mut self) -> &mut TrainerState;

    /// Adds the experience of a trajectory to the update buffer.
    ///
    /// Implementations call [`Trainer::process_trajectory_steps`] after
    /// their own processing.
    fn process_trajectory(&mut self, trajectory: Trajectory) -> Result<()>;

    /// Whether there is enough data for an update.
    fn is_ready_update(&self) -> bool;

    /// Updates the policy. Returns `true` if the policy changed.
    fn update_policy(&mut self) -> Result<bool>;

    /// Snapshot of the weights of the policy for `behavior_id`.
    fn get_policy_weights(&self, behavior_id: &str) -> Result<PolicyWeights>;

    /// Saves a checkpoint at the current step.
    fn save_checkpoint(&mut self) -> Result<()>;

    /// Saves the final model.
    fn save_model(&mut self) -> Result<()> {
        self.save_checkpoint()
    }

    /// Drops data collected for an update, called when training stopped.
    fn clear_update_buffer(&mut self) {}

    fn get_step(&self) -> u64 {
        self.state().get_step()
    }

    fn should_still_train(&self) -> bool {
        self.state().should_still_train()
    }

    /// Clears the episode bookkeeping of all agents.
    fn end_episode(&mut self) {
        self.state_mut().end_episode();
    }

    /// Summary, checkpoint and step bookkeeping for a processed trajectory.
    fn process_trajectory_steps(&mut self, n_steps: usize) -> Result<()> {
        let step_after = self.get_step() + n_steps as u64;
        self.state_mut().maybe_write_summary(step_after);
        if self.state().checkpoint_due(step_after) {
            debug!("Checkpointing {} at step {}", self.state().brain_name, self.get_step());
            self.save_checkpoint()?;
        }
        self.state_mut().increment_step(n_steps);
        Ok(())
    }

    /// One training cycle.
    fn advance(&mut self) -> Result<()> {
        let trajectories = self.state().take_trajectories()?;
        if trajectories.is_empty() && self.state().trainer_settings.threaded {
            thread::sleep(Duration::from_micros(100));
        }
        for trajectory in trajectories {
            self.process_trajectory(trajectory)?;
        }

        if self.should_still_train() {
            if self.is_ready_update() && self.update_policy()? {
                for queue in self.state().policy_queues().iter() {
                    let weights = self.get_policy_weights(queue.behavior_id())?;
                    queue.put(Arc::new(weights))?;
                }
            }
        } else {
            self.clear_update_buffer();
        }
        Ok(())
    }

    /// Logs the hyperparameters and writes them as text.
    fn write_hyperparameters(&self) -> Result<()> {
        let state = self.state();
        let text = serde_yaml::to_string(&state.trainer_settings)?;
        info!("Hyperparameters for behavior name {}:\n{}", state.brain_name, text);
        state.stats_reporter.write_text(&state.brain_name, &text, state.get_step());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        queue::QueueFullPolicy,
        stats::test::MemoryWriter,
        trajectory::test::make_fake_trajectory,
    };

    /// Counts trajectories and updates once it has seen `batch` steps.
    struct CountingTrainer {
        state: TrainerState,
        buffered: usize,
        batch: usize,
        updates: usize,
        checkpoints: Vec<u64>,
    }

    impl CountingTrainer {
        fn new(settings: TrainerSettings, reporter: StatsReporter) -> Self {
            Self {
                state: TrainerState::new("brain", settings, true, reporter).reward_buffer_cap(2),
                buffered: 0,
                batch: 10,
                updates: 0,
                checkpoints: vec![],
            }
        }
    }

    impl Trainer for CountingTrainer {
        fn state(&self) -> &TrainerState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut TrainerState {
            &mut self.state
        }

        fn process_trajectory(&mut self, trajectory: Trajectory) -> Result<()> {
            for step in trajectory.steps.iter() {
                self.state
                    .collect_reward(ENVIRONMENT_REWARDS, &trajectory.agent_id, step.reward);
            }
            if trajectory.done_reached() {
                self.state.update_end_episode_stats(&trajectory.agent_id);
            }
            self.buffered += trajectory.len();
            self.process_trajectory_steps(trajectory.len())
        }

        fn is_ready_update(&self) -> bool {
            self.buffered >= self.batch
        }

        fn update_policy(&mut self) -> Result<bool> {
            self.buffered = 0;
            self.updates += 1;
            Ok(true)
        }

        fn get_policy_weights(&self, _behavior_id: &str) -> Result<PolicyWeights> {
            Ok(PolicyWeights {
                step: self.get_step(),
                weights: vec![],
            })
        }

        fn save_checkpoint(&mut self) -> Result<()> {
            self.checkpoints.push(self.get_step());
            Ok(())
        }

        fn clear_update_buffer(&mut self) {
            self.buffered = 0;
        }
    }

    fn queues(
        trainer: &mut CountingTrainer,
    ) -> (
        AgentManagerQueue<Trajectory>,
        AgentManagerQueue<Arc<PolicyWeights>>,
    ) {
        let trajectory_queue = AgentManagerQueue::new("brain?team=0", 4, QueueFullPolicy::DropOldest);
        let policy_queue = AgentManagerQueue::new("brain?team=0", 1, QueueFullPolicy::DropOldest);
        trainer.state_mut().subscribe_trajectory_queue(trajectory_queue.clone());
        trainer.state_mut().publish_policy_queue(policy_queue.clone());
        (trajectory_queue, policy_queue)
    }

    #[test]
    fn test_next_interval_step() {
        assert_eq!(next_interval_step(0, 10), 10);
        assert_eq!(next_interval_step(9, 10), 10);
        assert_eq!(next_interval_step(10, 10), 20);
    }

    #[test]
    fn test_advance_updates_and_publishes() -> Result<()> {
        let settings = TrainerSettings::default().summary_freq(1000);
        let mut trainer = CountingTrainer::new(settings, StatsReporter::new(vec![]));
        let (trajectory_queue, policy_queue) = queues(&mut trainer);

        trajectory_queue.put(make_fake_trajectory(6, 3, 0, false))?;
        trainer.advance()?;
        assert_eq!(trainer.get_step(), 6);
        assert_eq!(trainer.updates, 0);
        assert!(policy_queue.is_empty());

        trajectory_queue.put(make_fake_trajectory(6, 3, 0, true))?;
        trainer.advance()?;
        assert_eq!(trainer.get_step(), 12);
        assert_eq!(trainer.updates, 1);
        assert_eq!(policy_queue.get_nowait()?.step, 12);
        assert_eq!(trainer.state().reward_buffer().len(), 1);
        Ok(())
    }

    #[test]
    fn test_advance_drains_at_most_queue_size() -> Result<()> {
        let mut trainer = CountingTrainer::new(TrainerSettings::default(), StatsReporter::new(vec![]));
        let (trajectory_queue, _) = queues(&mut trainer);
        for _ in 0..6 {
            trajectory_queue.put(make_fake_trajectory(1, 3, 0, false))?;
        }
        // The queue keeps the 4 newest.
        trainer.advance()?;
        assert_eq!(trainer.get_step(), 4);
        assert!(trajectory_queue.is_empty());
        Ok(())
    }

    #[test]
    fn test_max_steps_stops_training() -> Result<()> {
        let settings = TrainerSettings::default().max_steps(12);
        let mut trainer = CountingTrainer::new(settings, StatsReporter::new(vec![]));
        let (trajectory_queue, policy_queue) = queues(&mut trainer);
        for _ in 0..4 {
            trajectory_queue.put(make_fake_trajectory(6, 3, 0, false))?;
            trainer.advance()?;
        }
        // The step stops increasing once above max_steps.
        assert_eq!(trainer.get_step(), 18);
        assert!(!trainer.should_still_train());
        assert_eq!(trainer.updates, 1);
        assert_eq!(trainer.buffered, 0);
        assert_eq!(policy_queue.len(), 1);
        Ok(())
    }

    #[test_log::test]
    fn test_summary_and_checkpoint_intervals() -> Result<()> {
        let writer = MemoryWriter::default();
        let reporter = StatsReporter::new(vec![Box::new(writer.clone())]);
        let settings = TrainerSettings::default()
            .summary_freq(10)
            .checkpoint_interval(20);
        let mut trainer = CountingTrainer::new(settings, reporter);
        let (trajectory_queue, _) = queues(&mut trainer);

        for _ in 0..5 {
            trajectory_queue.put(make_fake_trajectory(6, 3, 0, true))?;
            trainer.advance()?;
        }
        assert_eq!(trainer.get_step(), 30);

        let stats = writer.stats.lock().unwrap();
        let summary_steps: Vec<u64> = stats
            .iter()
            .filter(|(_, key, _, _)| key == "Is Training")
            .map(|(_, _, _, step)| *step)
            .collect();
        assert_eq!(summary_steps, vec![10, 20, 30]);
        assert!(stats
            .iter()
            .any(|(_, key, _, _)| key == "Environment/Cumulative Reward"));
        assert_eq!(trainer.checkpoints, vec![18]);
        assert_eq!(trainer.state().reward_buffer().len(), 2);
        Ok(())
    }

    #[test]
    fn test_end_episode_resets_rewards() {
        let mut state = TrainerState::new(
            "brain",
            TrainerSettings::default(),
            true,
            StatsReporter::new(vec![]),
        );
        state.collect_reward(ENVIRONMENT_REWARDS, "a", 1.5);
        state.collect_reward("curiosity", "a", 0.5);
        assert_eq!(state.collected_reward(ENVIRONMENT_REWARDS, "a"), 1.5);
        state.end_episode();
        assert_eq!(state.collected_reward(ENVIRONMENT_REWARDS, "a"), 0.0);

        state.collect_reward("curiosity", "a", 0.5);
        state.update_end_episode_stats("a");
        assert_eq!(
            state.stats_reporter.get_mean_stat("brain", "Policy/Curiosity Reward"),
            0.5
        );
    }
}
