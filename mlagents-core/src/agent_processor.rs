//! Turns batched environment steps into per-agent trajectories.
//!
//! The processor remembers, for every agent, the last decision request and
//! the policy output for it. When the consequence of that action arrives
//! with the next step, an [`AgentExperience`] is recorded. Trajectories are
//! emitted on episode end or when the time horizon is reached.
use crate::{
    behavior::{get_global_agent_id, get_global_group_id, ActionTuple},
    policy::{ActionInfo, Policy, PolicyWeights, RunOutput},
    queue::AgentManagerQueue,
    stats::StatsReporter,
    steps::{AgentStep, DecisionStep, DecisionSteps, TerminalSteps},
    trajectory::{AgentExperience, AgentStatus, Trajectory},
};
use anyhow::Result;
use log::trace;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// Collects the experience of the agents of one behavior.
pub struct AgentProcessor<P: Policy> {
    policy: P,
    behavior_id: String,
    /// Category of the statistics, usually the brain name.
    category: String,
    stats_reporter: StatsReporter,
    max_trajectory_length: usize,
    trajectory_queues: Vec<AgentManagerQueue<Trajectory>>,

    experience_buffers: HashMap<String, Vec<AgentExperience>>,
    /// Last decision request of an agent and its row in the policy output.
    last_step_result: HashMap<String, (DecisionStep, usize)>,
    last_take_action_outputs: HashMap<String, Arc<RunOutput>>,
    /// Latest observations of the agents of a group.
    current_group_obs: HashMap<String, BTreeMap<String, Vec<Vec<f32>>>>,
    group_status: HashMap<String, BTreeMap<String, AgentStatus>>,
    episode_steps: HashMap<String, usize>,
    episode_rewards: HashMap<String, f32>,
}

impl<P: Policy> AgentProcessor<P> {
    /// `max_trajectory_length` is the time horizon of the trainer.
    pub fn new(
        policy: P,
        behavior_id: impl Into<String>,
        category: impl Into<String>,
        stats_reporter: StatsReporter,
        max_trajectory_length: usize,
    ) -> Self {
        Self {
            policy,
            behavior_id: behavior_id.into(),
            category: category.into(),
            stats_reporter,
            max_trajectory_length: max_trajectory_length.max(1),
            trajectory_queues: vec![],
            experience_buffers: HashMap::new(),
            last_step_result: HashMap::new(),
            last_take_action_outputs: HashMap::new(),
            current_group_obs: HashMap::new(),
            group_status: HashMap::new(),
            episode_steps: HashMap::new(),
            episode_rewards: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn behavior_id(&self) -> &str {
        &self.behavior_id
    }

    /// Adds a queue that receives every emitted trajectory.
    pub fn publish_trajectory_queue(&mut self, queue: AgentManagerQueue<Trajectory>) {
        self.trajectory_queues.push(queue);
    }

    /// Records the results of the actions in `previous_action`.
    ///
    /// `decision_steps` and `terminal_steps` are what the environment
    /// returned after the actions were applied.
    pub fn add_experiences(
        &mut self,
        decision_steps: &DecisionSteps,
        terminal_steps: &TerminalSteps,
        worker_id: usize,
        previous_action: &ActionInfo,
    ) -> Result<()> {
        let outputs = Arc::new(previous_action.outputs.clone());
        for entropy in outputs.entropy.iter() {
            self.stats_reporter
                .add_stat(&self.category, "Policy/Entropy", *entropy);
        }

        let action_global_ids: Vec<String> = previous_action
            .agent_ids
            .iter()
            .map(|&id| get_global_agent_id(worker_id, id))
            .collect();
        for global_id in action_global_ids.iter() {
            // Agents without a stored step just reset.
            if self.last_step_result.contains_key(global_id) {
                self.last_take_action_outputs
                    .insert(global_id.clone(), outputs.clone());
            }
        }

        let terminal: Vec<AgentStep> = terminal_steps.iter().map(AgentStep::Terminal).collect();
        for step in terminal.iter() {
            self.add_group_status_and_obs(step, worker_id);
        }
        for (index, step) in terminal.iter().enumerate() {
            self.process_step(step, worker_id, index)?;
            let global_id = get_global_agent_id(worker_id, step.agent_id());
            self.clear_group_status_and_obs(&global_id);
        }

        let decision: Vec<AgentStep> = decision_steps.iter().map(AgentStep::Decision).collect();
        for step in decision.iter() {
            self.add_group_status_and_obs(step, worker_id);
        }
        for (index, step) in decision.iter().enumerate() {
            self.process_step(step, worker_id, index)?;
        }

        for (row, global_id) in action_global_ids.iter().enumerate() {
            if !self.last_step_result.contains_key(global_id) {
                continue;
            }
            if let Some(discrete) = previous_action.action.discrete.get(row) {
                let action = ActionTuple {
                    continuous: vec![],
                    discrete: vec![discrete.clone()],
                };
                self.policy
                    .save_previous_action(&[global_id.clone()], &action);
            }
        }
        Ok(())
    }

    fn add_group_status_and_obs(&mut self, step: &AgentStep, worker_id: usize) {
        // Group 0 means no group.
        if step.group_id() <= 0 {
            return;
        }
        let global_id = get_global_agent_id(worker_id, step.agent_id());
        let (stored_step, idx) = match self.last_step_result.get(&global_id) {
            Some(s) => s,
            None => return,
        };
        let outputs = match self.last_take_action_outputs.get(&global_id) {
            Some(o) => o,
            None => return,
        };
        let global_group_id = get_global_group_id(worker_id, step.group_id());
        let status = AgentStatus {
            obs: stored_step.obs.clone(),
            reward: step.reward(),
            action: outputs.action.row(*idx),
            done: step.is_terminal(),
        };
        self.group_status
            .entry(global_group_id.clone())
            .or_default()
            .insert(global_id.clone(), status);
        self.current_group_obs
            .entry(global_group_id)
            .or_default()
            .insert(global_id, step.obs().clone());
    }

    fn clear_group_status_and_obs(&mut self, global_id: &str) {
        for statuses in self.group_status.values_mut() {
            statuses.remove(global_id);
        }
        for obs in self.current_group_obs.values_mut() {
            obs.remove(global_id);
        }
    }

    fn process_step(&mut self, step: &AgentStep, worker_id: usize, index: usize) -> Result<()> {
        let terminated = step.is_terminal();
        let global_id = get_global_agent_id(worker_id, step.agent_id());
        let global_group_id = get_global_group_id(worker_id, step.group_id());

        let stored = if let AgentStep::Decision(decision) = step {
            self.last_step_result
                .insert(global_id.clone(), (decision.clone(), index))
        } else {
            self.last_step_result.get(&global_id).cloned()
        };
        let outputs = self.last_take_action_outputs.get(&global_id).cloned();

        // The step is the consequence of a past action.
        if let (Some((stored_step, idx)), Some(outputs)) = (stored, outputs) {
            let memory = if self.policy.use_recurrent() {
                self.policy
                    .retrieve_previous_memories(&[global_id.clone()])
                    .pop()
            } else {
                None
            };
            let prev_action = self
                .policy
                .retrieve_previous_action(&[global_id.clone()])
                .pop()
                .unwrap_or_default();
            let group_status = self
                .group_status
                .get(&global_group_id)
                .map(|statuses| {
                    statuses
                        .iter()
                        .filter(|(id, _)| **id != global_id)
                        .map(|(_, s)| s.clone())
                        .collect()
                })
                .unwrap_or_default();

            let experience = AgentExperience {
                obs: stored_step.obs,
                reward: step.reward(),
                done: terminated,
                action: outputs.action.row(idx),
                action_probs: outputs.log_probs.row(idx),
                action_mask: stored_step.action_mask,
                prev_action,
                interrupted: step.interrupted(),
                memory,
                group_status,
                group_reward: step.group_reward(),
            };
            self.experience_buffers
                .entry(global_id.clone())
                .or_default()
                .push(experience);
            *self.episode_rewards.entry(global_id.clone()).or_default() += step.reward();
            if !terminated {
                *self.episode_steps.entry(global_id.clone()).or_default() += 1;
            }

            let n_experiences = self.experience_buffers.get(&global_id).map_or(0, |b| b.len());
            if n_experiences >= self.max_trajectory_length || terminated {
                let next_group_obs = self
                    .current_group_obs
                    .get(&global_group_id)
                    .map(|obs| {
                        obs.iter()
                            .filter(|(id, _)| **id != global_id)
                            .map(|(_, o)| o.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                let trajectory = Trajectory {
                    steps: self.experience_buffers.remove(&global_id).unwrap_or_default(),
                    next_obs: step.obs().clone(),
                    next_group_obs,
                    agent_id: global_id.clone(),
                    behavior_id: self.behavior_id.clone(),
                };
                trace!(
                    "Trajectory of {} steps for {}",
                    trajectory.len(),
                    trajectory.agent_id
                );
                for queue in self.trajectory_queues.iter() {
                    queue.put(trajectory.clone())?;
                }
            }

            if terminated {
                let episode_length = self.episode_steps.get(&global_id).copied().unwrap_or(0);
                self.stats_reporter.add_stat(
                    &self.category,
                    "Environment/Episode Length",
                    episode_length as f32,
                );
                self.clean_agent_data(&global_id);
            }
        } else if terminated {
            // Terminated before ever acting.
            self.clean_agent_data(&global_id);
        }
        Ok(())
    }

    fn clean_agent_data(&mut self, global_id: &str) {
        self.experience_buffers.remove(global_id);
        self.last_take_action_outputs.remove(global_id);
        self.last_step_result.remove(global_id);
        self.episode_steps.remove(global_id);
        self.episode_rewards.remove(global_id);
        let ids = [global_id.to_string()];
        self.policy.remove_previous_action(&ids);
        self.policy.remove_memories(&ids);
    }

    /// Drops the in-progress experience of all agents.
    pub fn end_episode(&mut self) {
        let ids: Vec<String> = self.experience_buffers.keys().cloned().collect();
        for id in ids {
            self.clean_agent_data(&id);
        }
    }

    /// Reward collected by an agent in its current episode.
    pub fn episode_reward(&self, global_id: &str) -> f32 {
        self.episode_rewards.get(global_id).copied().unwrap_or(0.0)
    }

    /// Number of steps recorded for an agent and not yet emitted.
    pub fn pending_experiences(&self, global_id: &str) -> usize {
        self.experience_buffers.get(global_id).map_or(0, |b| b.len())
    }
}

/// An [`AgentProcessor`] together with the queue delivering new policy weights from the trainer.
pub struct AgentManager<P: Policy> {
    pub processor: AgentProcessor<P>,
    pub policy_queue: AgentManagerQueue<Arc<PolicyWeights>>,
}

impl<P: Policy> AgentManager<P> {
    pub fn new(processor: AgentProcessor<P>, policy_queue: AgentManagerQueue<Arc<PolicyWeights>>) -> Self {
        Self {
            processor,
            policy_queue,
        }
    }

    /// Loads the most recent weights published by the trainer, if any.
    ///
    /// Returns whether the policy changed.
    pub fn update_policy(&mut self) -> Result<bool> {
        let latest = self.policy_queue.drain(usize::MAX).pop();
        match latest {
            Some(weights) => {
                self.processor.policy_mut().load_weights(&weights)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        policy::test::{hybrid_spec, RandomPolicy},
        queue::QueueFullPolicy,
        steps::{DecisionSteps, TerminalSteps},
    };

    fn decision(ids: &[i32], group: i32, reward: f32) -> DecisionSteps {
        let n = ids.len();
        DecisionSteps {
            obs: vec![ids.iter().map(|&i| vec![i as f32; 3]).collect()],
            reward: vec![reward; n],
            agent_id: ids.to_vec(),
            action_mask: Some(vec![vec![false, false]; n]),
            group_id: vec![group; n],
            group_reward: vec![0.0; n],
        }
    }

    fn terminal(ids: &[i32], group: i32, reward: f32) -> TerminalSteps {
        let n = ids.len();
        TerminalSteps {
            obs: vec![ids.iter().map(|&i| vec![i as f32; 3]).collect()],
            reward: vec![reward; n],
            interrupted: vec![false; n],
            agent_id: ids.to_vec(),
            group_id: vec![group; n],
            group_reward: vec![0.0; n],
        }
    }

    fn processor(
        time_horizon: usize,
        recurrent: bool,
    ) -> (
        AgentProcessor<RandomPolicy>,
        AgentManagerQueue<Trajectory>,
        StatsReporter,
    ) {
        let reporter = StatsReporter::new(vec![]);
        let policy = RandomPolicy::new(hybrid_spec(3), recurrent);
        let mut processor =
            AgentProcessor::new(policy, "brain?team=0", "brain", reporter.clone(), time_horizon);
        let queue = AgentManagerQueue::new("brain?team=0", 0, QueueFullPolicy::Block);
        processor.publish_trajectory_queue(queue.clone());
        (processor, queue, reporter)
    }

    #[test]
    fn test_time_horizon() -> Result<()> {
        let (mut processor, queue, _) = processor(5, true);
        let empty_terminal = terminal(&[], 0, 0.0);
        let mut action_info = ActionInfo::empty();

        for _ in 0..12 {
            let steps = decision(&[0, 1], 0, 1.0);
            processor.add_experiences(&steps, &empty_terminal, 0, &action_info)?;
            action_info = processor.policy_mut().get_action(&steps, 0)?;
        }
        // 11 experiences per agent: two full trajectories each
        let trajectories = queue.drain(usize::MAX);
        assert_eq!(trajectories.len(), 4);
        assert!(trajectories.iter().all(|t| t.len() == 5 && !t.done_reached()));
        assert_eq!(processor.pending_experiences("agent_id=0-0"), 1);

        let memory = trajectories[0].steps[0].memory.as_ref().unwrap();
        assert_eq!(memory.len(), 2);
        Ok(())
    }

    #[test]
    fn test_terminal_step_emits_trajectory() -> Result<()> {
        let (mut processor, queue, reporter) = processor(100, false);
        let no_terminal = terminal(&[], 0, 0.0);
        let no_decision = decision(&[], 0, 0.0);

        let steps = decision(&[7], 0, 0.0);
        processor.add_experiences(&steps, &no_terminal, 1, &ActionInfo::empty())?;
        let action_info = processor.policy_mut().get_action(&steps, 1)?;
        processor.add_experiences(&decision(&[7], 0, 1.0), &no_terminal, 1, &action_info)?;
        let action_info = processor.policy_mut().get_action(&steps, 1)?;
        processor.add_experiences(&no_decision, &terminal(&[7], 0, 2.0), 1, &action_info)?;

        let trajectories = queue.drain(usize::MAX);
        assert_eq!(trajectories.len(), 1);
        let trajectory = &trajectories[0];
        assert_eq!(trajectory.len(), 2);
        assert!(trajectory.done_reached());
        assert_eq!(trajectory.agent_id, "agent_id=1-7");
        assert_eq!(trajectory.steps[1].reward, 2.0);

        assert_eq!(processor.episode_reward("agent_id=1-7"), 0.0);
        assert_eq!(reporter.get_mean_stat("brain", "Environment/Episode Length"), 1.0);
        assert_eq!(processor.pending_experiences("agent_id=1-7"), 0);
        Ok(())
    }

    #[test]
    fn test_group_status() -> Result<()> {
        let (mut processor, queue, _) = processor(2, false);
        let no_terminal = terminal(&[], 0, 0.0);
        let mut action_info = ActionInfo::empty();
        for _ in 0..3 {
            let steps = decision(&[0, 1, 2], 1, 0.5);
            processor.add_experiences(&steps, &no_terminal, 0, &action_info)?;
            action_info = processor.policy_mut().get_action(&steps, 0)?;
        }
        let trajectories = queue.drain(usize::MAX);
        assert_eq!(trajectories.len(), 3);
        for trajectory in trajectories.iter() {
            assert_eq!(trajectory.steps[1].group_status.len(), 2);
            assert_eq!(trajectory.next_group_obs.len(), 2);
        }
        Ok(())
    }

    #[test]
    fn test_end_episode_clears_agents() -> Result<()> {
        let (mut processor, queue, _) = processor(100, true);
        let no_terminal = terminal(&[], 0, 0.0);
        let steps = decision(&[0], 0, 0.0);
        processor.add_experiences(&steps, &no_terminal, 0, &ActionInfo::empty())?;
        let action_info = processor.policy_mut().get_action(&steps, 0)?;
        processor.add_experiences(&steps, &no_terminal, 0, &action_info)?;
        assert_eq!(processor.pending_experiences("agent_id=0-0"), 1);

        processor.end_episode();
        assert_eq!(processor.pending_experiences("agent_id=0-0"), 0);
        let ids = vec!["agent_id=0-0".to_string()];
        assert_eq!(processor.policy().retrieve_memories(&ids), vec![vec![0.0, 0.0]]);
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn test_agent_manager_loads_latest_weights() -> Result<()> {
        let (processor, _, _) = processor(10, false);
        let policy_queue = AgentManagerQueue::new("brain?team=0", 2, QueueFullPolicy::DropOldest);
        let mut manager = AgentManager::new(processor, policy_queue.clone());
        assert!(!manager.update_policy()?);
        for step in 1..=3 {
            policy_queue.put(Arc::new(PolicyWeights {
                step,
                weights: vec![],
            }))?;
        }
        assert!(manager.update_policy()?);
        assert_eq!(manager.processor.policy().get_current_step(), 3);
        Ok(())
    }
}
