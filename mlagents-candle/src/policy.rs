//! Policy backed by a candle actor network.
use crate::{
    distributions::{ActionOutput, ActionTensors, LogProbTensors},
    networks::SimpleActor,
    util::{
        load_varmap, load_weights_into_varmap, obs_to_tensors, rows_to_tensor, save_varmap,
        tensor_to_rows, varmap_to_weights,
    },
};
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::{debug, info};
use mlagents_core::{
    behavior::BehaviorSpec,
    buffer::AgentBuffer,
    policy::{extract_masks, MemoryStore, Policy, PolicyWeights, RunOutput},
    settings::{NetworkSettings, TrainerSettings},
    steps::DecisionSteps,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{collections::HashMap, fs, path::Path};

/// File name of the parameters of a saved policy.
pub const POLICY_FILE: &str = "policy.safetensors";

/// A policy whose parameters live in a [`VarMap`].
///
/// PPO, COMA and behavioral cloning use a state independent standard
/// deviation and clipped continuous actions. SAC uses a state dependent one
/// and squashes the actions with tanh.
pub struct CandlePolicy {
    behavior_spec: BehaviorSpec,
    network_settings: NetworkSettings,
    sequence_length: usize,
    varmap: VarMap,
    device: Device,
    actor: SimpleActor,
    memory_store: MemoryStore,
    step: u64,
    rng: StdRng,
}

impl CandlePolicy {
    pub fn new(
        behavior_spec: BehaviorSpec,
        trainer_settings: &TrainerSettings,
        tanh_squash: bool,
        conditional_sigma: bool,
        device: Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network_settings = trainer_settings.network_settings.clone();
        let actor = SimpleActor::new(
            vb.pp("actor"),
            &behavior_spec.observation_specs,
            &network_settings,
            &behavior_spec.action_spec,
            conditional_sigma,
            tanh_squash,
        )?;
        let memory_store = MemoryStore::new(
            actor.memory_size(),
            behavior_spec.action_spec.discrete_size(),
        );
        debug!(
            "Created a policy with {} parameters",
            varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>()
        );

        Ok(Self {
            behavior_spec,
            network_settings,
            sequence_length: trainer_settings.sequence_length(),
            varmap,
            device,
            actor,
            memory_store,
            step: 0,
            rng: StdRng::seed_from_u64(trainer_settings.seed),
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn network_settings(&self) -> &NetworkSettings {
        &self.network_settings
    }

    pub fn num_obs(&self) -> usize {
        self.behavior_spec.observation_specs.len()
    }

    /// Updates the observation normalizers with the observations of a buffer.
    pub fn update_normalization(&self, buffer: &AgentBuffer) -> Result<()> {
        if !self.network_settings.normalize {
            return Ok(());
        }
        let obs = obs_to_tensors(buffer, self.num_obs(), &self.device)?;
        self.actor.update_normalization(&obs)
    }

    /// Samples actions, keeping the graph for gradients.
    pub fn sample_actions(
        &mut self,
        obs: &[Tensor],
        masks: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: usize,
    ) -> Result<ActionOutput> {
        let (output, _) =
            self.actor
                .get_action_and_stats(obs, masks, memories, sequence_length, &mut self.rng)?;
        Ok(output)
    }

    /// Log probabilities and entropy of recorded actions, keeping the graph for gradients.
    pub fn evaluate_actions(
        &self,
        obs: &[Tensor],
        actions: &ActionTensors,
        masks: Option<&Tensor>,
        memories: Option<&Tensor>,
        sequence_length: usize,
    ) -> Result<(LogProbTensors, Tensor)> {
        self.actor
            .get_stats(obs, actions, masks, memories, sequence_length)
    }
}

impl Policy for CandlePolicy {
    fn behavior_spec(&self) -> &BehaviorSpec {
        &self.behavior_spec
    }

    fn memory_store(&self) -> &MemoryStore {
        &self.memory_store
    }

    fn memory_store_mut(&mut self) -> &mut MemoryStore {
        &mut self.memory_store
    }

    fn evaluate(
        &mut self,
        decision_requests: &DecisionSteps,
        global_agent_ids: &[String],
    ) -> Result<RunOutput> {
        self.behavior_spec
            .action_spec
            .check_matches(self.actor.action_spec())?;
        let masks = extract_masks(decision_requests, &self.behavior_spec)?
            .map(|m| rows_to_tensor(&m, &self.device))
            .transpose()?;
        let obs = decision_requests
            .obs
            .iter()
            .map(|o| rows_to_tensor(o, &self.device))
            .collect::<Result<Vec<_>>>()?;
        let memories = match self.use_recurrent() {
            true => Some(rows_to_tensor(
                &self.memory_store.retrieve_memories(global_agent_ids),
                &self.device,
            )?),
            false => None,
        };

        let (output, memories) = self.actor.get_action_and_stats(
            &obs,
            masks.as_ref(),
            memories.as_ref(),
            1,
            &mut self.rng,
        )?;
        let env_action = self.actor.env_action(&output.actions)?;

        Ok(RunOutput {
            action: output.actions.to_tuple()?,
            env_action: env_action.to_tuple()?,
            log_probs: output.log_probs.to_tuple()?,
            entropy: output.entropy.to_vec1::<f32>()?,
            value_estimates: HashMap::new(),
            memory: memories.map(|m| tensor_to_rows(&m)).transpose()?,
        })
    }

    fn get_current_step(&self) -> u64 {
        self.step
    }

    fn set_step(&mut self, step: u64) -> u64 {
        self.step = step;
        step
    }

    fn use_recurrent(&self) -> bool {
        self.network_settings.memory.is_some()
    }

    fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    fn get_weights(&self) -> Result<PolicyWeights> {
        varmap_to_weights(&self.varmap, self.step)
    }

    fn load_weights(&mut self, weights: &PolicyWeights) -> Result<()> {
        load_weights_into_varmap(&self.varmap, weights)?;
        self.step = weights.step;
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        save_varmap(&self.varmap, self.step, path.join(POLICY_FILE))
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        self.step = load_varmap(&self.varmap, path.join(POLICY_FILE))?;
        info!("Loaded policy at step {} from {:?}", self.step, path);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mlagents_core::{
        behavior::{ActionSpec, ObservationSpec},
        error::MlAgentsError,
        settings::MemorySettings,
    };
    use tempdir::TempDir;

    fn spec() -> BehaviorSpec {
        BehaviorSpec::new(
            vec![ObservationSpec::new(vec![3], "vector")],
            ActionSpec::new(2, vec![3, 2]),
        )
    }

    fn decision_steps(n: usize) -> DecisionSteps {
        DecisionSteps {
            obs: vec![(0..n).map(|i| vec![i as f32; 3]).collect()],
            reward: vec![0.0; n],
            agent_id: (0..n as i32).collect(),
            action_mask: Some(vec![vec![false, true, true, false, false]; n]),
            group_id: vec![0; n],
            group_reward: vec![0.0; n],
        }
    }

    fn recurrent_settings() -> TrainerSettings {
        TrainerSettings::default().network_settings(
            NetworkSettings::default()
                .hidden_units(8)
                .memory(Some(MemorySettings {
                    sequence_length: 4,
                    memory_size: 6,
                })),
        )
    }

    #[test]
    fn test_get_action_respects_masks() -> Result<()> {
        let mut policy = CandlePolicy::new(spec(), &TrainerSettings::default(), false, false, Device::Cpu)?;
        let info = policy.get_action(&decision_steps(5), 0)?;
        assert_eq!(info.agent_ids.len(), 5);
        for row in info.action.discrete.iter() {
            assert_eq!(row[0], 0);
        }
        for row in info.env_action.continuous.iter() {
            assert!(row.iter().all(|a| a.abs() <= 1.0));
        }
        assert_eq!(info.outputs.log_probs.discrete[0].len(), 2);
        assert_eq!(info.outputs.entropy.len(), 5);
        Ok(())
    }

    #[test]
    fn test_get_action_rejects_other_action_space() -> Result<()> {
        let mut policy = CandlePolicy::new(spec(), &TrainerSettings::default(), false, false, Device::Cpu)?;
        let mut steps = decision_steps(2);
        steps.action_mask = Some(vec![vec![false; 4]; 2]);
        let err = policy.get_action(&steps, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MlAgentsError>(),
            Some(MlAgentsError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_recurrent_policy_stores_memories() -> Result<()> {
        let mut policy = CandlePolicy::new(spec(), &recurrent_settings(), false, false, Device::Cpu)?;
        assert!(policy.use_recurrent());
        assert_eq!(policy.m_size(), 6);
        assert_eq!(policy.sequence_length(), 4);

        let steps = decision_steps(2);
        policy.get_action(&steps, 0)?;
        let ids = vec!["agent_id=0-0".to_string()];
        let memories = policy.memory_store().retrieve_memories(&ids);
        assert_eq!(memories[0].len(), 6);
        assert!(memories[0].iter().any(|&m| m != 0.0));
        Ok(())
    }

    #[test]
    fn test_weights_move_between_policies() -> Result<()> {
        let settings = TrainerSettings::default();
        let mut policy = CandlePolicy::new(spec(), &settings, true, true, Device::Cpu)?;
        policy.set_step(10);
        let mut other = CandlePolicy::new(spec(), &settings.clone().seed(7), true, true, Device::Cpu)?;
        other.load_weights(&policy.get_weights()?)?;
        assert_eq!(other.get_current_step(), 10);
        assert_eq!(other.get_weights()?, policy.get_weights()?);

        let dir = TempDir::new("policy")?;
        policy.set_step(20);
        policy.save(dir.path())?;
        let mut loaded = CandlePolicy::new(spec(), &settings, true, true, Device::Cpu)?;
        loaded.load(dir.path())?;
        assert_eq!(loaded.get_current_step(), 20);
        assert_eq!(loaded.get_weights()?, policy.get_weights()?);
        Ok(())
    }
}
