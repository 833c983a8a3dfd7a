//! Configuration of trainers.
//!
//! Every settings struct can be written to and read from YAML. Fields that
//! are omitted in a file take their default values.
use crate::error::MlAgentsError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

/// How a hyperparameter changes over the course of training.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum ScheduleType {
    Constant,
    /// Decays linearly to a floor at `max_steps`.
    Linear,
}

/// Kind of trainer.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum TrainerType {
    Ppo,
    Sac,
    Coma,
    Bc,
}

impl std::fmt::Display for TrainerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ppo => "ppo",
            Self::Sac => "sac",
            Self::Coma => "coma",
            Self::Bc => "bc",
        };
        write!(f, "{}", name)
    }
}

/// Hyperparameters of PPO. COMA uses the same set.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PpoSettings {
    pub batch_size: usize,
    pub buffer_size: usize,
    pub learning_rate: f32,
    /// Entropy regularization strength.
    pub beta: f32,
    /// Clipping range of the probability ratio and of the value estimates.
    pub epsilon: f32,
    /// GAE lambda.
    pub lambd: f32,
    pub num_epoch: usize,
    pub learning_rate_schedule: ScheduleType,
    /// Defaults to `learning_rate_schedule`.
    pub beta_schedule: Option<ScheduleType>,
    /// Defaults to `learning_rate_schedule`.
    pub epsilon_schedule: Option<ScheduleType>,
}

impl Default for PpoSettings {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            buffer_size: 10240,
            learning_rate: 3e-4,
            beta: 5e-3,
            epsilon: 0.2,
            lambd: 0.95,
            num_epoch: 3,
            learning_rate_schedule: ScheduleType::Linear,
            beta_schedule: None,
            epsilon_schedule: None,
        }
    }
}

impl PpoSettings {
    pub fn batch_size(mut self, v: usize) -> Self {
        self.batch_size = v;
        self
    }

    pub fn buffer_size(mut self, v: usize) -> Self {
        self.buffer_size = v;
        self
    }

    pub fn learning_rate(mut self, v: f32) -> Self {
        self.learning_rate = v;
        self
    }

    pub fn beta(mut self, v: f32) -> Self {
        self.beta = v;
        self
    }

    pub fn epsilon(mut self, v: f32) -> Self {
        self.epsilon = v;
        self
    }

    pub fn lambd(mut self, v: f32) -> Self {
        self.lambd = v;
        self
    }

    pub fn num_epoch(mut self, v: usize) -> Self {
        self.num_epoch = v;
        self
    }

    pub fn learning_rate_schedule(mut self, v: ScheduleType) -> Self {
        self.learning_rate_schedule = v;
        self
    }

    pub fn beta_schedule(&self) -> ScheduleType {
        self.beta_schedule.unwrap_or(self.learning_rate_schedule)
    }

    pub fn epsilon_schedule(&self) -> ScheduleType {
        self.epsilon_schedule.unwrap_or(self.learning_rate_schedule)
    }
}

/// Hyperparameters of SAC.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SacSettings {
    pub batch_size: usize,
    pub buffer_size: usize,
    pub learning_rate: f32,
    pub learning_rate_schedule: ScheduleType,
    /// Steps collected before the first update.
    pub buffer_init_steps: u64,
    /// Soft update coefficient of the target network.
    pub tau: f32,
    /// Policy updates happen every `train_interval` steps.
    pub train_interval: u64,
    pub updates_per_train: usize,
    /// Reward signals are updated every `reward_signal_train_interval` steps.
    pub reward_signal_train_interval: u64,
    /// Defaults to `updates_per_train`.
    pub reward_signal_updates_per_train: Option<usize>,
    pub save_replay_buffer: bool,
    pub init_entcoef: f32,
}

impl Default for SacSettings {
    fn default() -> Self {
        Self {
            batch_size: 128,
            buffer_size: 50000,
            learning_rate: 3e-4,
            learning_rate_schedule: ScheduleType::Constant,
            buffer_init_steps: 0,
            tau: 0.005,
            train_interval: 1,
            updates_per_train: 1,
            reward_signal_train_interval: 1,
            reward_signal_updates_per_train: None,
            save_replay_buffer: false,
            init_entcoef: 1.0,
        }
    }
}

impl SacSettings {
    pub fn batch_size(mut self, v: usize) -> Self {
        self.batch_size = v;
        self
    }

    pub fn buffer_size(mut self, v: usize) -> Self {
        self.buffer_size = v;
        self
    }

    pub fn learning_rate(mut self, v: f32) -> Self {
        self.learning_rate = v;
        self
    }

    pub fn buffer_init_steps(mut self, v: u64) -> Self {
        self.buffer_init_steps = v;
        self
    }

    pub fn tau(mut self, v: f32) -> Self {
        self.tau = v;
        self
    }

    pub fn train_interval(mut self, v: u64) -> Self {
        self.train_interval = v;
        self
    }

    pub fn updates_per_train(mut self, v: usize) -> Self {
        self.updates_per_train = v;
        self
    }

    pub fn save_replay_buffer(mut self, v: bool) -> Self {
        self.save_replay_buffer = v;
        self
    }

    pub fn init_entcoef(mut self, v: f32) -> Self {
        self.init_entcoef = v;
        self
    }

    pub fn reward_signal_updates_per_train(&self) -> usize {
        self.reward_signal_updates_per_train
            .unwrap_or(self.updates_per_train)
    }
}

/// Hyperparameters of the offline behavioral cloning trainer.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BcSettings {
    /// Steps per mini batch.
    pub batch_size: usize,
    /// Upper bound of mini batches per update.
    pub batches_per_epoch: usize,
    pub learning_rate: f32,
}

impl Default for BcSettings {
    fn default() -> Self {
        Self {
            batch_size: 64,
            batches_per_epoch: 10,
            learning_rate: 3e-4,
        }
    }
}

/// Algorithm specific hyperparameters.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum Hyperparameters {
    Ppo(PpoSettings),
    Sac(SacSettings),
    Coma(PpoSettings),
    Bc(BcSettings),
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self::Ppo(PpoSettings::default())
    }
}

impl Hyperparameters {
    pub fn trainer_type(&self) -> TrainerType {
        match self {
            Self::Ppo(_) => TrainerType::Ppo,
            Self::Sac(_) => TrainerType::Sac,
            Self::Coma(_) => TrainerType::Coma,
            Self::Bc(_) => TrainerType::Bc,
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            Self::Ppo(h) | Self::Coma(h) => h.batch_size,
            Self::Sac(h) => h.batch_size,
            Self::Bc(h) => h.batch_size,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        match self {
            Self::Ppo(h) | Self::Coma(h) => h.learning_rate,
            Self::Sac(h) => h.learning_rate,
            Self::Bc(h) => h.learning_rate,
        }
    }
}

/// Encoder of visual observations.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum EncoderType {
    /// Two convolutions followed by a dense layer.
    Simple,
    /// Flattens the image into a dense layer.
    FullyConnected,
}

/// Recurrent memory of a network.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MemorySettings {
    pub sequence_length: usize,
    /// Size of the carried state, hidden and cell halves together.
    pub memory_size: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            sequence_length: 64,
            memory_size: 128,
        }
    }
}

/// Shape of the networks of a policy.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NetworkSettings {
    /// Normalizes vector observations with running statistics.
    pub normalize: bool,
    pub hidden_units: usize,
    pub num_layers: usize,
    pub vis_encode_type: EncoderType,
    pub memory: Option<MemorySettings>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            normalize: false,
            hidden_units: 128,
            num_layers: 2,
            vis_encode_type: EncoderType::Simple,
            memory: None,
        }
    }
}

impl NetworkSettings {
    pub fn normalize(mut self, v: bool) -> Self {
        self.normalize = v;
        self
    }

    pub fn hidden_units(mut self, v: usize) -> Self {
        self.hidden_units = v;
        self
    }

    pub fn num_layers(mut self, v: usize) -> Self {
        self.num_layers = v;
        self
    }

    pub fn vis_encode_type(mut self, v: EncoderType) -> Self {
        self.vis_encode_type = v;
        self
    }

    pub fn memory(mut self, v: Option<MemorySettings>) -> Self {
        self.memory = v;
        self
    }
}

/// Kind of reward signal.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RewardSignalType {
    Extrinsic,
}

impl RewardSignalType {
    /// Name of the signal, used in buffer keys and value heads.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Extrinsic => "extrinsic",
        }
    }
}

/// Discount and scale of a reward signal.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RewardSignalSettings {
    pub gamma: f32,
    pub strength: f32,
}

impl Default for RewardSignalSettings {
    fn default() -> Self {
        Self {
            gamma: 0.99,
            strength: 1.0,
        }
    }
}

/// Imitation of recorded demonstrations during training.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BehavioralCloningSettings {
    /// A `.demo` file or a directory of them.
    pub demo_path: PathBuf,
    /// Steps over which the strength anneals to zero, 0 for constant strength.
    pub steps: u64,
    pub strength: f32,
    /// Demonstration steps used per update, 0 for as many as the trainer's buffer.
    pub samples_per_update: usize,
    /// Defaults to the trainer's number of epochs.
    pub num_epoch: Option<usize>,
    /// Defaults to the trainer's batch size.
    pub batch_size: Option<usize>,
}

impl Default for BehavioralCloningSettings {
    fn default() -> Self {
        Self {
            demo_path: PathBuf::new(),
            steps: 0,
            strength: 1.0,
            samples_per_update: 0,
            num_epoch: None,
            batch_size: None,
        }
    }
}

/// Configuration of a trainer of one behavior.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TrainerSettings {
    pub hyperparameters: Hyperparameters,
    pub network_settings: NetworkSettings,
    pub reward_signals: BTreeMap<RewardSignalType, RewardSignalSettings>,
    pub behavioral_cloning: Option<BehavioralCloningSettings>,
    pub max_steps: u64,
    /// Steps after which an agent's experience is emitted as a trajectory.
    pub time_horizon: usize,
    pub summary_freq: u64,
    pub checkpoint_interval: u64,
    pub keep_checkpoints: usize,
    /// Updates the policy on a separate thread.
    pub threaded: bool,
    pub seed: u64,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        let mut reward_signals = BTreeMap::new();
        reward_signals.insert(RewardSignalType::Extrinsic, RewardSignalSettings::default());
        Self {
            hyperparameters: Hyperparameters::default(),
            network_settings: NetworkSettings::default(),
            reward_signals,
            behavioral_cloning: None,
            max_steps: 500_000,
            time_horizon: 64,
            summary_freq: 50_000,
            checkpoint_interval: 500_000,
            keep_checkpoints: 5,
            threaded: false,
            seed: 42,
        }
    }
}

impl TrainerSettings {
    pub fn trainer_type(&self) -> TrainerType {
        self.hyperparameters.trainer_type()
    }

    pub fn hyperparameters(mut self, v: Hyperparameters) -> Self {
        self.hyperparameters = v;
        self
    }

    pub fn network_settings(mut self, v: NetworkSettings) -> Self {
        self.network_settings = v;
        self
    }

    pub fn reward_signal(mut self, t: RewardSignalType, v: RewardSignalSettings) -> Self {
        self.reward_signals.insert(t, v);
        self
    }

    pub fn behavioral_cloning(mut self, v: Option<BehavioralCloningSettings>) -> Self {
        self.behavioral_cloning = v;
        self
    }

    pub fn max_steps(mut self, v: u64) -> Self {
        self.max_steps = v;
        self
    }

    pub fn time_horizon(mut self, v: usize) -> Self {
        self.time_horizon = v;
        self
    }

    pub fn summary_freq(mut self, v: u64) -> Self {
        self.summary_freq = v;
        self
    }

    pub fn checkpoint_interval(mut self, v: u64) -> Self {
        self.checkpoint_interval = v;
        self
    }

    pub fn keep_checkpoints(mut self, v: usize) -> Self {
        self.keep_checkpoints = v;
        self
    }

    pub fn threaded(mut self, v: bool) -> Self {
        self.threaded = v;
        self
    }

    pub fn seed(mut self, v: u64) -> Self {
        self.seed = v;
        self
    }

    /// Sequence length of recurrent networks, 1 without memory.
    pub fn sequence_length(&self) -> usize {
        self.network_settings
            .memory
            .as_ref()
            .map_or(1, |m| m.sequence_length)
    }

    /// Checks the consistency of the settings of `brain_name`.
    pub fn validate(&self, brain_name: &str) -> Result<()> {
        let config = |msg: String| -> Result<()> { Err(MlAgentsError::Config(msg).into()) };

        match &self.hyperparameters {
            Hyperparameters::Ppo(h) | Hyperparameters::Coma(h) if h.batch_size > h.buffer_size => {
                return config(format!(
                    "batch_size ({}) must not exceed buffer_size ({}) for {}",
                    h.batch_size, h.buffer_size, brain_name
                ));
            }
            Hyperparameters::Sac(h) if h.batch_size > h.buffer_size => {
                return config(format!(
                    "batch_size ({}) must not exceed buffer_size ({}) for {}",
                    h.batch_size, h.buffer_size, brain_name
                ));
            }
            Hyperparameters::Bc(_) if self.behavioral_cloning.is_none() => {
                return Err(MlAgentsError::MissingHyperparameter {
                    key: "behavioral_cloning.demo_path".to_string(),
                    trainer: self.trainer_type().to_string(),
                    brain: brain_name.to_string(),
                }
                .into());
            }
            _ => {}
        }
        if let Some(memory) = &self.network_settings.memory {
            if memory.memory_size == 0 || memory.memory_size % 2 != 0 {
                return config(format!(
                    "memory_size must be a positive even number, got {}",
                    memory.memory_size
                ));
            }
            if memory.sequence_length == 0 {
                return config("sequence_length must be positive".to_string());
            }
        }
        if self.summary_freq == 0 {
            return config("summary_freq must be positive".to_string());
        }
        Ok(())
    }

    /// Constructs [`TrainerSettings`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`TrainerSettings`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Settings of a run: trainer settings per behavior and output location.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RunSettings {
    pub run_id: String,
    /// Checkpoints and summaries go to `results_dir/run_id`.
    pub results_dir: PathBuf,
    /// Used for behaviors absent from `behaviors`.
    pub default_settings: Option<TrainerSettings>,
    pub behaviors: BTreeMap<String, TrainerSettings>,
    /// Capacity of the trajectory and policy queues, 0 for unbounded.
    pub queue_maxlen: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            run_id: "ppo".to_string(),
            results_dir: PathBuf::from("results"),
            default_settings: None,
            behaviors: BTreeMap::new(),
            queue_maxlen: 20,
        }
    }
}

impl RunSettings {
    pub fn run_id(mut self, v: impl Into<String>) -> Self {
        self.run_id = v.into();
        self
    }

    pub fn results_dir(mut self, v: impl Into<PathBuf>) -> Self {
        self.results_dir = v.into();
        self
    }

    pub fn default_settings(mut self, v: Option<TrainerSettings>) -> Self {
        self.default_settings = v;
        self
    }

    pub fn behavior(mut self, name: impl Into<String>, v: TrainerSettings) -> Self {
        self.behaviors.insert(name.into(), v);
        self
    }

    /// Settings of a behavior, falling back to the defaults.
    pub fn trainer_settings(&self, brain_name: &str) -> Result<&TrainerSettings> {
        self.behaviors
            .get(brain_name)
            .or_else(|| self.default_settings.as_ref())
            .ok_or_else(|| {
                MlAgentsError::Config(format!(
                    "the behavior {} has no trainer settings and no default is given",
                    brain_name
                ))
                .into()
            })
    }

    /// Directory for the artifacts of the run.
    pub fn run_dir(&self) -> PathBuf {
        self.results_dir.join(&self.run_id)
    }

    /// Constructs [`RunSettings`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`RunSettings`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_serde_trainer_settings() -> Result<()> {
        let settings = TrainerSettings::default()
            .hyperparameters(Hyperparameters::Sac(
                SacSettings::default().batch_size(256).tau(0.01),
            ))
            .network_settings(NetworkSettings::default().memory(Some(MemorySettings::default())))
            .max_steps(1000);

        let dir = TempDir::new("trainer_settings")?;
        let path = dir.path().join("trainer_settings.yaml");
        settings.save(&path)?;
        let settings_ = TrainerSettings::load(&path)?;
        assert_eq!(settings, settings_);
        assert_eq!(settings_.trainer_type(), TrainerType::Sac);
        assert_eq!(settings_.sequence_length(), 64);
        Ok(())
    }

    #[test]
    fn test_partial_yaml_takes_defaults() -> Result<()> {
        let yaml = "hyperparameters:\n  Ppo:\n    batch_size: 64\n    buffer_size: 640\nmax_steps: 10\n";
        let settings: TrainerSettings = serde_yaml::from_str(yaml)?;
        match &settings.hyperparameters {
            Hyperparameters::Ppo(h) => {
                assert_eq!(h.batch_size, 64);
                assert_eq!(h.num_epoch, 3);
                assert_eq!(h.beta_schedule(), ScheduleType::Linear);
            }
            _ => panic!("expected PPO hyperparameters"),
        }
        assert_eq!(settings.time_horizon, 64);
        assert_eq!(
            settings.reward_signals[&RewardSignalType::Extrinsic].gamma,
            0.99
        );
        Ok(())
    }

    #[test]
    fn test_validate() {
        let settings = TrainerSettings::default().hyperparameters(Hyperparameters::Ppo(
            PpoSettings::default().batch_size(100).buffer_size(10),
        ));
        assert!(settings.validate("brain").is_err());

        let settings = TrainerSettings::default()
            .hyperparameters(Hyperparameters::Bc(BcSettings::default()));
        let err = settings.validate("brain").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MlAgentsError>(),
            Some(MlAgentsError::MissingHyperparameter { .. })
        ));

        let settings = TrainerSettings::default().network_settings(
            NetworkSettings::default().memory(Some(MemorySettings {
                sequence_length: 8,
                memory_size: 3,
            })),
        );
        assert!(settings.validate("brain").is_err());
        assert!(TrainerSettings::default().validate("brain").is_ok());
    }

    #[test]
    fn test_run_settings_fallback() {
        let run = RunSettings::default().behavior("Walker", TrainerSettings::default().max_steps(7));
        assert_eq!(run.trainer_settings("Walker").unwrap().max_steps, 7);
        assert!(run.trainer_settings("Crawler").is_err());

        let run = run.default_settings(Some(TrainerSettings::default()));
        assert_eq!(run.trainer_settings("Crawler").unwrap().max_steps, 500_000);
    }
}
