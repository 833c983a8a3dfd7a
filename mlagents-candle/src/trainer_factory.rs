//! Construction of trainers from run settings.
use crate::{bc::BcTrainer, coma::ComaTrainer, ppo::PpoTrainer, sac::SacTrainer, Device};
use anyhow::Result;
use log::info;
use mlagents_core::{
    behavior::BehaviorSpec,
    settings::{RunSettings, TrainerType},
    stats::StatsReporter,
    trainer::Trainer,
};
use std::{convert::TryInto, path::PathBuf};

/// What every trainer of a run shares.
#[derive(Clone)]
pub struct TrainerContext {
    pub is_training: bool,
    /// Checkpoints of a behavior go to `artifact_path/{brain_name}`.
    pub artifact_path: PathBuf,
    pub stats_reporter: StatsReporter,
    pub device: candle_core::Device,
}

impl TrainerContext {
    pub fn new(artifact_path: impl Into<PathBuf>, stats_reporter: StatsReporter) -> Self {
        Self {
            is_training: true,
            artifact_path: artifact_path.into(),
            stats_reporter,
            device: candle_core::Device::Cpu,
        }
    }

    pub fn is_training(mut self, v: bool) -> Self {
        self.is_training = v;
        self
    }

    /// Places the networks of the trainers on `v`.
    pub fn device(mut self, v: Device) -> Result<Self> {
        self.device = v.try_into()?;
        Ok(self)
    }

    pub(crate) fn model_path(&self, brain_name: &str) -> PathBuf {
        self.artifact_path.join(brain_name)
    }
}

/// Builds the trainer of a behavior according to its [`TrainerType`].
pub struct TrainerFactory {
    run_settings: RunSettings,
    context: TrainerContext,
    /// Checkpoint directory per behavior to initialize the trainers from.
    init_paths: Vec<(String, PathBuf)>,
}

impl TrainerFactory {
    pub fn new(run_settings: RunSettings, context: TrainerContext) -> Self {
        Self {
            run_settings,
            context,
            init_paths: vec![],
        }
    }

    /// Restores the trainer of `brain_name` from a checkpoint directory.
    pub fn init_path(mut self, brain_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.init_paths.push((brain_name.into(), path.into()));
        self
    }

    pub fn run_settings(&self) -> &RunSettings {
        &self.run_settings
    }

    /// Creates the trainer of `brain_name`, restored from its checkpoint if one was given.
    pub fn generate(
        &self,
        brain_name: &str,
        behavior_spec: &BehaviorSpec,
    ) -> Result<Box<dyn Trainer>> {
        let settings = self.run_settings.trainer_settings(brain_name)?.clone();
        let init_path = self
            .init_paths
            .iter()
            .find(|(name, _)| name == brain_name)
            .map(|(_, path)| path.as_path());
        info!(
            "Creating a {} trainer for behavior {}",
            settings.trainer_type(),
            brain_name
        );

        let ctx = &self.context;
        let spec = behavior_spec.clone();
        let trainer: Box<dyn Trainer> = match settings.trainer_type() {
            TrainerType::Ppo => {
                let mut t = PpoTrainer::new(brain_name, spec, settings, ctx)?;
                t.initialize_or_load(init_path)?;
                Box::new(t)
            }
            TrainerType::Sac => {
                let mut t = SacTrainer::new(brain_name, spec, settings, ctx)?;
                t.initialize_or_load(init_path)?;
                Box::new(t)
            }
            TrainerType::Coma => {
                let mut t = ComaTrainer::new(brain_name, spec, settings, ctx)?;
                t.initialize_or_load(init_path)?;
                Box::new(t)
            }
            TrainerType::Bc => {
                let mut t = BcTrainer::new(brain_name, spec, settings, ctx)?;
                t.initialize_or_load(init_path)?;
                Box::new(t)
            }
        };
        trainer.write_hyperparameters()?;
        Ok(trainer)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mlagents_core::{
        behavior::{ActionSpec, ObservationSpec},
        error::MlAgentsError,
        settings::{Hyperparameters, NetworkSettings, SacSettings, TrainerSettings},
    };
    use tempdir::TempDir;

    fn spec() -> BehaviorSpec {
        BehaviorSpec::new(
            vec![ObservationSpec::new(vec![4], "vector")],
            ActionSpec::new(2, vec![]),
        )
    }

    fn small(settings: TrainerSettings) -> TrainerSettings {
        settings.network_settings(NetworkSettings::default().hidden_units(8).num_layers(1))
    }

    #[test]
    fn test_generate_by_trainer_type() -> Result<()> {
        let dir = TempDir::new("trainer_factory")?;
        let run_settings = RunSettings::default()
            .default_settings(Some(small(TrainerSettings::default())))
            .behavior(
                "Walker",
                small(TrainerSettings::default().hyperparameters(Hyperparameters::Sac(
                    SacSettings::default().batch_size(8).buffer_size(64),
                ))),
            );
        let context = TrainerContext::new(dir.path(), StatsReporter::new(vec![]));
        let factory = TrainerFactory::new(run_settings, context);

        let ppo = factory.generate("Crawler", &spec())?;
        assert_eq!(ppo.state().trainer_settings.trainer_type(), TrainerType::Ppo);
        assert_eq!(ppo.state().brain_name, "Crawler");
        let sac = factory.generate("Walker", &spec())?;
        assert_eq!(sac.state().trainer_settings.trainer_type(), TrainerType::Sac);
        Ok(())
    }

    #[test]
    fn test_cpu_device() -> Result<()> {
        let context = TrainerContext::new("results", StatsReporter::new(vec![])).device(Device::Cpu)?;
        assert!(matches!(context.device, candle_core::Device::Cpu));
        Ok(())
    }

    #[test]
    fn test_missing_settings() -> Result<()> {
        let dir = TempDir::new("trainer_factory")?;
        let context = TrainerContext::new(dir.path(), StatsReporter::new(vec![]));
        let factory = TrainerFactory::new(RunSettings::default(), context);
        let err = factory.generate("Crawler", &spec()).err().map(|e| e.to_string());
        assert!(err.map_or(false, |e| e.contains("Crawler")));
        Ok(())
    }

    #[test]
    fn test_invalid_settings() -> Result<()> {
        let dir = TempDir::new("trainer_factory")?;
        let settings = small(TrainerSettings::default()).hyperparameters(Hyperparameters::Sac(
            SacSettings::default().batch_size(128).buffer_size(64),
        ));
        let run_settings = RunSettings::default().behavior("Walker", settings);
        let context = TrainerContext::new(dir.path(), StatsReporter::new(vec![]));
        let factory = TrainerFactory::new(run_settings, context);
        let err = factory.generate("Walker", &spec()).err();
        assert!(matches!(
            err.as_ref().and_then(|e| e.downcast_ref::<MlAgentsError>()),
            Some(MlAgentsError::Config(_))
        ));
        Ok(())
    }
}
