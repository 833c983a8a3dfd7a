//! Checkpoints of the networks of a trainer.
use crate::util::{load_varmap, save_varmap};
use anyhow::Result;
use candle_nn::VarMap;
use log::{info, warn};
use mlagents_core::error::MlAgentsError;
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
};

/// Saves and restores the registered networks of a trainer.
///
/// A checkpoint of behavior `brain` at step `step` is the directory
/// `{model_path}/{brain}-{step}` holding one `{name}.safetensors` file per
/// registered module. At most `keep_checkpoints` checkpoints are kept, the
/// oldest being removed first; 0 keeps all of them.
pub struct ModelSaver {
    model_path: PathBuf,
    keep_checkpoints: usize,
    modules: Vec<(String, VarMap)>,
    checkpoints: VecDeque<PathBuf>,
}

impl ModelSaver {
    pub fn new(model_path: impl Into<PathBuf>, keep_checkpoints: usize) -> Self {
        Self {
            model_path: model_path.into(),
            keep_checkpoints,
            modules: vec![],
            checkpoints: VecDeque::new(),
        }
    }

    /// Adds a module to the checkpoints.
    ///
    /// [`VarMap`] shares its variables between clones, so later updates of
    /// the module are saved.
    pub fn register(&mut self, name: impl Into<String>, varmap: &VarMap) {
        self.modules.push((name.into(), varmap.clone()));
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Checkpoints currently on disk, oldest first.
    pub fn checkpoints(&self) -> impl Iterator<Item = &PathBuf> {
        self.checkpoints.iter()
    }

    /// Saves every registered module and returns the checkpoint directory.
    pub fn save_checkpoint(&mut self, brain_name: &str, step: u64) -> Result<PathBuf> {
        let path = self.model_path.join(format!("{}-{}", brain_name, step));
        fs::create_dir_all(&path)?;
        for (name, varmap) in self.modules.iter() {
            save_varmap(varmap, step, path.join(format!("{}.safetensors", name)))?;
        }
        info!("Saved checkpoint of {} at step {} to {:?}", brain_name, step, path);

        if !self.checkpoints.contains(&path) {
            self.checkpoints.push_back(path.clone());
        }
        while self.keep_checkpoints > 0 && self.checkpoints.len() > self.keep_checkpoints {
            if let Some(old) = self.checkpoints.pop_front() {
                if let Err(e) = fs::remove_dir_all(&old) {
                    warn!("Failed to remove checkpoint {:?}: {}", old, e);
                }
            }
        }
        Ok(path)
    }

    /// Loads the registered modules from a checkpoint directory.
    ///
    /// Returns the step at which the checkpoint was saved, 0 without a path.
    pub fn initialize_or_load(&self, path: Option<&Path>) -> Result<u64> {
        let path = match path {
            Some(p) => p,
            None => return Ok(0),
        };
        if !path.is_dir() {
            return Err(MlAgentsError::Config(format!(
                "checkpoint {:?} is not a directory",
                path
            ))
            .into());
        }
        let mut step = 0;
        for (name, varmap) in self.modules.iter() {
            step = load_varmap(varmap, path.join(format!("{}.safetensors", name)))?;
        }
        info!("Loaded checkpoint {:?} at step {}", path, step);
        Ok(step)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device, Tensor, Var};
    use candle_nn::Init;
    use tempdir::TempDir;

    fn varmap(value: f64) -> Result<VarMap> {
        let vm = VarMap::new();
        vm.get(2, "w", Init::Const(value), DType::F32, &Device::Cpu)?;
        Ok(vm)
    }

    fn value(vm: &VarMap) -> Result<f32> {
        let t: Tensor = vm.data().lock().unwrap()["w"].as_tensor().clone();
        Ok(t.to_vec1::<f32>()?[0])
    }

    #[test]
    fn test_checkpoint_rotation() -> Result<()> {
        let dir = TempDir::new("saver")?;
        let mut saver = ModelSaver::new(dir.path(), 2);
        saver.register("policy", &varmap(1.0)?);
        for step in [10, 20, 30] {
            saver.save_checkpoint("brain", step)?;
        }
        assert!(!dir.path().join("brain-10").exists());
        assert!(dir.path().join("brain-20/policy.safetensors").exists());
        assert!(dir.path().join("brain-30/policy.safetensors").exists());
        assert_eq!(saver.checkpoints().count(), 2);
        Ok(())
    }

    #[test]
    fn test_initialize_or_load() -> Result<()> {
        let dir = TempDir::new("saver")?;
        let policy = varmap(1.0)?;
        let critic = varmap(2.0)?;
        let mut saver = ModelSaver::new(dir.path(), 0);
        saver.register("policy", &policy);
        saver.register("critic", &critic);
        let path = saver.save_checkpoint("brain", 7)?;

        // Variables changed after registration are restored from the checkpoint.
        let w = policy.data().lock().unwrap()["w"].clone();
        Var::set(&w, &Tensor::zeros(2, DType::F32, &Device::Cpu)?)?;
        assert_eq!(value(&policy)?, 0.0);

        assert_eq!(saver.initialize_or_load(Some(&path))?, 7);
        assert_eq!(value(&policy)?, 1.0);
        assert_eq!(value(&critic)?, 2.0);
        assert_eq!(saver.initialize_or_load(None)?, 0);
        assert!(saver.initialize_or_load(Some(&dir.path().join("missing"))).is_err());
        Ok(())
    }
}
