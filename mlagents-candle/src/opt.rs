//! Gradient optimizers of the trainers.
//!
//! Every trainer starts from [`OptimizerConfig::default`], sets the learning
//! rate of its hyperparameters and anneals it with
//! [`Optimizer::set_learning_rate`] as training progresses.
use anyhow::Result;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer as _, ParamsAdamW};
use candle_optimisers::adam::{Adam, ParamsAdam};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum OptimizerConfig {
    /// Adam without weight decay.
    Adam {
        lr: f64,
        #[serde(default = "default_adam_eps")]
        eps: f64,
    },

    /// Adam with decoupled weight decay.
    AdamW {
        lr: f64,
        #[serde(default = "default_weight_decay")]
        weight_decay: f64,
    },
}

fn default_adam_eps() -> f64 {
    ParamsAdam::default().eps
}

fn default_weight_decay() -> f64 {
    ParamsAdamW::default().weight_decay
}

impl OptimizerConfig {
    /// Builds an optimizer of `vars`.
    pub fn build(&self, vars: Vec<Var>) -> Result<Optimizer> {
        let opt = match *self {
            Self::Adam { lr, eps } => {
                let params = ParamsAdam {
                    lr,
                    eps,
                    ..ParamsAdam::default()
                };
                Optimizer::Adam(Adam::new(vars, params)?)
            }
            Self::AdamW { lr, weight_decay } => {
                let params = ParamsAdamW {
                    lr,
                    weight_decay,
                    ..ParamsAdamW::default()
                };
                Optimizer::AdamW(AdamW::new(vars, params)?)
            }
        };
        Ok(opt)
    }

    pub fn learning_rate(self, lr: f64) -> Self {
        match self {
            Self::Adam { eps, .. } => Self::Adam { lr, eps },
            Self::AdamW { weight_decay, .. } => Self::AdamW { lr, weight_decay },
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            lr: 3e-4,
            eps: default_adam_eps(),
        }
    }
}

/// An optimizer built by [`OptimizerConfig::build`].
pub enum Optimizer {
    Adam(Adam),
    AdamW(AdamW),
}

impl Optimizer {
    /// Computes the gradients of `loss` and updates the variables.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            Self::Adam(opt) => opt.backward_step(loss)?,
            Self::AdamW(opt) => opt.backward_step(loss)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.learning_rate(),
            Self::AdamW(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Adam(opt) => opt.set_learning_rate(lr),
            Self::AdamW(opt) => opt.set_learning_rate(lr),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarMap};

    #[test]
    fn test_annealed_learning_rate() -> Result<()> {
        let varmap = VarMap::new();
        let x = varmap.get(1, "x", Init::Const(2.0), DType::F32, &Device::Cpu)?;
        let mut opt = OptimizerConfig::default()
            .learning_rate(0.1)
            .build(varmap.all_vars())?;
        assert!((opt.learning_rate() - 0.1).abs() < 1e-12);
        opt.set_learning_rate(0.01);
        assert!((opt.learning_rate() - 0.01).abs() < 1e-12);

        // x^2 decreases toward zero.
        opt.backward_step(&x.sqr()?.sum_all()?)?;
        assert!(x.to_vec1::<f32>()?[0] < 2.0);
        Ok(())
    }

    #[test]
    fn test_config_from_yaml() -> Result<()> {
        let config: OptimizerConfig = serde_yaml::from_str("AdamW:\n  lr: 0.01\n")?;
        assert_eq!(
            config,
            OptimizerConfig::AdamW {
                lr: 0.01,
                weight_decay: default_weight_decay()
            }
        );
        let config = config.learning_rate(1e-3);
        let yaml = serde_yaml::to_string(&config)?;
        assert_eq!(serde_yaml::from_str::<OptimizerConfig>(&yaml)?, config);

        let adam: OptimizerConfig = serde_yaml::from_str("Adam:\n  lr: 0.5\n")?;
        assert_eq!(adam, OptimizerConfig::default().learning_rate(0.5));
        Ok(())
    }
}
