//! Policies, optimizers and trainers implemented with [candle](https://crates.io/crates/candle-core).
//!
//! A [`CandlePolicy`] maps decision requests to actions with an actor
//! network. Trainers own a policy and an optimizer:
//!
//! * [`ppo::PpoTrainer`] with [`ppo::PpoOptimizer`],
//! * [`sac::SacTrainer`] with [`sac::SacOptimizer`],
//! * [`coma::ComaTrainer`] with [`coma::ComaOptimizer`], a multi-agent
//!   critic with a counterfactual baseline,
//! * [`bc::BcTrainer`], offline behavioral cloning from demonstrations.
//!
//! [`TrainerFactory`] builds the trainer matching a
//! [`TrainerSettings`](mlagents_core::settings::TrainerSettings).
pub mod bc;
pub mod coma;
pub mod distributions;
pub mod loss;
pub mod mlp;
pub mod model;
pub mod networks;
pub mod opt;
pub mod policy;
pub mod ppo;
pub mod sac;
pub mod saver;
pub mod sequence;
#[cfg(test)]
mod testing;
mod trainer_factory;
pub mod util;
pub use policy::CandlePolicy;
pub use saver::ModelSaver;
pub use trainer_factory::{TrainerContext, TrainerFactory};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq, Eq)]
/// Device for using candle.
///
/// This enum is added because [`candle_core::Device`] does not support serialization.
pub enum Device {
    /// The main CPU device.
    Cpu,

    /// The GPU with the given ordinal.
    Cuda(usize),
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

impl TryFrom<Device> for candle_core::Device {
    type Error = anyhow::Error;

    fn try_from(device: Device) -> Result<Self> {
        match device {
            Device::Cpu => Ok(candle_core::Device::Cpu),
            Device::Cuda(n) => Ok(candle_core::Device::new_cuda(n)?),
        }
    }
}
