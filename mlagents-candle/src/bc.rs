//! Behavioral cloning from recorded demonstrations.
//!
//! [`BcModule`] adds an imitation step to the updates of an online trainer,
//! [`BcTrainer`] trains a policy on demonstrations only.
mod module;
mod trainer;

pub use module::BcModule;
pub use trainer::BcTrainer;
