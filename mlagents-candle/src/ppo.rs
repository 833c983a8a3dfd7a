//! Proximal policy optimization (PPO).
mod optimizer;
mod trainer;
pub(crate) use optimizer::{batch_action_masks, batch_memories, trajectory_value_estimates};
pub use optimizer::{PpoOptimizer, TrajectoryValues};
pub use trainer::PpoTrainer;
