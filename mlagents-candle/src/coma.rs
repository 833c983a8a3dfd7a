//! Counterfactual multi-agent (COMA) training of cooperating agents.
//!
//! A shared critic values the state of the whole group and, as a baseline,
//! the state with the actions of the teammates but not the agent's own.
//! The advantage of an agent is its return minus this baseline.
mod networks;
mod optimizer;
mod trainer;
pub use networks::{AgentInputs, ComaCritic};
pub use optimizer::{ComaOptimizer, ComaTrajectoryValues};
pub use trainer::ComaTrainer;
