//! Experience collection and trainer orchestration for ML-Agents style reinforcement learning.
//!
//! Environment steps are turned into per-agent [`Trajectory`]s by an
//! [`AgentProcessor`], sent through [`AgentManagerQueue`]s to a [`Trainer`],
//! and stored in [`AgentBuffer`]s for updates. Backend specific policies and
//! optimizers live in separate crates and plug in through the [`Policy`] and
//! [`Trainer`] traits.
pub mod agent_processor;
pub mod behavior;
pub mod buffer;
pub mod demo;
pub mod error;
pub mod messages;
pub mod policy;
pub mod queue;
pub mod record;
pub mod returns;
pub mod reward;
pub mod schedule;
pub mod settings;
pub mod stats;
pub mod steps;
pub mod trainer;
pub mod trajectory;

pub use agent_processor::{AgentManager, AgentProcessor};
pub use behavior::{ActionSpec, ActionTuple, BehaviorSpec, ObservationSpec};
pub use buffer::{AgentBuffer, AgentBufferField, BufferKey};
pub use error::MlAgentsError;
pub use policy::{ActionInfo, Policy, PolicyWeights, RunOutput};
pub use queue::{AgentManagerQueue, QueueFullPolicy};
pub use record::{Record, RecordValue};
pub use stats::{StatsReporter, StatsWriter};
pub use steps::{DecisionSteps, TerminalSteps};
pub use trainer::{Trainer, TrainerState};
pub use trajectory::Trajectory;
