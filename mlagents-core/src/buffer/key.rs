use serde::{Deserialize, Serialize};
use std::fmt;

/// Semantic key of an [`AgentBuffer`](super::AgentBuffer) field.
///
/// Group fields hold the values of all teammates of one step concatenated
/// into a single row; readers recover the teammates from the known
/// per-agent width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BufferKey {
    /// The i-th observation.
    Obs(usize),
    /// The i-th observation of the next step.
    NextObs(usize),
    /// The i-th observations of the teammates.
    GroupObs(usize),
    /// The i-th observations of the teammates at the next step.
    GroupNextObs(usize),
    ActionMask,
    ContinuousAction,
    NextContAction,
    ContinuousLogProbs,
    DiscreteAction,
    NextDiscAction,
    DiscreteLogProbs,
    /// Action probabilities of a discrete policy.
    ActionProbs,
    Done,
    EnvironmentRewards,
    Masks,
    Memory,
    CriticMemory,
    BaselineMemory,
    PrevAction,
    Advantages,
    DiscountedReturns,
    GroupDones,
    GroupmateRewards,
    GroupReward,
    GroupContinuousAction,
    GroupDiscreteAction,
    GroupNextContAction,
    GroupNextDiscAction,
    /// Rewards of a reward signal.
    Rewards(String),
    /// Value estimates of a reward signal.
    ValueEstimates(String),
    /// Returns of a reward signal.
    Returns(String),
    /// Advantages of a reward signal.
    Advantage(String),
    /// Baseline estimates of a reward signal.
    BaselineEstimates(String),
}

/// How the first window of a field is filled when the field length is not a
/// multiple of the training length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Padding {
    /// Repeats the first element of the field.
    RepeatFirst,
    /// Rows filled with a constant, as wide as the first element.
    Value(f32),
}

impl BufferKey {
    /// Padding used when resequencing this field.
    ///
    /// Loss masks are zero on padded steps, action masks leave every action
    /// available.
    pub fn padding(&self) -> Padding {
        match self {
            Self::Masks => Padding::Value(0.0),
            Self::ActionMask => Padding::Value(1.0),
            _ => Padding::RepeatFirst,
        }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Obs(i) => write!(f, "obs_{}", i),
            Self::NextObs(i) => write!(f, "next_obs_{}", i),
            Self::GroupObs(i) => write!(f, "group_obs_{}", i),
            Self::GroupNextObs(i) => write!(f, "group_next_obs_{}", i),
            Self::Rewards(name) => write!(f, "{}_rewards", name),
            Self::ValueEstimates(name) => write!(f, "{}_value_estimates", name),
            Self::Returns(name) => write!(f, "{}_returns", name),
            Self::Advantage(name) => write!(f, "{}_advantage", name),
            Self::BaselineEstimates(name) => write!(f, "{}_baseline_estimates", name),
            other => write!(f, "{:?}", other),
        }
    }
}
