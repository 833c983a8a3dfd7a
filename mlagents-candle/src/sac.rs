//! Soft actor-critic (SAC).
mod ent_coef;
mod optimizer;
mod trainer;
pub use ent_coef::EntCoef;
pub use optimizer::SacOptimizer;
pub use trainer::SacTrainer;
