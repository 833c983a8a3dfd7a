use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

/// Activation function between the layers of an [`Mlp`](super::Mlp).
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
pub enum Activation {
    Relu,
    /// `x * sigmoid(x)`.
    Swish,
}

impl Activation {
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Relu => xs.relu(),
            Self::Swish => candle_nn::ops::silu(xs),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`Mlp`](super::Mlp).
pub struct MlpConfig {
    pub(super) in_dim: usize,
    pub(super) units: Vec<usize>,
    pub(super) out_dim: usize,
    pub(super) activation: Activation,
    pub(super) activation_out: bool,
}

impl MlpConfig {
    /// Creates configuration of MLP.
    ///
    /// * `units` - Sizes of the hidden layers, may be empty.
    /// * `activation_out` - If `true`, activation function is added in the final layer.
    pub fn new(in_dim: usize, units: Vec<usize>, out_dim: usize, activation_out: bool) -> Self {
        Self {
            in_dim,
            units,
            out_dim,
            activation: Activation::Swish,
            activation_out,
        }
    }

    pub fn activation(mut self, v: Activation) -> Self {
        self.activation = v;
        self
    }

    /// `num_layers` layers of `hidden_units` units, each followed by the activation.
    pub fn encoder(in_dim: usize, num_layers: usize, hidden_units: usize) -> Self {
        let units = vec![hidden_units; num_layers.saturating_sub(1)];
        Self::new(in_dim, units, hidden_units, true)
    }
}
