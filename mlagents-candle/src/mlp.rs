//! Multilayer perceptron.
mod base;
mod config;
pub use base::Mlp;
use candle_core::Tensor;
use candle_nn::{Linear, Module};
pub use config::{Activation, MlpConfig};

fn mlp_forward(xs: Tensor, layers: &[Linear], act: Activation) -> candle_core::Result<Tensor> {
    let n_layers = layers.len();
    let mut xs = xs;

    for layer in layers.iter().take(n_layers - 1) {
        xs = act.forward(&layer.forward(&xs)?)?;
    }

    layers[n_layers - 1].forward(&xs)
}
