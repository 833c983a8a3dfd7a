use super::{mlp_forward, MlpConfig};
use crate::model::SubModel1;
use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

/// Returns vector of linear modules from [`MlpConfig`].
fn create_linear_layers(prefix: &str, vs: VarBuilder, config: &MlpConfig) -> Result<Vec<Linear>> {
    let mut dims = vec![config.in_dim];
    dims.extend(config.units.iter().copied());
    dims.push(config.out_dim);
    let vs = vs.pp(prefix);

    dims.windows(2)
        .enumerate()
        .map(|(i, w)| Ok(linear(w[0], w[1], vs.pp(format!("ln{}", i)))?))
        .collect()
}

/// Multilayer perceptron.
pub struct Mlp {
    config: MlpConfig,
    device: Device,
    layers: Vec<Linear>,
}

impl Mlp {
    fn _build(vs: VarBuilder, config: MlpConfig) -> Result<Self> {
        let device = vs.device().clone();
        let layers = create_linear_layers("mlp", vs, &config)?;

        Ok(Self {
            config,
            device,
            layers,
        })
    }

    fn _forward(&self, xs: Tensor) -> Result<Tensor> {
        let xs = mlp_forward(xs, &self.layers, self.config.activation)?;

        match self.config.activation_out {
            false => Ok(xs),
            true => Ok(self.config.activation.forward(&xs)?),
        }
    }

    pub fn out_dim(&self) -> usize {
        self.config.out_dim
    }
}

impl SubModel1 for Mlp {
    type Config = MlpConfig;
    type Input = Tensor;
    type Output = Tensor;

    fn forward(&self, xs: &Self::Input) -> Result<Tensor> {
        self._forward(xs.to_device(&self.device)?)
    }

    fn build(vs: VarBuilder, config: Self::Config) -> Result<Self> {
        Self::_build(vs, config)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mlp::Activation;
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn test_mlp_shapes() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = MlpConfig::encoder(5, 2, 8);
        let mlp = <Mlp as SubModel1>::build(vb.pp("body"), config)?;
        let xs = Tensor::zeros((3, 5), DType::F32, &Device::Cpu)?;
        assert_eq!(SubModel1::forward(&mlp, &xs)?.dims(), [3, 8]);
        // Two layers with weights and biases.
        assert_eq!(varmap.all_vars().len(), 4);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = MlpConfig::new(4, vec![], 1, false).activation(Activation::Relu);
        let head = <Mlp as SubModel1>::build(vb, config)?;
        let xs = Tensor::ones((2, 4), DType::F32, &Device::Cpu)?;
        assert_eq!(SubModel1::forward(&head, &xs)?.dims(), [2, 1]);
        assert_eq!(head.out_dim(), 1);
        Ok(())
    }
}
