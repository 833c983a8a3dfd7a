//! Action distributions of a policy.
//!
//! Continuous actions follow a diagonal Gaussian, optionally squashed with
//! `tanh`. Each discrete branch is a categorical distribution over the
//! actions left available by the action mask.
use crate::util::{rows_to_tensor, tensor_to_rows, EPSILON};
use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{linear, ops::softmax, Init, Linear, Module, VarBuilder};
use mlagents_core::{
    behavior::{ActionSpec, ActionTuple, LogProbsTuple},
    buffer::{AgentBuffer, BufferKey},
};
use rand::Rng;

const LOG_STD_MIN: f64 = -20.0;
const LOG_STD_MAX: f64 = 2.0;

/// Continuous actions sent to the environment are clipped to this range, then scaled to `[-1, 1]`.
const CLIP_RANGE: f64 = 3.0;

fn normal_logp(x: &Tensor, mean: &Tensor, log_std: &Tensor) -> Result<Tensor> {
    let var = (log_std * 2.0)?.exp()?;
    let sq = (x - mean)?.sqr()?;
    let logp = ((sq / (var * 2.0)?)? + log_std)?;
    Ok(((logp * -1.0)? - 0.5 * (2.0 * std::f64::consts::PI).ln())?)
}

fn atanh(x: &Tensor) -> Result<Tensor> {
    let x = x.clamp(-1.0 + EPSILON, 1.0 - EPSILON)?;
    let num = (&x + 1.0)?.log()?;
    let den = (1.0 - &x)?.log()?;
    Ok(((num - den)? * 0.5)?)
}

/// Sampled or recorded actions of a batch.
#[derive(Debug, Clone)]
pub struct ActionTensors {
    /// `[n, continuous_size]`.
    pub continuous: Option<Tensor>,
    /// `[n, num_branches]` of dtype `u32`.
    pub discrete: Option<Tensor>,
}

impl ActionTensors {
    /// The actions of an [`ActionTuple`].
    pub fn from_tuple(action: &ActionTuple, spec: &ActionSpec, device: &Device) -> Result<Self> {
        let continuous = match spec.continuous_size > 0 {
            true => Some(rows_to_tensor(&action.continuous, device)?),
            false => None,
        };
        let discrete = match spec.discrete_size() > 0 {
            true => {
                let rows: Vec<Vec<f32>> = action
                    .discrete
                    .iter()
                    .map(|r| r.iter().map(|&a| a as f32).collect())
                    .collect();
                Some(rows_to_tensor(&rows, device)?.to_dtype(DType::U32)?)
            }
            false => None,
        };
        Ok(Self {
            continuous,
            discrete,
        })
    }

    /// The actions recorded in a buffer.
    pub fn from_buffer(buffer: &AgentBuffer, spec: &ActionSpec, device: &Device) -> Result<Self> {
        Self::from_keys(
            buffer,
            spec,
            (&BufferKey::ContinuousAction, &BufferKey::DiscreteAction),
            device,
        )
    }

    /// The actions taken at the step after each step of a buffer.
    pub fn next_from_buffer(
        buffer: &AgentBuffer,
        spec: &ActionSpec,
        device: &Device,
    ) -> Result<Self> {
        Self::from_keys(
            buffer,
            spec,
            (&BufferKey::NextContAction, &BufferKey::NextDiscAction),
            device,
        )
    }

    fn from_keys(
        buffer: &AgentBuffer,
        spec: &ActionSpec,
        (cont_key, disc_key): (&BufferKey, &BufferKey),
        device: &Device,
    ) -> Result<Self> {
        let continuous = match spec.continuous_size > 0 {
            true => Some(rows_to_tensor(buffer.field(cont_key)?.rows(), device)?),
            false => None,
        };
        let discrete = match spec.discrete_size() > 0 {
            true => Some(rows_to_tensor(buffer.field(disc_key)?.rows(), device)?.to_dtype(DType::U32)?),
            false => None,
        };
        Ok(Self {
            continuous,
            discrete,
        })
    }

    pub fn to_tuple(&self) -> Result<ActionTuple> {
        let continuous = match &self.continuous {
            Some(t) => tensor_to_rows(t)?,
            None => vec![],
        };
        let discrete = match &self.discrete {
            Some(t) => t
                .to_vec2::<u32>()?
                .into_iter()
                .map(|r| r.into_iter().map(|a| a as i32).collect())
                .collect(),
            None => vec![],
        };
        let n = continuous.len().max(discrete.len());
        Ok(ActionTuple {
            continuous: if continuous.is_empty() { vec![vec![]; n] } else { continuous },
            discrete: if discrete.is_empty() { vec![vec![]; n] } else { discrete },
        })
    }

    /// Continuous actions followed by the one-hot encoded discrete actions, `[n, d]`.
    pub fn to_flat(&self, spec: &ActionSpec) -> Result<Tensor> {
        let mut parts = vec![];
        if let Some(c) = &self.continuous {
            parts.push(c.clone());
        }
        if let Some(d) = &self.discrete {
            parts.push(one_hot(d, &spec.discrete_branches)?);
        }
        Ok(Tensor::cat(&parts, 1)?)
    }
}

/// One-hot encoding of the discrete actions `[n, num_branches]`, branches concatenated.
pub fn one_hot(actions: &Tensor, branches: &[usize]) -> Result<Tensor> {
    let rows = actions.to_vec2::<u32>()?;
    let width: usize = branches.iter().sum();
    let mut values = vec![0f32; rows.len() * width];
    for (i, row) in rows.iter().enumerate() {
        let mut offset = i * width;
        for (&a, &size) in row.iter().zip(branches.iter()) {
            if (a as usize) < size {
                values[offset + a as usize] = 1.0;
            }
            offset += size;
        }
    }
    Ok(Tensor::from_vec(values, (rows.len(), width), actions.device())?)
}

/// Log probabilities of a batch of actions.
#[derive(Debug, Clone)]
pub struct LogProbTensors {
    /// `[n, continuous_size]`.
    pub continuous: Option<Tensor>,
    /// Log probability of the taken action of each branch, `[n, num_branches]`.
    pub discrete: Option<Tensor>,
    /// Log probabilities of every discrete action, `[n, sum of branch sizes]`.
    pub all_discrete: Option<Tensor>,
}

impl LogProbTensors {
    /// The log probabilities recorded in a buffer. `all_discrete` is not recorded.
    pub fn from_buffer(buffer: &AgentBuffer, spec: &ActionSpec, device: &Device) -> Result<Self> {
        let continuous = match spec.continuous_size > 0 {
            true => Some(rows_to_tensor(
                buffer.field(&BufferKey::ContinuousLogProbs)?.rows(),
                device,
            )?),
            false => None,
        };
        let discrete = match spec.discrete_size() > 0 {
            true => Some(rows_to_tensor(
                buffer.field(&BufferKey::DiscreteLogProbs)?.rows(),
                device,
            )?),
            false => None,
        };
        Ok(Self {
            continuous,
            discrete,
            all_discrete: None,
        })
    }

    /// Continuous and discrete log probabilities side by side, `[n, continuous_size + num_branches]`.
    pub fn flatten(&self) -> Result<Tensor> {
        let parts: Vec<Tensor> = [&self.continuous, &self.discrete]
            .iter()
            .filter_map(|t| (*t).clone())
            .collect();
        Ok(Tensor::cat(&parts, 1)?)
    }

    pub fn to_tuple(&self) -> Result<LogProbsTuple> {
        let continuous = match &self.continuous {
            Some(t) => tensor_to_rows(t)?,
            None => vec![],
        };
        let discrete = match &self.discrete {
            Some(t) => tensor_to_rows(t)?,
            None => vec![],
        };
        let n = continuous.len().max(discrete.len());
        Ok(LogProbsTuple {
            continuous: if continuous.is_empty() { vec![vec![]; n] } else { continuous },
            discrete: if discrete.is_empty() { vec![vec![]; n] } else { discrete },
        })
    }
}

enum LogSigma {
    /// Computed from the input.
    Conditional(Linear),
    /// A learned vector shared by all inputs.
    Param(Tensor),
}

/// Diagonal Gaussian over continuous actions.
pub struct GaussianDistribution {
    mu: Linear,
    log_sigma: LogSigma,
    tanh_squash: bool,
}

impl GaussianDistribution {
    pub fn new(
        vb: VarBuilder,
        hidden_size: usize,
        num_outputs: usize,
        conditional_sigma: bool,
        tanh_squash: bool,
    ) -> Result<Self> {
        let mu = linear(hidden_size, num_outputs, vb.pp("mu"))?;
        let log_sigma = match conditional_sigma {
            true => LogSigma::Conditional(linear(hidden_size, num_outputs, vb.pp("log_sigma"))?),
            false => LogSigma::Param(vb.get_with_hints((1, num_outputs), "log_sigma", Init::Const(0.0))?),
        };
        Ok(Self {
            mu,
            log_sigma,
            tanh_squash,
        })
    }

    fn params(&self, inputs: &Tensor) -> Result<(Tensor, Tensor)> {
        let mean = self.mu.forward(inputs)?;
        let log_std = match &self.log_sigma {
            LogSigma::Conditional(l) => l.forward(inputs)?.clamp(LOG_STD_MIN, LOG_STD_MAX)?,
            LogSigma::Param(p) => p.broadcast_as(mean.shape())?.contiguous()?,
        };
        Ok((mean, log_std))
    }

    fn entropy(log_std: &Tensor) -> Result<Tensor> {
        // 0.5 * ln(2 pi e sigma^2), averaged over the action dimensions.
        let var = (log_std * 2.0)?.exp()?;
        let c = 2.0 * std::f64::consts::PI * std::f64::consts::E;
        Ok(((var * c)? + EPSILON)?.log()?.affine(0.5, 0.0)?.mean(D::Minus1)?)
    }

    /// Samples actions. Returns the actions, their log probabilities and the entropy.
    ///
    /// Sampling is reparameterized, gradients flow through the actions.
    pub fn sample(&self, inputs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (mean, log_std) = self.params(inputs)?;
        let z = ((log_std.exp()? * mean.randn_like(0.0, 1.0)?)? + &mean)?;
        let entropy = Self::entropy(&log_std)?;
        match self.tanh_squash {
            false => {
                let log_probs = normal_logp(&z, &mean, &log_std)?;
                Ok((z, log_probs, entropy))
            }
            true => {
                let action = z.tanh()?;
                let log_probs = self.squash_correction(normal_logp(&z, &mean, &log_std)?, &action)?;
                Ok((action, log_probs, entropy))
            }
        }
    }

    /// Log probabilities of given actions and the entropy.
    pub fn evaluate(&self, inputs: &Tensor, actions: &Tensor) -> Result<(Tensor, Tensor)> {
        let (mean, log_std) = self.params(inputs)?;
        let entropy = Self::entropy(&log_std)?;
        let log_probs = match self.tanh_squash {
            false => normal_logp(actions, &mean, &log_std)?,
            true => {
                let z = atanh(actions)?;
                self.squash_correction(normal_logp(&z, &mean, &log_std)?, actions)?
            }
        };
        Ok((log_probs, entropy))
    }

    fn squash_correction(&self, log_probs: Tensor, action: &Tensor) -> Result<Tensor> {
        let correction = ((1.0 - action.sqr()?)? + EPSILON)?.log()?;
        Ok((log_probs - correction)?)
    }
}

/// Independent categorical distributions, one per discrete branch.
pub struct MultiCategoricalDistribution {
    branches: Vec<Linear>,
    sizes: Vec<usize>,
}

/// Outcome of a categorical forward pass.
struct CategoricalOutput {
    /// `[n, num_branches]`.
    log_probs: Tensor,
    /// `[n, sum of branch sizes]`.
    all_log_probs: Tensor,
    /// `[n]`.
    entropy: Tensor,
}

impl MultiCategoricalDistribution {
    pub fn new(vb: VarBuilder, hidden_size: usize, sizes: &[usize]) -> Result<Self> {
        let branches = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| Ok(linear(hidden_size, size, vb.pp(format!("branch{}", i)))?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            branches,
            sizes: sizes.to_vec(),
        })
    }

    /// Masked and renormalized log probabilities of every branch.
    fn branch_log_probs(&self, inputs: &Tensor, masks: &Tensor) -> Result<Vec<Tensor>> {
        let mut offset = 0;
        let mut outs = vec![];
        for (branch, &size) in self.branches.iter().zip(self.sizes.iter()) {
            let mask = masks.narrow(1, offset, size)?;
            offset += size;
            let probs = (softmax(&branch.forward(inputs)?, D::Minus1)? * mask)?;
            let probs = probs.broadcast_div(&(probs.sum_keepdim(1)? + EPSILON)?)?;
            outs.push((probs + EPSILON)?.log()?);
        }
        Ok(outs)
    }

    fn output(&self, branch_log_probs: &[Tensor], actions: &Tensor) -> Result<CategoricalOutput> {
        let mut log_probs = vec![];
        let mut entropies = vec![];
        for (i, lp) in branch_log_probs.iter().enumerate() {
            let a = actions.narrow(1, i, 1)?.contiguous()?;
            log_probs.push(lp.gather(&a, 1)?);
            entropies.push((lp.exp()? * lp)?.sum(1)?.neg()?);
        }
        Ok(CategoricalOutput {
            log_probs: Tensor::cat(&log_probs, 1)?,
            all_log_probs: Tensor::cat(branch_log_probs, 1)?,
            entropy: Tensor::stack(&entropies, 1)?.sum(1)?,
        })
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        inputs: &Tensor,
        masks: &Tensor,
        rng: &mut R,
    ) -> Result<(Tensor, CategoricalOutput)> {
        let branch_log_probs = self.branch_log_probs(inputs, masks)?;
        let n = inputs.dim(0)?;
        let mut actions = vec![0u32; n * self.sizes.len()];
        for (b, lp) in branch_log_probs.iter().enumerate() {
            let probs = lp.exp()?.to_vec2::<f32>()?;
            for (i, row) in probs.iter().enumerate() {
                actions[i * self.sizes.len() + b] = sample_index(row, rng) as u32;
            }
        }
        let actions = Tensor::from_vec(actions, (n, self.sizes.len()), inputs.device())?;
        let output = self.output(&branch_log_probs, &actions)?;
        Ok((actions, output))
    }

    fn evaluate(&self, inputs: &Tensor, masks: &Tensor, actions: &Tensor) -> Result<CategoricalOutput> {
        let branch_log_probs = self.branch_log_probs(inputs, masks)?;
        self.output(&branch_log_probs, actions)
    }
}

/// Index drawn with the given probabilities.
fn sample_index<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> usize {
    let u: f32 = rng.gen::<f32>() * probs.iter().sum::<f32>();
    let mut acc = 0.0;
    let mut last = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p <= EPSILON as f32 * 10.0 {
            continue;
        }
        acc += p;
        last = i;
        if u < acc {
            return i;
        }
    }
    last
}

/// Output of [`ActionModel::forward`].
pub struct ActionOutput {
    pub actions: ActionTensors,
    pub log_probs: LogProbTensors,
    /// Entropy of the action distribution, `[n]`.
    pub entropy: Tensor,
}

/// Distributions of a hybrid action space.
pub struct ActionModel {
    action_spec: ActionSpec,
    continuous: Option<GaussianDistribution>,
    discrete: Option<MultiCategoricalDistribution>,
    clip_action: bool,
}

impl ActionModel {
    /// Builds the heads for `action_spec` on top of an encoding of size `hidden_size`.
    ///
    /// Unsquashed continuous actions are clipped before they are sent to the
    /// environment.
    pub fn new(
        vb: VarBuilder,
        hidden_size: usize,
        action_spec: &ActionSpec,
        conditional_sigma: bool,
        tanh_squash: bool,
    ) -> Result<Self> {
        let continuous = match action_spec.continuous_size > 0 {
            true => Some(GaussianDistribution::new(
                vb.pp("continuous"),
                hidden_size,
                action_spec.continuous_size,
                conditional_sigma,
                tanh_squash,
            )?),
            false => None,
        };
        let discrete = match action_spec.discrete_size() > 0 {
            true => Some(MultiCategoricalDistribution::new(
                vb.pp("discrete"),
                hidden_size,
                &action_spec.discrete_branches,
            )?),
            false => None,
        };
        Ok(Self {
            action_spec: action_spec.clone(),
            continuous,
            discrete,
            clip_action: !tanh_squash,
        })
    }

    /// Action space of the heads.
    pub fn action_spec(&self) -> &ActionSpec {
        &self.action_spec
    }

    fn masks_or_ones(&self, inputs: &Tensor, masks: Option<&Tensor>) -> Result<Tensor> {
        match masks {
            Some(m) => Ok(m.clone()),
            None => Ok(Tensor::ones(
                (inputs.dim(0)?, self.action_spec.discrete_mask_size()),
                DType::F32,
                inputs.device(),
            )?),
        }
    }

    /// Samples actions given the encoding `[n, hidden_size]` and action masks `[n, mask size]`.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        inputs: &Tensor,
        masks: Option<&Tensor>,
        rng: &mut R,
    ) -> Result<ActionOutput> {
        let mut entropies = vec![];
        let (continuous, continuous_log_probs) = match &self.continuous {
            Some(dist) => {
                let (a, lp, ent) = dist.sample(inputs)?;
                entropies.push(ent);
                (Some(a), Some(lp))
            }
            None => (None, None),
        };
        let (discrete, discrete_log_probs, all_discrete) = match &self.discrete {
            Some(dist) => {
                let masks = self.masks_or_ones(inputs, masks)?;
                let (a, out) = dist.sample(inputs, &masks, rng)?;
                entropies.push(out.entropy);
                (Some(a), Some(out.log_probs), Some(out.all_log_probs))
            }
            None => (None, None, None),
        };
        Ok(ActionOutput {
            actions: ActionTensors {
                continuous,
                discrete,
            },
            log_probs: LogProbTensors {
                continuous: continuous_log_probs,
                discrete: discrete_log_probs,
                all_discrete,
            },
            entropy: Tensor::stack(&entropies, 0)?.sum(0)?,
        })
    }

    /// Log probabilities and entropy of given actions under the current distributions.
    pub fn evaluate(
        &self,
        inputs: &Tensor,
        masks: Option<&Tensor>,
        actions: &ActionTensors,
    ) -> Result<(LogProbTensors, Tensor)> {
        let mut entropies = vec![];
        let continuous = match (&self.continuous, &actions.continuous) {
            (Some(dist), Some(a)) => {
                let (lp, ent) = dist.evaluate(inputs, a)?;
                entropies.push(ent);
                Some(lp)
            }
            _ => None,
        };
        let (discrete, all_discrete) = match (&self.discrete, &actions.discrete) {
            (Some(dist), Some(a)) => {
                let masks = self.masks_or_ones(inputs, masks)?;
                let out = dist.evaluate(inputs, &masks, a)?;
                entropies.push(out.entropy);
                (Some(out.log_probs), Some(out.all_log_probs))
            }
            _ => (None, None),
        };
        let log_probs = LogProbTensors {
            continuous,
            discrete,
            all_discrete,
        };
        Ok((log_probs, Tensor::stack(&entropies, 0)?.sum(0)?))
    }

    /// Actions as sent to the environment.
    pub fn env_action(&self, actions: &ActionTensors) -> Result<ActionTensors> {
        let continuous = match (&actions.continuous, self.clip_action) {
            (Some(c), true) => Some((c.clamp(-CLIP_RANGE, CLIP_RANGE)? / CLIP_RANGE)?),
            (c, _) => c.clone(),
        };
        Ok(ActionTensors {
            continuous,
            discrete: actions.discrete.clone(),
        })
    }
}
