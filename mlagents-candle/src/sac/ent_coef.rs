//! Entropy coefficients of SAC.
use crate::{
    distributions::LogProbTensors,
    opt::{Optimizer, OptimizerConfig},
    util::{masked_mean, to_scalar, vec_to_tensor},
};
use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{init::Init, VarBuilder, VarMap};
use mlagents_core::{
    behavior::ActionSpec,
    record::{Record, RecordValue},
};

/// Scale of the target entropy of a discrete branch, relative to its maximum.
const DISCRETE_TARGET_ENTROPY_SCALE: f64 = 0.2;

/// Scale of the target entropy of continuous actions, per action dimension.
const CONTINUOUS_TARGET_ENTROPY_SCALE: f64 = 1.0;

/// Sums of `[n, sum(branches)]` over the actions of each branch, `[n, num_branches]`.
pub(super) fn branch_sums(xs: &Tensor, branches: &[usize]) -> Result<Tensor> {
    let mut start = 0;
    let mut sums = Vec::with_capacity(branches.len());
    for &size in branches {
        sums.push(xs.narrow(1, start, size)?.sum_keepdim(1)?);
        start += size;
    }
    Ok(Tensor::cat(&sums, 1)?)
}

/// Automatically tuned entropy coefficients.
///
/// Continuous actions share one coefficient, each discrete branch has its
/// own. The logarithms of the coefficients are trained so that the entropy
/// of the policy stays near a target.
pub struct EntCoef {
    varmap: VarMap,
    log_continuous: Option<Tensor>,
    log_discrete: Option<Tensor>,
    target_continuous: f64,
    target_discrete: Vec<f32>,
    branches: Vec<usize>,
    opt: Optimizer,
}

impl EntCoef {
    pub fn new(
        action_spec: &ActionSpec,
        init_entcoef: f32,
        learning_rate: f64,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let init = Init::Const((init_entcoef as f64).ln());
        let log_continuous = match action_spec.continuous_size > 0 {
            true => Some(vb.get_with_hints(1, "log_continuous", init)?),
            false => None,
        };
        let branches = action_spec.discrete_branches.clone();
        let log_discrete = match branches.is_empty() {
            true => None,
            false => Some(vb.get_with_hints(branches.len(), "log_discrete", init)?),
        };
        let opt = OptimizerConfig::default()
            .learning_rate(learning_rate)
            .build(varmap.all_vars())?;

        Ok(Self {
            target_continuous: -CONTINUOUS_TARGET_ENTROPY_SCALE * action_spec.continuous_size as f64,
            target_discrete: branches
                .iter()
                .map(|&b| (DISCRETE_TARGET_ENTROPY_SCALE * (b as f64).ln()) as f32)
                .collect(),
            branches,
            varmap,
            log_continuous,
            log_discrete,
            opt,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Coefficient of the continuous actions, `[1]`, without gradient.
    pub fn continuous(&self) -> Result<Option<Tensor>> {
        Ok(self
            .log_continuous
            .as_ref()
            .map(|t| t.detach().exp())
            .transpose()?)
    }

    /// Coefficient of each discrete branch, `[num_branches]`, without gradient.
    pub fn discrete(&self) -> Result<Option<Tensor>> {
        Ok(self
            .log_discrete
            .as_ref()
            .map(|t| t.detach().exp())
            .transpose()?)
    }

    /// Loss moving the coefficients toward the target entropy.
    pub fn loss(&self, log_probs: &LogProbTensors, loss_masks: &Tensor) -> Result<Tensor> {
        let mut losses = vec![];
        if let (Some(log_coef), Some(all_log_probs)) = (&self.log_discrete, &log_probs.all_discrete) {
            let per_action_entropy = (all_log_probs * all_log_probs.exp()?)?;
            let target = vec_to_tensor(&self.target_discrete, all_log_probs.device())?;
            let diff = branch_sums(&per_action_entropy, &self.branches)?
                .broadcast_add(&target)?
                .detach();
            let term = diff.broadcast_mul(log_coef)?.mean(D::Minus1)?;
            losses.push(masked_mean(&term, loss_masks)?.neg()?);
        }
        if let (Some(log_coef), Some(cont_log_probs)) = (&self.log_continuous, &log_probs.continuous) {
            let diff = (cont_log_probs.sum(D::Minus1)? + self.target_continuous)?.detach();
            let term = diff.broadcast_mul(log_coef)?;
            losses.push(masked_mean(&term, loss_masks)?.neg()?);
        }
        Ok(Tensor::stack(&losses, 0)?.sum(0)?)
    }

    /// One gradient step on [`EntCoef::loss`]. Returns the loss.
    pub fn update(
        &mut self,
        log_probs: &LogProbTensors,
        loss_masks: &Tensor,
        learning_rate: f64,
    ) -> Result<f32> {
        let loss = self.loss(log_probs, loss_masks)?;
        self.opt.set_learning_rate(learning_rate);
        self.opt.backward_step(&loss)?;
        to_scalar(&loss)
    }

    /// Current coefficients, the discrete ones averaged over branches.
    pub fn record(&self) -> Result<Record> {
        let mut record = Record::empty();
        if let Some(c) = self.continuous()? {
            record.insert("Policy/Continuous Entropy Coeff", RecordValue::Scalar(to_scalar(&c)?));
        }
        if let Some(d) = self.discrete()? {
            record.insert(
                "Policy/Discrete Entropy Coeff",
                RecordValue::Scalar(to_scalar(&d.mean_all()?)?),
            );
        }
        Ok(record)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_branch_sums() -> Result<()> {
        let xs = Tensor::new(&[[1f32, 2., 3., 4., 5.]], &Device::Cpu)?;
        let sums = branch_sums(&xs, &[3, 2])?;
        assert_eq!(sums.to_vec2::<f32>()?, vec![vec![6.0, 9.0]]);
        Ok(())
    }

    #[test]
    fn test_coefficients_follow_entropy() -> Result<()> {
        let spec = ActionSpec::new(1, vec![2]);
        let mut ent_coef = EntCoef::new(&spec, 1.0, 0.1, &Device::Cpu)?;
        assert_eq!(ent_coef.record()?.get_scalar("Policy/Continuous Entropy Coeff")?, 1.0);
        assert_eq!(ent_coef.target_discrete, vec![(0.2 * 2f64.ln()) as f32]);

        // A nearly deterministic policy is below both targets, so the
        // coefficients grow to push the entropy up.
        let p = 0.999f32;
        let log_probs = LogProbTensors {
            continuous: Some(Tensor::new(&[[5f32], [5.]], &Device::Cpu)?),
            discrete: None,
            all_discrete: Some(Tensor::new(
                &[[p.ln(), (1.0 - p).ln()], [p.ln(), (1.0 - p).ln()]],
                &Device::Cpu,
            )?),
        };
        let masks = Tensor::ones(2, DType::F32, &Device::Cpu)?;
        for _ in 0..5 {
            ent_coef.update(&log_probs, &masks, 0.1)?;
        }
        let record = ent_coef.record()?;
        assert!(record.get_scalar("Policy/Continuous Entropy Coeff")? > 1.0);
        assert!(record.get_scalar("Policy/Discrete Entropy Coeff")? > 1.0);
        Ok(())
    }
}
