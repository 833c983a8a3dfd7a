//! Losses shared by the optimizers.
use crate::{
    distributions::{one_hot, ActionTensors, LogProbTensors},
    util::masked_mean,
};
use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::loss::mse;
use mlagents_core::{behavior::ActionSpec, error::MlAgentsError};
use std::collections::BTreeMap;

/// Clipped value loss averaged over the reward streams.
///
/// Each stream's estimate may move at most `epsilon` away from the estimate
/// recorded with the experience; the larger of the clipped and unclipped
/// squared errors is taken.
pub fn trust_region_value_loss(
    values: &BTreeMap<String, Tensor>,
    old_values: &BTreeMap<String, Tensor>,
    returns: &BTreeMap<String, Tensor>,
    epsilon: f64,
    loss_masks: &Tensor,
) -> Result<Tensor> {
    let losses = values
        .iter()
        .map(|(name, head)| {
            let missing = || MlAgentsError::Config(format!("no targets for reward stream {}", name));
            let old = old_values.get(name).ok_or_else(missing)?;
            let ret = returns.get(name).ok_or_else(missing)?;
            let clipped = (old + (head - old)?.clamp(-epsilon, epsilon)?)?;
            let v_opt_a = (ret - head)?.sqr()?;
            let v_opt_b = (ret - clipped)?.sqr()?;
            masked_mean(&v_opt_a.maximum(&v_opt_b)?, loss_masks)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&losses, 0)?.mean(0)?)
}

/// Clipped surrogate objective, negated.
///
/// `log_probs` and `old_log_probs` are `[n, k]`, `advantages` is `[n]`.
pub fn trust_region_policy_loss(
    advantages: &Tensor,
    log_probs: &Tensor,
    old_log_probs: &Tensor,
    loss_masks: &Tensor,
    epsilon: f64,
) -> Result<Tensor> {
    let advantage = advantages.unsqueeze(1)?;
    let r_theta = (log_probs - old_log_probs)?.exp()?;
    let p_opt_a = r_theta.broadcast_mul(&advantage)?;
    let p_opt_b = r_theta
        .clamp(1.0 - epsilon, 1.0 + epsilon)?
        .broadcast_mul(&advantage)?;
    Ok(masked_mean(&p_opt_a.minimum(&p_opt_b)?, loss_masks)?.neg()?)
}

/// Loss of imitating recorded actions.
///
/// Mean squared error between the sampled and recorded continuous actions
/// plus the negative log likelihood of the recorded discrete actions,
/// averaged over the batch and the branches.
pub fn behavioral_cloning_loss(
    action_spec: &ActionSpec,
    selected_actions: &ActionTensors,
    log_probs: &LogProbTensors,
    expert_actions: &ActionTensors,
) -> Result<Tensor> {
    let mut losses = vec![];
    if let (Some(selected), Some(expert)) = (&selected_actions.continuous, &expert_actions.continuous)
    {
        losses.push(mse(selected, expert)?);
    }
    if let (Some(all_log_probs), Some(expert)) = (&log_probs.all_discrete, &expert_actions.discrete)
    {
        let expert_one_hot = one_hot(expert, &action_spec.discrete_branches)?;
        let n_branches = action_spec.discrete_branches.len() as f64;
        let nll = (all_log_probs * expert_one_hot)?.sum(D::Minus1)?.neg()?;
        losses.push((nll.mean_all()? / n_branches)?);
    }
    if losses.is_empty() {
        return Err(MlAgentsError::Config("the action spec has no actions".to_string()).into());
    }
    Ok(Tensor::stack(&losses, 0)?.sum_all()?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util::to_scalar;
    use candle_core::{DType, Device};

    fn t(values: &[f32]) -> Result<Tensor> {
        Ok(Tensor::new(values, &Device::Cpu)?)
    }

    #[test]
    fn test_value_loss_is_clipped() -> Result<()> {
        let name = "extrinsic".to_string();
        let values = BTreeMap::from([(name.clone(), t(&[2.0, 0.0])?)]);
        let old = BTreeMap::from([(name.clone(), t(&[0.0, 0.0])?)]);
        let returns = BTreeMap::from([(name, t(&[1.0, 0.0])?)]);
        let masks = t(&[1.0, 1.0])?;
        // Unclipped error 1, clipped estimate 0.2 gives 0.64; the max is kept.
        let loss = trust_region_value_loss(&values, &old, &returns, 0.2, &masks)?;
        assert!((to_scalar(&loss)? - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_policy_loss_clips_the_ratio() -> Result<()> {
        let old = Tensor::zeros((2, 1), DType::F32, &Device::Cpu)?;
        let new = Tensor::new(&[[1f32], [0.]], &Device::Cpu)?;
        let adv = t(&[1.0, 1.0])?;
        let masks = t(&[1.0, 1.0])?;
        // The ratio e is clipped to 1.2 for a positive advantage.
        let loss = trust_region_policy_loss(&adv, &new, &old, &masks, 0.2)?;
        assert!((to_scalar(&loss)? + 1.1).abs() < 1e-5);

        // Masked steps do not count.
        let masks = t(&[0.0, 1.0])?;
        let loss = trust_region_policy_loss(&adv, &new, &old, &masks, 0.2)?;
        assert!((to_scalar(&loss)? + 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_behavioral_cloning_loss() -> Result<()> {
        let spec = ActionSpec::new(1, vec![2]);
        let expert = ActionTensors {
            continuous: Some(Tensor::new(&[[1f32], [1.]], &Device::Cpu)?),
            discrete: Some(Tensor::new(&[[0u32], [1]], &Device::Cpu)?),
        };
        let selected = ActionTensors {
            continuous: Some(Tensor::new(&[[0f32], [1.]], &Device::Cpu)?),
            discrete: None,
        };
        let half = 0.5f32.ln();
        let log_probs = LogProbTensors {
            continuous: None,
            discrete: None,
            all_discrete: Some(Tensor::new(&[[half, half], [half, half]], &Device::Cpu)?),
        };
        let loss = behavioral_cloning_loss(&spec, &selected, &log_probs, &expert)?;
        let expected = 0.5 + 2f32.ln();
        assert!((to_scalar(&loss)? - expected).abs() < 1e-5);
        Ok(())
    }
}
