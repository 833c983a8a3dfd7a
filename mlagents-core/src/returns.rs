//! Discounted returns and advantage estimates of a trajectory.

/// Discounted sum of future rewards, bootstrapped with `value_next`.
pub fn discount_rewards(rewards: &[f32], gamma: f32, value_next: f32) -> Vec<f32> {
    let mut discounted = vec![0.0; rewards.len()];
    let mut running_add = value_next;
    for t in (0..rewards.len()).rev() {
        running_add = running_add * gamma + rewards[t];
        discounted[t] = running_add;
    }
    discounted
}

/// Generalized advantage estimates.
///
/// `value_estimates` holds one value per step; `value_next` is the value of
/// the observation following the last step, 0 when the episode ended.
pub fn get_gae(
    rewards: &[f32],
    value_estimates: &[f32],
    value_next: f32,
    gamma: f32,
    lambd: f32,
) -> Vec<f32> {
    let deltas = rewards
        .iter()
        .enumerate()
        .map(|(t, r)| {
            let next = value_estimates.get(t + 1).copied().unwrap_or(value_next);
            r + gamma * next - value_estimates[t]
        })
        .collect::<Vec<_>>();
    discount_rewards(&deltas, gamma * lambd, 0.0)
}

/// TD(lambda) returns, used as critic targets with a baseline.
pub fn lambda_return(
    rewards: &[f32],
    value_estimates: &[f32],
    gamma: f32,
    lambd: f32,
    value_next: f32,
) -> Vec<f32> {
    let n = rewards.len();
    let mut returns = vec![0.0; n];
    if n == 0 {
        return returns;
    }
    returns[n - 1] = rewards[n - 1] + gamma * value_next;
    for t in (0..n - 1).rev() {
        returns[t] = gamma * lambd * returns[t + 1]
            + rewards[t]
            + (1.0 - lambd) * gamma * value_estimates[t + 1];
    }
    returns
}

#[cfg(test)]
mod test {
    use super::*;

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn test_discount_rewards() {
        let returns = discount_rewards(&[0.0, 0.0, 1.0], 0.5, 0.0);
        assert_close(&returns, &[0.25, 0.5, 1.0]);
        let returns = discount_rewards(&[1.0, 1.0], 0.5, 4.0);
        assert_close(&returns, &[2.5, 3.0]);
    }

    #[test]
    fn test_gae() {
        // With lambda = 1 the advantage equals the discounted return minus the value.
        let rewards = [1.0, 0.0, 2.0];
        let values = [0.5, 0.25, 1.0];
        let gae = get_gae(&rewards, &values, 3.0, 0.9, 1.0);
        let returns = discount_rewards(&rewards, 0.9, 3.0);
        let expected: Vec<f32> = returns.iter().zip(values.iter()).map(|(r, v)| r - v).collect();
        assert_close(&gae, &expected);

        // With lambda = 0 the advantage is the one-step TD error.
        let gae = get_gae(&rewards, &values, 3.0, 0.9, 0.0);
        assert_close(&gae, &[1.0 + 0.9 * 0.25 - 0.5, 0.9 - 0.25, 2.0 + 2.7 - 1.0]);
    }

    #[test]
    fn test_lambda_return() {
        let rewards = [1.0, 0.0, 2.0];
        let values = [0.5, 0.25, 1.0];
        let returns = lambda_return(&rewards, &values, 0.9, 1.0, 3.0);
        assert_close(&returns, &discount_rewards(&rewards, 0.9, 3.0));
        assert!(lambda_return(&[], &[], 0.9, 0.9, 0.0).is_empty());
    }
}
