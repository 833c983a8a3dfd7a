use crate::{
    distributions::ActionTensors,
    loss::behavioral_cloning_loss,
    opt::{Optimizer, OptimizerConfig},
    policy::CandlePolicy,
    util::{obs_to_tensors, to_scalar},
};
use anyhow::Result;
use candle_core::{DType, Tensor};
use log::{debug, warn};
use mlagents_core::{
    buffer::AgentBuffer,
    demo::demo_to_buffer,
    policy::Policy,
    record::Record,
    schedule::DecayedValue,
    settings::{BehavioralCloningSettings, ScheduleType},
};
use rand::{rngs::StdRng, SeedableRng};

/// Learning rates at or below this value skip the update.
const MIN_LEARNING_RATE: f32 = 1e-10;

/// Loss of the policy imitating the actions of a demonstration batch.
///
/// Demonstrations carry no action masks and start every sequence from a
/// zero memory.
pub(crate) fn cloning_loss(
    policy: &mut CandlePolicy,
    batch: &AgentBuffer,
    num_sequences: usize,
) -> Result<Tensor> {
    let device = policy.device().clone();
    let action_spec = policy.behavior_spec().action_spec.clone();
    let obs = obs_to_tensors(batch, policy.num_obs(), &device)?;
    let expert_actions = ActionTensors::from_buffer(batch, &action_spec, &device)?;
    let memories = match policy.use_recurrent() {
        true => Some(Tensor::zeros((num_sequences, policy.m_size()), DType::F32, &device)?),
        false => None,
    };
    let seq_len = policy.sequence_length();
    let output = policy.sample_actions(&obs, None, memories.as_ref(), seq_len)?;
    behavioral_cloning_loss(&action_spec, &output.actions, &output.log_probs, &expert_actions)
}

/// Imitation updates of a policy trained by another algorithm.
///
/// The learning rate is the policy's scaled by `strength` and anneals to zero
/// over `steps` steps when `steps` is positive.
pub struct BcModule {
    optimizer: Optimizer,
    decay_learning_rate: DecayedValue,
    current_lr: f32,
    demo_buffer: AgentBuffer,
    batch_size: usize,
    num_epoch: usize,
    samples_per_update: usize,
    rng: StdRng,
}

impl BcModule {
    pub fn new(
        policy: &CandlePolicy,
        settings: &BehavioralCloningSettings,
        policy_learning_rate: f32,
        default_batch_size: usize,
        default_num_epoch: usize,
    ) -> Result<Self> {
        let (_, demo_buffer, files) = demo_to_buffer(
            &settings.demo_path,
            policy.sequence_length(),
            Some(policy.behavior_spec()),
        )?;
        if files.is_empty() {
            warn!("No demonstrations found in {:?}", settings.demo_path);
        }

        let learning_rate = policy_learning_rate * settings.strength;
        let schedule = match settings.steps {
            0 => ScheduleType::Constant,
            _ => ScheduleType::Linear,
        };
        let optimizer = OptimizerConfig::default()
            .learning_rate(learning_rate as f64)
            .build(policy.varmap().all_vars())?;

        Ok(Self {
            optimizer,
            decay_learning_rate: DecayedValue::new(schedule, learning_rate, MIN_LEARNING_RATE, settings.steps),
            current_lr: learning_rate,
            demo_buffer,
            batch_size: settings.batch_size.unwrap_or(default_batch_size),
            num_epoch: settings.num_epoch.unwrap_or(default_num_epoch),
            samples_per_update: settings.samples_per_update,
            rng: StdRng::seed_from_u64(0),
        })
    }

    pub fn demo_buffer(&self) -> &AgentBuffer {
        &self.demo_buffer
    }

    pub fn current_learning_rate(&self) -> f32 {
        self.current_lr
    }

    /// Trains the policy on the demonstrations for `num_epoch` epochs.
    ///
    /// Each epoch shuffles the demonstrations and goes through them in mini
    /// batches, at most `samples_per_update` steps when it is positive.
    pub fn update(&mut self, policy: &mut CandlePolicy) -> Result<Record> {
        if self.current_lr <= MIN_LEARNING_RATE {
            return Ok(Record::from_scalar("Losses/Pretraining Loss", 0.0));
        }
        let seq_len = policy.sequence_length().max(1);
        let n_demo = self.demo_buffer.num_experiences();
        let num_sequences = (self.batch_size.min(n_demo) / seq_len).max(1);
        let steps_per_batch = num_sequences * seq_len;
        let mut num_batches = n_demo / steps_per_batch;
        if self.samples_per_update > 0 {
            num_batches = num_batches.min(self.samples_per_update / steps_per_batch);
        }

        let mut losses = vec![];
        for _ in 0..self.num_epoch {
            self.demo_buffer.shuffle(seq_len, &mut self.rng);
            for i in 0..num_batches {
                let batch = self
                    .demo_buffer
                    .make_mini_batch(i * steps_per_batch, (i + 1) * steps_per_batch);
                let loss = cloning_loss(policy, &batch, num_sequences)?;
                self.optimizer.backward_step(&loss)?;
                losses.push(to_scalar(&loss)?);
            }
        }

        self.current_lr = self.decay_learning_rate.get_value(policy.get_current_step());
        self.optimizer.set_learning_rate(self.current_lr as f64);
        debug!("Behavioral cloning on {} mini batches", losses.len());

        let loss = match losses.is_empty() {
            true => 0.0,
            false => losses.iter().sum::<f32>() / losses.len() as f32,
        };
        Ok(Record::from_scalar("Losses/Pretraining Loss", loss))
    }
}
