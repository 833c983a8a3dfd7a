//! Critic evaluation over the sequences of a trajectory.
//!
//! Recurrent critics evaluate a trajectory sequence by sequence, carrying
//! the memory from one sequence to the next. The first sequence takes the
//! leftover steps when the length is not a multiple of the sequence length,
//! matching the padded first window of a resequenced buffer.
use crate::util::{rows_to_tensor, tensor_to_rows};
use anyhow::Result;
use candle_core::{Device, Tensor};
use mlagents_core::error::MlAgentsError;
use std::collections::{BTreeMap, HashMap};

/// `(start, length)` of the sequences of `n` steps.
pub fn sequence_chunks(n: usize, sequence_length: usize) -> Vec<(usize, usize)> {
    let seq_len = sequence_length.max(1);
    let leftover = n % seq_len;
    let mut chunks = vec![];
    let mut start = 0;
    if leftover > 0 {
        chunks.push((0, leftover));
        start = leftover;
    }
    while start < n {
        chunks.push((start, seq_len));
        start += seq_len;
    }
    chunks
}

/// Result of [`evaluate_by_sequence`].
pub struct SequenceEvaluation {
    /// Estimates of every stream, `[n]`.
    pub values: BTreeMap<String, Tensor>,
    /// The memory at the start of the sequence of each step, one row per step.
    pub memories: Vec<Vec<f32>>,
    /// The memory after the last step, `[1, m_size]`.
    pub next_memory: Tensor,
}

/// Folds `critic_pass` over the sequences of `n` steps.
///
/// `critic_pass(start, length, memory)` evaluates steps `start..start + length`
/// from `memory` and returns the estimates with the memory after the last step.
pub fn evaluate_by_sequence<F>(
    n: usize,
    sequence_length: usize,
    initial_memory: Tensor,
    mut critic_pass: F,
) -> Result<SequenceEvaluation>
where
    F: FnMut(usize, usize, &Tensor) -> Result<(BTreeMap<String, Tensor>, Tensor)>,
{
    let mut memories = Vec::with_capacity(n);
    let mut chunks: BTreeMap<String, Vec<Tensor>> = BTreeMap::new();

    let next_memory = sequence_chunks(n, sequence_length).into_iter().try_fold(
        initial_memory,
        |memory, (start, len)| -> Result<Tensor> {
            let row = tensor_to_rows(&memory)?
                .into_iter()
                .next()
                .ok_or_else(|| MlAgentsError::Config("empty memory".to_string()))?;
            memories.extend(std::iter::repeat(row).take(len));
            let (values, next_memory) = critic_pass(start, len, &memory)?;
            for (name, v) in values {
                chunks.entry(name).or_default().push(v);
            }
            Ok(next_memory)
        },
    )?;

    let values = chunks
        .into_iter()
        .map(|(name, vs)| Ok((name, Tensor::cat(&vs, 0)?)))
        .collect::<Result<_>>()?;
    Ok(SequenceEvaluation {
        values,
        memories,
        next_memory,
    })
}

/// Critic memories of the agents between trajectories.
///
/// An agent's memory is dropped when its episode ends.
#[derive(Debug, Default)]
pub struct MemoryDict {
    m_size: usize,
    memories: HashMap<String, Vec<f32>>,
}

impl MemoryDict {
    pub fn new(m_size: usize) -> Self {
        Self {
            m_size,
            memories: HashMap::new(),
        }
    }

    /// The memory of an agent as a `[1, m_size]` tensor, zero for unseen agents.
    pub fn get(&self, agent_id: &str, device: &Device) -> Result<Tensor> {
        let row = self
            .memories
            .get(agent_id)
            .cloned()
            .unwrap_or_else(|| vec![0.0; self.m_size]);
        rows_to_tensor(&[row], device)
    }

    pub fn set(&mut self, agent_id: &str, memory: &Tensor) -> Result<()> {
        if let Some(row) = tensor_to_rows(memory)?.into_iter().next() {
            self.memories.insert(agent_id.to_string(), row);
        }
        Ok(())
    }

    pub fn remove(&mut self, agent_id: &str) {
        self.memories.remove(agent_id);
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}
