//! Bounded queues between the environment loop and the trainers.
use crate::error::MlAgentsError;
use anyhow::Result;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};

/// What a producer does when the queue is full.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum QueueFullPolicy {
    /// Wait until a consumer takes an item.
    Block,
    /// Discard the oldest item to make room.
    DropOldest,
}

impl Default for QueueFullPolicy {
    fn default() -> Self {
        Self::DropOldest
    }
}

/// Queue carrying trajectories or policy snapshots of one behavior.
///
/// Cloned handles share the same channel, so the environment loop and the
/// trainer can each keep one.
#[derive(Debug)]
pub struct AgentManagerQueue<T> {
    behavior_id: String,
    maxlen: usize,
    policy: QueueFullPolicy,
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Clone for AgentManagerQueue<T> {
    fn clone(&self) -> Self {
        Self {
            behavior_id: self.behavior_id.clone(),
            maxlen: self.maxlen,
            policy: self.policy,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<T> AgentManagerQueue<T> {
    /// A queue holding at most `maxlen` items, or unbounded when `maxlen` is 0.
    pub fn new(behavior_id: impl Into<String>, maxlen: usize, policy: QueueFullPolicy) -> Self {
        let (sender, receiver) = if maxlen == 0 {
            unbounded()
        } else {
            bounded(maxlen)
        };
        Self {
            behavior_id: behavior_id.into(),
            maxlen,
            policy,
            sender,
            receiver,
        }
    }

    pub fn behavior_id(&self) -> &str {
        &self.behavior_id
    }

    /// Capacity of the queue, 0 when unbounded.
    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Takes the oldest item without blocking.
    ///
    /// Fails with [`MlAgentsError::QueueEmpty`] if there is nothing to take.
    pub fn get_nowait(&self) -> Result<T> {
        match self.receiver.try_recv() {
            Ok(item) => Ok(item),
            Err(TryRecvError::Empty) => Err(MlAgentsError::QueueEmpty.into()),
            Err(TryRecvError::Disconnected) => {
                Err(MlAgentsError::QueueDisconnected(self.behavior_id.clone()).into())
            }
        }
    }

    /// Adds an item, following the full-queue policy.
    pub fn put(&self, item: T) -> Result<()> {
        match self.policy {
            QueueFullPolicy::Block => self
                .sender
                .send(item)
                .map_err(|_| MlAgentsError::QueueDisconnected(self.behavior_id.clone()).into()),
            QueueFullPolicy::DropOldest => {
                let mut item = item;
                loop {
                    match self.sender.try_send(item) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Full(back)) => {
                            let _ = self.receiver.try_recv();
                            item = back;
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            return Err(
                                MlAgentsError::QueueDisconnected(self.behavior_id.clone()).into()
                            )
                        }
                    }
                }
            }
        }
    }

    /// Takes at most `max_items` items without blocking.
    pub fn drain(&self, max_items: usize) -> Vec<T> {
        self.receiver.try_iter().take(max_items).collect()
    }
}
