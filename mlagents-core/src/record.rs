//! Values returned by an update step.
//!
//! Optimizers return a [`Record`] of named statistics, e.g.
//! `Losses/Policy Loss`, which the trainer forwards to its
//! [`StatsReporter`](crate::stats::StatsReporter).
//!
//! ```rust
//! use mlagents_core::record::{Record, RecordValue};
//!
//! let mut record = Record::from_scalar("Losses/Policy Loss", 0.5);
//! record.insert("Policy/Learning Rate", RecordValue::Scalar(3e-4));
//! assert_eq!(record.get_scalar("Losses/Policy Loss").unwrap(), 0.5);
//! ```
use crate::{error::MlAgentsError, stats::StatsReporter};
use std::collections::{
    btree_map::{IntoIter, Iter, Keys},
    BTreeMap,
};

/// A value in a [`Record`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Scalar(f32),

    /// Values of a per-branch or per-head statistic.
    Array1(Vec<f32>),

    String(String),
}

/// Named values ordered by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(BTreeMap<String, RecordValue>);

impl Record {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// A record containing a single scalar.
    pub fn from_scalar(name: impl Into<String>, value: f32) -> Self {
        let mut record = Self::empty();
        record.insert(name, RecordValue::Scalar(value));
        record
    }

    /// A record of the given key-value pairs.
    pub fn from_slice<K: Into<String> + Clone>(s: &[(K, RecordValue)]) -> Self {
        Self(
            s.iter()
                .map(|(k, v)| (k.clone().into(), v.clone()))
                .collect(),
        )
    }

    pub fn keys(&self) -> Keys<'_, String, RecordValue> {
        self.0.keys()
    }

    pub fn insert(&mut self, k: impl Into<String>, v: RecordValue) {
        self.0.insert(k.into(), v);
    }

    pub fn iter(&self) -> Iter<'_, String, RecordValue> {
        self.0.iter()
    }

    pub fn get(&self, k: &str) -> Option<&RecordValue> {
        self.0.get(k)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merges two records. Values of `record` win on equal keys.
    pub fn merge(self, record: Record) -> Self {
        Record(self.0.into_iter().chain(record.0).collect())
    }

    pub fn merge_inplace(&mut self, record: Record) {
        self.0.extend(record.0);
    }

    pub fn get_scalar(&self, k: &str) -> Result<f32, MlAgentsError> {
        match self.0.get(k) {
            Some(RecordValue::Scalar(v)) => Ok(*v),
            Some(_) => Err(MlAgentsError::RecordValueTypeError("Scalar".to_string())),
            None => Err(MlAgentsError::RecordKeyError(k.to_string())),
        }
    }

    pub fn get_array1(&self, k: &str) -> Result<Vec<f32>, MlAgentsError> {
        match self.0.get(k) {
            Some(RecordValue::Array1(v)) => Ok(v.clone()),
            Some(_) => Err(MlAgentsError::RecordValueTypeError("Array1".to_string())),
            None => Err(MlAgentsError::RecordKeyError(k.to_string())),
        }
    }

    pub fn get_string(&self, k: &str) -> Result<String, MlAgentsError> {
        match self.0.get(k) {
            Some(RecordValue::String(s)) => Ok(s.clone()),
            Some(_) => Err(MlAgentsError::RecordValueTypeError("String".to_string())),
            None => Err(MlAgentsError::RecordKeyError(k.to_string())),
        }
    }

    /// Adds every scalar to the reporter under `category`.
    ///
    /// Arrays are reported by their mean.
    pub fn report(&self, reporter: &StatsReporter, category: &str) {
        for (k, v) in self.iter() {
            match v {
                RecordValue::Scalar(v) => reporter.add_stat(category, k, *v),
                RecordValue::Array1(v) if !v.is_empty() => {
                    reporter.add_stat(category, k, v.iter().sum::<f32>() / v.len() as f32)
                }
                _ => {}
            }
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, RecordValue);
    type IntoIter = IntoIter<String, RecordValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_record() {
        let record = Record::from_slice(&[
            ("Losses/Value Loss", RecordValue::Scalar(2.0)),
            ("Policy/Entropy Coeff", RecordValue::Array1(vec![0.5, 1.5])),
        ])
        .merge(Record::from_scalar("Losses/Value Loss", 1.0));
        assert_eq!(record.get_scalar("Losses/Value Loss").unwrap(), 1.0);
        assert!(record.get_scalar("Policy/Entropy Coeff").is_err());
        assert!(record.get_string("Missing").is_err());

        let reporter = StatsReporter::new(vec![]);
        record.report(&reporter, "brain");
        assert_eq!(reporter.get_mean_stat("brain", "Policy/Entropy Coeff"), 1.0);
        assert_eq!(reporter.get_num_stats("brain", "Losses/Value Loss"), 1);
    }
}
