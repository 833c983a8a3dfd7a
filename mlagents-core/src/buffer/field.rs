use super::Padding;
use serde::{Deserialize, Serialize};

/// Ordered per-step values of one buffer field.
///
/// Each step holds a flat `f32` row. Scalars are rows of length one and
/// booleans are stored as `0.0`/`1.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentBufferField(Vec<Vec<f32>>);

impl AgentBufferField {
    pub fn new() -> Self {
        Self(vec![])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends one step.
    pub fn append(&mut self, row: Vec<f32>) {
        self.0.push(row);
    }

    /// Appends several steps.
    pub fn extend(&mut self, rows: impl IntoIterator<Item = Vec<f32>>) {
        self.0.extend(rows);
    }

    /// Replaces the content of the field.
    pub fn set(&mut self, rows: Vec<Vec<f32>>) {
        self.0 = rows;
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.0
    }

    pub fn get(&self, i: usize) -> Option<&Vec<f32>> {
        self.0.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Vec<f32>> {
        self.0.iter()
    }

    /// The first value of every step, for scalar fields.
    pub fn scalars(&self) -> Vec<f32> {
        self.0
            .iter()
            .map(|r| r.first().copied().unwrap_or(0.0))
            .collect()
    }

    /// All rows concatenated.
    pub fn flatten(&self) -> Vec<f32> {
        self.0.iter().flatten().copied().collect()
    }

    /// Drops the `n` oldest steps.
    pub(crate) fn drop_front(&mut self, n: usize) {
        let n = n.min(self.0.len());
        self.0.drain(..n);
    }

    pub(crate) fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.0.len());
        let start = start.min(end);
        Self(self.0[start..end].to_vec())
    }

    pub(crate) fn into_rows(self) -> Vec<Vec<f32>> {
        self.0
    }

    /// Splits the field into windows of `training_length` steps.
    ///
    /// When the length is not a multiple of `training_length`, the first
    /// window holds the leftover steps preceded by padding. Windows are
    /// returned flattened in chronological order. With `batch_size`, only the
    /// most recent `batch_size` windows are kept.
    pub fn get_batch(
        &self,
        batch_size: Option<usize>,
        training_length: usize,
        padding: Padding,
    ) -> Vec<Vec<f32>> {
        let t = training_length.max(1);
        let n = self.0.len();
        if n == 0 {
            return vec![];
        }
        let leftover = n % t;
        let n_windows = (n + t - 1) / t;
        let skip = batch_size.map_or(0, |b| n_windows.saturating_sub(b));

        let mut rows = Vec::with_capacity((n_windows - skip) * t);
        for w in skip..n_windows {
            if w == 0 && leftover > 0 {
                let pad = match padding {
                    Padding::RepeatFirst => self.0[0].clone(),
                    Padding::Value(v) => vec![v; self.0[0].len()],
                };
                rows.extend(std::iter::repeat(pad).take(t - leftover));
                rows.extend(self.0[..leftover].iter().cloned());
            } else {
                let start = if leftover > 0 {
                    leftover + (w - 1) * t
                } else {
                    w * t
                };
                rows.extend(self.0[start..start + t].iter().cloned());
            }
        }
        rows
    }
}

impl From<Vec<Vec<f32>>> for AgentBufferField {
    fn from(rows: Vec<Vec<f32>>) -> Self {
        Self(rows)
    }
}

impl From<Vec<f32>> for AgentBufferField {
    /// One scalar step per element.
    fn from(values: Vec<f32>) -> Self {
        Self(values.into_iter().map(|v| vec![v]).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn field(n: usize) -> AgentBufferField {
        (1..=n).map(|i| i as f32).collect::<Vec<_>>().into()
    }

    #[test]
    fn test_get_batch_pads_first_window() {
        let batch = field(10).get_batch(None, 4, Padding::RepeatFirst);
        let flat: Vec<f32> = batch.into_iter().flatten().collect();
        assert_eq!(
            flat,
            vec![1., 1., 1., 2., 3., 4., 5., 6., 7., 8., 9., 10.]
        );

        let batch = field(10).get_batch(None, 4, Padding::Value(0.0));
        assert_eq!(batch[0], vec![0.0]);
        assert_eq!(batch[1], vec![0.0]);
        assert_eq!(batch[2], vec![1.0]);
    }

    #[test]
    fn test_get_batch_keeps_most_recent_windows() {
        let batch = field(10).get_batch(Some(2), 4, Padding::RepeatFirst);
        let flat: Vec<f32> = batch.into_iter().flatten().collect();
        assert_eq!(flat, vec![3., 4., 5., 6., 7., 8., 9., 10.]);
    }

    #[test]
    fn test_get_batch_exact_multiple() {
        let batch = field(8).get_batch(None, 4, Padding::RepeatFirst);
        let flat: Vec<f32> = batch.into_iter().flatten().collect();
        assert_eq!(flat, (1..=8).map(|i| i as f32).collect::<Vec<_>>());
        assert!(AgentBufferField::new()
            .get_batch(None, 4, Padding::RepeatFirst)
            .is_empty());
    }
}
