use super::{AgentBufferField, BufferKey};
use crate::error::MlAgentsError;
use anyhow::Result;
use bincode::Options;
use log::trace;
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

/// Keyed per-step records of one agent, or the aggregate training buffer of a trainer.
///
/// All fields of a buffer describe the same steps and thus have equal
/// length once a step is fully written. Training buffers are built by
/// [`AgentBuffer::resequence_and_append`], which keeps them aligned to
/// windows of the training sequence length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentBuffer {
    fields: BTreeMap<BufferKey, AgentBufferField>,
}

impl AgentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one step to a field, creating it if needed.
    pub fn append(&mut self, key: BufferKey, row: Vec<f32>) {
        self.field_mut(key).append(row);
    }

    /// Appends a scalar step to a field.
    pub fn append_scalar(&mut self, key: BufferKey, value: f32) {
        self.field_mut(key).append(vec![value]);
    }

    /// Appends a boolean step as `0.0`/`1.0`.
    pub fn append_bool(&mut self, key: BufferKey, value: bool) {
        self.append_scalar(key, if value { 1.0 } else { 0.0 });
    }

    /// Replaces the content of a field.
    pub fn set(&mut self, key: BufferKey, rows: Vec<Vec<f32>>) {
        self.field_mut(key).set(rows);
    }

    /// Replaces the content of a scalar field.
    pub fn set_scalars(&mut self, key: BufferKey, values: Vec<f32>) {
        self.field_mut(key).set(values.into_iter().map(|v| vec![v]).collect());
    }

    pub fn get(&self, key: &BufferKey) -> Option<&AgentBufferField> {
        self.fields.get(key)
    }

    /// Returns a field, failing if it was never written.
    pub fn field(&self, key: &BufferKey) -> Result<&AgentBufferField> {
        self.fields
            .get(key)
            .ok_or_else(|| MlAgentsError::BufferKeyMissing(key.to_string()).into())
    }

    /// Returns a field, creating an empty one if needed.
    pub fn field_mut(&mut self, key: BufferKey) -> &mut AgentBufferField {
        self.fields.entry(key).or_default()
    }

    pub fn contains_key(&self, key: &BufferKey) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &BufferKey> {
        self.fields.keys()
    }

    pub fn remove(&mut self, key: &BufferKey) -> Option<AgentBufferField> {
        self.fields.remove(key)
    }

    /// Number of steps, taken from the first field.
    pub fn num_experiences(&self) -> usize {
        self.fields.values().next().map_or(0, |f| f.len())
    }

    pub fn is_empty(&self) -> bool {
        self.num_experiences() == 0
    }

    /// Whether the given fields have the same length.
    pub fn check_length(&self, keys: &[BufferKey]) -> bool {
        let mut lengths = keys
            .iter()
            .map(|k| self.fields.get(k).map_or(0, |f| f.len()));
        match lengths.next() {
            None => true,
            Some(first) => lengths.all(|l| l == first),
        }
    }

    /// Fails if any two fields differ in length.
    pub fn validate(&self) -> Result<()> {
        let expected = self.num_experiences();
        for (key, field) in self.fields.iter() {
            if field.len() != expected {
                return Err(MlAgentsError::BufferLengthMismatch {
                    key: key.to_string(),
                    expected,
                    actual: field.len(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Clears the in-progress steps of the agent.
    ///
    /// Windows already appended to a training buffer live in that buffer and
    /// are untouched.
    pub fn reset_agent(&mut self) {
        self.fields.clear();
    }

    /// Slices every field into windows of `training_length` steps and appends
    /// them to `target`.
    ///
    /// The first window is left-padded when the length is not a multiple of
    /// `training_length` (see [`AgentBufferField::get_batch`]). With
    /// `batch_size`, only the most recent `batch_size` windows are appended.
    pub fn resequence_and_append(
        &self,
        target: &mut AgentBuffer,
        batch_size: Option<usize>,
        training_length: usize,
    ) -> Result<()> {
        self.validate()?;
        for (key, field) in self.fields.iter() {
            let rows = field.get_batch(batch_size, training_length, key.padding());
            target.field_mut(key.clone()).extend(rows);
        }
        trace!(
            "Resequenced {} steps into a buffer of {} steps",
            self.num_experiences(),
            target.num_experiences()
        );
        Ok(())
    }

    /// Steps `start..end` of every field.
    pub fn make_mini_batch(&self, start: usize, end: usize) -> AgentBuffer {
        AgentBuffer {
            fields: self
                .fields
                .iter()
                .map(|(k, f)| (k.clone(), f.slice(start, end)))
                .collect(),
        }
    }

    /// Draws `batch_size / sequence_length` random windows.
    ///
    /// Windows are aligned to `sequence_length` and may repeat. An empty
    /// buffer yields an empty mini batch.
    pub fn sample_mini_batch<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        sequence_length: usize,
        rng: &mut R,
    ) -> AgentBuffer {
        let t = sequence_length.max(1);
        let n_windows = self.num_experiences() / t;
        let n_samples = batch_size / t;
        if n_windows == 0 || n_samples == 0 {
            return AgentBuffer::new();
        }
        let starts: Vec<usize> = (0..n_samples)
            .map(|_| rng.gen_range(0..n_windows) * t)
            .collect();

        AgentBuffer {
            fields: self
                .fields
                .iter()
                .map(|(k, f)| {
                    let rows = starts
                        .iter()
                        .flat_map(|&s| f.rows()[s..s + t].iter().cloned())
                        .collect::<Vec<_>>();
                    (k.clone(), rows.into())
                })
                .collect(),
        }
    }

    /// Shuffles whole windows of `sequence_length` steps, identically across fields.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, sequence_length: usize, rng: &mut R) {
        let t = sequence_length.max(1);
        let n_windows = self.num_experiences() / t;
        let mut order: Vec<usize> = (0..n_windows).collect();
        order.shuffle(rng);

        for field in self.fields.values_mut() {
            let rows = std::mem::take(field).into_rows();
            let shuffled = order
                .iter()
                .flat_map(|&w| rows[w * t..(w + 1) * t].iter().cloned())
                .collect::<Vec<_>>();
            field.set(shuffled);
        }
    }

    /// Drops the oldest steps so that at most `max_length` steps remain.
    ///
    /// The cut is rounded to whole windows of `sequence_length` so that the
    /// buffer stays aligned. A second call with the same arguments is a no-op.
    pub fn truncate(&mut self, max_length: usize, sequence_length: usize) {
        let current = self.num_experiences();
        if current <= max_length {
            return;
        }
        let t = sequence_length.max(1);
        let max_length = max_length - max_length % t;
        let n_drop = current - max_length;
        for field in self.fields.values_mut() {
            field.drop_front(n_drop);
        }
    }

    /// Appends the steps of `other` field by field.
    pub fn extend_from(&mut self, other: &AgentBuffer) {
        for (k, f) in other.fields.iter() {
            self.field_mut(k.clone()).extend(f.rows().iter().cloned());
        }
    }

    /// Writes the buffer with bincode.
    pub fn save_to_writer<W: Write>(&self, writer: W) -> Result<()> {
        bincode::DefaultOptions::new().serialize_into(writer, self)?;
        Ok(())
    }

    /// Reads a buffer written by [`AgentBuffer::save_to_writer`], replacing the content of `self`.
    pub fn load_from_reader<R: Read>(&mut self, reader: R) -> Result<()> {
        let buffer: AgentBuffer = bincode::DefaultOptions::new().deserialize_from(reader)?;
        buffer.validate()?;
        *self = buffer;
        Ok(())
    }

    /// Saves the buffer into a file.
    pub fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.save_to_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Loads the buffer from a file.
    pub fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        let reader = BufReader::new(File::open(path)?);
        self.load_from_reader(reader)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use tempdir::TempDir;

    fn agent_buffer(n: usize, offset: f32) -> AgentBuffer {
        let mut buffer = AgentBuffer::new();
        for i in 0..n {
            let v = offset + i as f32;
            buffer.append(BufferKey::Obs(0), vec![v, v + 0.5]);
            buffer.append_scalar(BufferKey::EnvironmentRewards, v);
            buffer.append_bool(BufferKey::Done, i + 1 == n);
            buffer.append_scalar(BufferKey::Masks, 1.0);
        }
        buffer
    }

    #[test]
    fn test_append_keeps_fields_equal() -> Result<()> {
        let buffer = agent_buffer(7, 0.0);
        assert_eq!(buffer.num_experiences(), 7);
        assert!(buffer.check_length(&[BufferKey::Obs(0), BufferKey::Done, BufferKey::Masks]));
        buffer.validate()?;

        let mut broken = buffer.clone();
        broken.append_scalar(BufferKey::Done, 0.0);
        assert!(broken.validate().is_err());
        assert!(broken.resequence_and_append(&mut AgentBuffer::new(), None, 1).is_err());
        Ok(())
    }

    #[test]
    fn test_resequence_ten_steps_with_sequence_length_four() -> Result<()> {
        let buffer = agent_buffer(10, 1.0);
        let mut target = AgentBuffer::new();
        buffer.resequence_and_append(&mut target, None, 4)?;

        // ceil(10 / 4) windows of 4 steps
        assert_eq!(target.num_experiences(), 12);
        target.validate()?;
        let rewards = target.field(&BufferKey::EnvironmentRewards)?.scalars();
        assert_eq!(&rewards[..4], &[1.0, 1.0, 1.0, 2.0]);
        assert_eq!(&rewards[4..8], &[3.0, 4.0, 5.0, 6.0]);
        assert_eq!(&rewards[8..], &[7.0, 8.0, 9.0, 10.0]);

        // padded steps are excluded from the loss
        let masks = target.field(&BufferKey::Masks)?.scalars();
        assert_eq!(&masks[..4], &[0.0, 0.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_resequence_appends_after_existing_windows() -> Result<()> {
        let mut target = AgentBuffer::new();
        agent_buffer(5, 0.0).resequence_and_append(&mut target, None, 2)?;
        agent_buffer(3, 100.0).resequence_and_append(&mut target, None, 2)?;
        assert_eq!(target.num_experiences(), 6 + 4);
        assert_eq!(target.num_experiences() % 2, 0);

        let mut recent = AgentBuffer::new();
        agent_buffer(9, 0.0).resequence_and_append(&mut recent, Some(2), 3)?;
        assert_eq!(
            recent.field(&BufferKey::EnvironmentRewards)?.scalars(),
            vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]
        );
        Ok(())
    }

    #[test]
    fn test_reset_agent_keeps_target() -> Result<()> {
        let mut buffer = agent_buffer(4, 0.0);
        let mut target = AgentBuffer::new();
        buffer.resequence_and_append(&mut target, None, 2)?;
        buffer.reset_agent();
        assert_eq!(buffer.num_experiences(), 0);
        assert_eq!(target.num_experiences(), 4);
        Ok(())
    }

    #[test]
    fn test_sample_mini_batch() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut target = AgentBuffer::new();
        agent_buffer(20, 0.0)
            .resequence_and_append(&mut target, None, 5)
            .unwrap();

        let batch = target.sample_mini_batch(10, 5, &mut rng);
        assert_eq!(batch.num_experiences(), 10);
        batch.validate().unwrap();
        for w in 0..2 {
            let r = batch.field(&BufferKey::EnvironmentRewards).unwrap().scalars();
            let window = &r[w * 5..(w + 1) * 5];
            assert_eq!(window[0] % 5.0, 0.0);
            assert!(window.windows(2).all(|p| p[1] == p[0] + 1.0));
        }

        let empty = AgentBuffer::new().sample_mini_batch(10, 5, &mut rng);
        assert_eq!(empty.num_experiences(), 0);
    }

    #[test]
    fn test_shuffle_keeps_rows_aligned() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut buffer = agent_buffer(12, 0.0);
        buffer.shuffle(3, &mut rng);
        let obs = buffer.field(&BufferKey::Obs(0)).unwrap();
        let rewards = buffer.field(&BufferKey::EnvironmentRewards).unwrap().scalars();
        for (row, r) in obs.iter().zip(rewards.iter()) {
            assert_eq!(row[0], *r);
        }
        let mut sorted = rewards.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(sorted, (0..12).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_truncate_is_idempotent() {
        let mut buffer = AgentBuffer::new();
        agent_buffer(20, 0.0)
            .resequence_and_append(&mut buffer, None, 4)
            .unwrap();
        buffer.truncate(10, 4);
        assert_eq!(buffer.num_experiences(), 8);
        assert_eq!(
            buffer.field(&BufferKey::EnvironmentRewards).unwrap().scalars()[0],
            12.0
        );
        let snapshot = buffer.clone();
        buffer.truncate(10, 4);
        assert_eq!(buffer, snapshot);
    }

    #[test]
    fn test_make_mini_batch() {
        let buffer = agent_buffer(10, 0.0);
        let batch = buffer.make_mini_batch(2, 5);
        assert_eq!(batch.num_experiences(), 3);
        assert_eq!(
            batch.field(&BufferKey::EnvironmentRewards).unwrap().scalars(),
            vec![2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = TempDir::new("agent_buffer")?;
        let path = dir.path().join("buffer.bin");
        let buffer = agent_buffer(6, 3.0);
        buffer.save(&path)?;

        let mut loaded = AgentBuffer::new();
        loaded.load(&path)?;
        assert_eq!(loaded, buffer);

        std::fs::write(&path, b"\x05corrupt")?;
        assert!(loaded.load(&path).is_err());
        assert!(loaded.load(dir.path().join("missing.bin")).is_err());
        Ok(())
    }
}
