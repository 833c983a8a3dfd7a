//! Demonstration files recorded from an environment.
//!
//! A file holds length-delimited records. The first record is a
//! [`DemonstrationMetaMessage`], followed at byte offset [`INITIAL_POS`] by
//! the [`BrainParametersMessage`] and then one [`AgentInfoActionPairMessage`]
//! per recorded step. Lengths are LEB128 varints, record bodies are bincode.
use crate::{
    behavior::BehaviorSpec,
    buffer::{AgentBuffer, BufferKey},
    error::MlAgentsError,
    messages::{
        behavior_spec_from_messages, steps_from_messages, AgentInfoActionPairMessage,
        BrainParametersMessage, DemonstrationMetaMessage,
    },
    trajectory::ObsUtil,
};
use anyhow::{Context, Result};
use bincode::Options;
use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashSet,
    fs::{self, File},
    io::{BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// Byte offset of the brain parameters. The metadata record must fit before it.
pub const INITIAL_POS: u64 = 33;

/// API versions of demonstration files that can be read.
pub const SUPPORTED_DEMONSTRATION_VERSIONS: [i32; 2] = [0, 1];

/// Extension of demonstration files.
pub const DEMO_EXTENSION: &str = "demo";

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes a varint at `pos`, returning the value and the position after it.
///
/// Returns `None` if the data ends inside the varint or it overflows 32 bits.
fn decode_varint(data: &[u8], mut pos: usize) -> Option<(usize, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let byte = *data.get(pos)?;
        pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value as usize, pos));
        }
        shift += 7;
        if shift >= 35 {
            return None;
        }
    }
}

fn encode_delimited<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = bincode::DefaultOptions::new().serialize(message)?;
    let mut out = Vec::with_capacity(body.len() + 5);
    encode_varint(body.len() as u64, &mut out);
    out.extend(body);
    Ok(out)
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    bincode::DefaultOptions::new()
        .deserialize(body)
        .map_err(|e| MlAgentsError::Decode(e.to_string()).into())
}

/// Writes a demonstration file.
pub fn write_demo(
    path: impl AsRef<Path>,
    meta: &DemonstrationMetaMessage,
    brain_params: &BrainParametersMessage,
    pairs: &[AgentInfoActionPairMessage],
) -> Result<()> {
    let header = encode_delimited(meta)?;
    if header.len() as u64 > INITIAL_POS {
        return Err(MlAgentsError::Decode(format!(
            "demonstration metadata takes {} bytes, at most {} fit before the brain parameters",
            header.len(),
            INITIAL_POS
        ))
        .into());
    }
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    writer.write_all(&header)?;
    writer.seek(SeekFrom::Start(INITIAL_POS))?;
    writer.write_all(&encode_delimited(brain_params)?)?;
    for pair in pairs.iter() {
        writer.write_all(&encode_delimited(pair)?)?;
    }
    writer.flush()?;
    Ok(())
}

/// Demonstration files at `path`.
///
/// A file must have the `.demo` extension, a directory yields the `.demo`
/// files it contains in name order.
pub fn get_demo_files(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.is_file() {
        if path.extension().map_or(true, |e| e != DEMO_EXTENSION) {
            return Err(MlAgentsError::InvalidDemoPath(path.to_path_buf()).into());
        }
        Ok(vec![path.to_path_buf()])
    } else if path.is_dir() {
        let mut paths = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|p| p.is_file() && p.extension().map_or(false, |e| e == DEMO_EXTENSION))
            .collect::<Vec<_>>();
        paths.sort();
        if paths.is_empty() {
            debug!("There are no '.demo' files in {:?}", path);
        }
        Ok(paths)
    } else {
        Err(MlAgentsError::DemoNotFound(path.to_path_buf()).into())
    }
}

/// Contents of the demonstration files at a path.
#[derive(Debug, Clone, Default)]
pub struct Demonstration {
    /// `None` when no file had any step.
    pub behavior_spec: Option<BehaviorSpec>,
    /// Recorded steps, one list per file.
    pub pairs: Vec<Vec<AgentInfoActionPairMessage>>,
    pub files: Vec<PathBuf>,
}

/// Reads the demonstration files at `path`, skipping `exclusions`.
///
/// Reading a file stops at the number of steps given in its metadata or
/// at the end of the data, whichever comes first.
pub fn load_demonstration(
    path: impl AsRef<Path>,
    exclusions: Option<&HashSet<PathBuf>>,
) -> Result<Demonstration> {
    let path = path.as_ref();
    let files: Vec<PathBuf> = get_demo_files(path)?
        .into_iter()
        .filter(|f| exclusions.map_or(true, |ex| !ex.contains(f)))
        .collect();

    let mut behavior_spec = None;
    let mut brain_params: Option<BrainParametersMessage> = None;
    let mut total_expected = 0;
    let mut pairs = Vec::with_capacity(files.len());

    for file in files.iter() {
        let data = fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
        let mut expected_in_file = 0;
        let mut pairs_in_file = vec![];
        let mut pos = 0;
        let mut n_decoded = 0;

        while pos < data.len() {
            let (len, start) = match decode_varint(&data, pos) {
                Some(v) => v,
                None => break,
            };
            let body = match data.get(start..start + len) {
                Some(body) => body,
                None => {
                    debug!("{:?} ends inside a record", file);
                    break;
                }
            };
            match n_decoded {
                0 => {
                    let meta: DemonstrationMetaMessage = decode_body(body)?;
                    if !SUPPORTED_DEMONSTRATION_VERSIONS.contains(&meta.api_version) {
                        return Err(MlAgentsError::UnsupportedDemoVersion(meta.api_version).into());
                    }
                    expected_in_file += meta.number_steps;
                    pos = INITIAL_POS as usize;
                }
                1 => {
                    brain_params = Some(decode_body(body)?);
                    pos = start + len;
                }
                _ => {
                    let pair: AgentInfoActionPairMessage = decode_body(body)?;
                    if behavior_spec.is_none() {
                        let params = brain_params.as_ref().ok_or_else(|| {
                            MlAgentsError::Decode(format!("No brain parameters in {:?}", file))
                        })?;
                        behavior_spec = Some(behavior_spec_from_messages(params, &pair.agent_info));
                    }
                    pairs_in_file.push(pair);
                    pos = start + len;
                    if pairs_in_file.len() == expected_in_file {
                        break;
                    }
                }
            }
            n_decoded += 1;
        }
        debug!("Read {} steps from {:?}", pairs_in_file.len(), file);
        pairs.push(pairs_in_file);
        total_expected += expected_in_file;
    }

    if behavior_spec.is_none() && total_expected > 0 {
        return Err(MlAgentsError::Decode(format!(
            "No brain parameters found in demonstration file at {:?}",
            path
        ))
        .into());
    }
    Ok(Demonstration {
        behavior_spec,
        pairs,
        files,
    })
}

/// Converts recorded steps into a training buffer.
///
/// Each step pair yields a row with the observation of the first step, the
/// reward and done flag of the second one, and the recorded action. The
/// previous action is zero at the start of a file. Episodes are
/// resequenced into windows of `sequence_length` steps.
pub fn make_demo_buffer(
    all_pairs: &[Vec<AgentInfoActionPairMessage>],
    behavior_spec: &BehaviorSpec,
    sequence_length: usize,
) -> Result<AgentBuffer> {
    let action_spec = &behavior_spec.action_spec;
    let mut raw = AgentBuffer::new();
    let mut processed = AgentBuffer::new();

    for pairs in all_pairs.iter() {
        for (idx, window) in pairs.windows(2).enumerate() {
            let (current, next) = (&window[0], &window[1]);
            let (current_decision, current_terminal) =
                steps_from_messages(std::slice::from_ref(&current.agent_info), behavior_spec)?;
            let (next_decision, next_terminal) =
                steps_from_messages(std::slice::from_ref(&next.agent_info), behavior_spec)?;

            let previous_action = if idx == 0 {
                vec![0.0; current.action_info.vector_actions_deprecated.len()]
            } else {
                pairs[idx - 1].action_info.vector_actions_deprecated.clone()
            };

            let next_done = next_terminal.len() == 1;
            let next_reward = if next_done {
                next_terminal.reward[0]
            } else {
                next_decision.reward.first().copied().unwrap_or(0.0)
            };
            let current_obs = if current_terminal.len() == 1 {
                current_terminal.at(0).obs
            } else {
                current_decision.at(0).obs
            };

            raw.append_bool(BufferKey::Done, next_done);
            raw.append_scalar(BufferKey::EnvironmentRewards, next_reward);
            for (i, obs) in current_obs.into_iter().enumerate() {
                raw.append(ObsUtil::get_name_at(i), obs);
            }

            let action = &current.action_info;
            if action.continuous_actions.is_empty() && action.discrete_actions.is_empty() {
                let key = if action_spec.continuous_size > 0 {
                    BufferKey::ContinuousAction
                } else {
                    BufferKey::DiscreteAction
                };
                raw.append(key, action.vector_actions_deprecated.clone());
            } else {
                if action_spec.continuous_size > 0 {
                    raw.append(BufferKey::ContinuousAction, action.continuous_actions.clone());
                }
                if action_spec.discrete_size() > 0 {
                    raw.append(
                        BufferKey::DiscreteAction,
                        action.discrete_actions.iter().map(|&a| a as f32).collect(),
                    );
                }
            }
            raw.append(BufferKey::PrevAction, previous_action);

            if next_done {
                raw.resequence_and_append(&mut processed, None, sequence_length)?;
                raw.reset_agent();
            }
        }
    }
    raw.resequence_and_append(&mut processed, None, sequence_length)?;
    Ok(processed)
}

/// Fails if the demonstrations were recorded with a different behavior spec.
pub fn check_demo_spec(demo: &BehaviorSpec, expected: &BehaviorSpec) -> Result<()> {
    if demo.action_spec != expected.action_spec {
        return Err(MlAgentsError::DemoSpecMismatch(format!(
            "The actions {:?} in demonstration do not match the policy's {:?}",
            demo.action_spec, expected.action_spec
        ))
        .into());
    }
    if demo.observation_specs.len() != expected.observation_specs.len() {
        return Err(MlAgentsError::DemoSpecMismatch(
            "The demonstrations do not have the same number of observations as the policy"
                .to_string(),
        )
        .into());
    }
    for (i, (d, p)) in demo
        .observation_specs
        .iter()
        .zip(expected.observation_specs.iter())
        .enumerate()
    {
        if d.shape != p.shape {
            return Err(MlAgentsError::DemoSpecMismatch(format!(
                "The shape {:?} for observation {} in demonstration does not match the policy's {:?}",
                d.shape, i, p.shape
            ))
            .into());
        }
    }
    Ok(())
}

/// Loads the demonstrations at `path` into a buffer.
///
/// Returns the behavior spec of the recording (`None` if nothing was
/// recorded), the buffer, and the files read.
pub fn demo_to_buffer(
    path: impl AsRef<Path>,
    sequence_length: usize,
    expected_behavior_spec: Option<&BehaviorSpec>,
) -> Result<(Option<BehaviorSpec>, AgentBuffer, Vec<PathBuf>)> {
    let demo = load_demonstration(path, None)?;
    let spec = match (&demo.behavior_spec, demo.files.is_empty()) {
        (Some(spec), false) => spec.clone(),
        _ => return Ok((None, AgentBuffer::new(), demo.files)),
    };
    let buffer = make_demo_buffer(&demo.pairs, &spec, sequence_length)?;
    if let Some(expected) = expected_behavior_spec {
        check_demo_spec(&spec, expected)?;
    }
    Ok((Some(spec), buffer, demo.files))
}

/// A growing buffer of demonstrations read from a file or directory.
///
/// [`DemoManager::refresh`] picks up files added since the last read.
pub struct DemoManager {
    path: PathBuf,
    sequence_length: usize,
    expected_behavior_spec: Option<BehaviorSpec>,
    max_buffer_size: usize,
    loaded_files: HashSet<PathBuf>,
    demo_buffer: AgentBuffer,
}

impl DemoManager {
    pub const DEFAULT_BUFFER_SIZE: usize = 1_000_000;

    pub fn new(
        path: impl Into<PathBuf>,
        sequence_length: usize,
        expected_behavior_spec: Option<BehaviorSpec>,
        max_buffer_size: usize,
    ) -> Result<Self> {
        let path = path.into();
        let (_, demo_buffer, files) =
            demo_to_buffer(&path, sequence_length, expected_behavior_spec.as_ref())?;
        if files.is_empty() {
            warn!("No demos found in {:?}. Continuing to look for new files.", path);
        } else {
            info!(
                "Loaded {} demonstration steps from {} files",
                demo_buffer.num_experiences(),
                files.len()
            );
        }
        Ok(Self {
            path,
            sequence_length,
            expected_behavior_spec,
            max_buffer_size,
            loaded_files: files.into_iter().collect(),
            demo_buffer,
        })
    }

    pub fn demo_buffer(&self) -> &AgentBuffer {
        &self.demo_buffer
    }

    /// Loads files that were not read yet and returns the number of new steps.
    ///
    /// When the buffer exceeds its size, it keeps the most recent 80%.
    pub fn refresh(&mut self) -> Result<usize> {
        let demo = load_demonstration(&self.path, Some(&self.loaded_files))?;
        if demo.files.is_empty() {
            return Ok(0);
        }
        self.loaded_files.extend(demo.files.iter().cloned());
        let spec = match demo.behavior_spec {
            Some(spec) => spec,
            None => return Ok(0),
        };
        if let Some(expected) = &self.expected_behavior_spec {
            check_demo_spec(&spec, expected)?;
        }

        let new_demos = make_demo_buffer(&demo.pairs, &spec, self.sequence_length)?;
        new_demos.resequence_and_append(&mut self.demo_buffer, None, self.sequence_length)?;
        if self.demo_buffer.num_experiences() > self.max_buffer_size {
            let max_length = self.max_buffer_size * 4 / 5;
            self.demo_buffer.truncate(max_length, self.sequence_length);
        }
        debug!(
            "Loaded {} new demonstration steps from {:?}",
            new_demos.num_experiences(),
            demo.files
        );
        Ok(new_demos.num_experiences())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        behavior::{ActionSpec, ObservationSpec},
        messages::{ActionSpecMessage, AgentActionMessage, AgentInfoMessage, ObservationMessage},
    };
    use tempdir::TempDir;

    fn pair(step: usize, done: bool) -> AgentInfoActionPairMessage {
        AgentInfoActionPairMessage {
            agent_info: AgentInfoMessage {
                reward: step as f32,
                done,
                id: 0,
                observations: vec![ObservationMessage::float(vec![2], vec![step as f32; 2])],
                ..Default::default()
            },
            action_info: AgentActionMessage {
                continuous_actions: vec![0.5],
                vector_actions_deprecated: vec![0.5],
                ..Default::default()
            },
        }
    }

    /// Writes `n_steps` steps of a continuous behavior with episodes of 4 steps.
    pub(crate) fn write_fake_demo(path: &Path, n_steps: usize) -> Result<()> {
        let meta = DemonstrationMetaMessage {
            api_version: 1,
            demonstration_name: "fake".to_string(),
            number_steps: n_steps,
            number_episodes: n_steps / 4,
            mean_reward: 1.0,
        };
        let brain_params = BrainParametersMessage {
            brain_name: "Fake".to_string(),
            is_training: true,
            action_spec: Some(ActionSpecMessage {
                num_continuous_actions: 1,
                discrete_branch_sizes: vec![],
            }),
            ..Default::default()
        };
        let pairs: Vec<_> = (0..n_steps).map(|i| pair(i, i % 4 == 3)).collect();
        write_demo(path, &meta, &brain_params, &pairs)
    }

    fn fake_spec() -> BehaviorSpec {
        BehaviorSpec::new(
            vec![ObservationSpec::new(vec![2], "")],
            ActionSpec::create_continuous(1),
        )
    }

    #[test]
    fn test_varint() {
        for value in [0u64, 1, 127, 128, 300, 1 << 20].iter() {
            let mut out = vec![];
            encode_varint(*value, &mut out);
            assert_eq!(decode_varint(&out, 0), Some((*value as usize, out.len())));
        }
        assert_eq!(decode_varint(&[0x80], 0), None);
    }

    #[test]
    fn test_load_demonstration() -> Result<()> {
        let dir = TempDir::new("demo")?;
        let path = dir.path().join("test.demo");
        write_fake_demo(&path, 8)?;

        let demo = load_demonstration(&path, None)?;
        assert_eq!(demo.files, vec![path.clone()]);
        assert_eq!(demo.pairs.len(), 1);
        assert_eq!(demo.pairs[0].len(), 8);
        assert_eq!(demo.behavior_spec, Some(fake_spec()));
        let written: Vec<_> = (0..8).map(|i| pair(i, i % 4 == 3)).collect();
        assert_eq!(demo.pairs[0], written);

        let (spec, buffer, _) = demo_to_buffer(&path, 1, Some(&fake_spec()))?;
        assert_eq!(spec, Some(fake_spec()));
        assert_eq!(buffer.num_experiences(), 7);
        assert_eq!(buffer.field(&BufferKey::Done)?.scalars()[2], 1.0);
        assert_eq!(buffer.field(&BufferKey::EnvironmentRewards)?.scalars()[0], 1.0);
        assert_eq!(buffer.field(&BufferKey::PrevAction)?.rows()[0], vec![0.0]);
        assert_eq!(buffer.field(&BufferKey::PrevAction)?.rows()[1], vec![0.5]);
        let obs = buffer.field(&BufferKey::Obs(0))?.rows();
        let actions = buffer.field(&BufferKey::ContinuousAction)?.rows();
        for i in 0..7 {
            assert_eq!(obs[i], vec![i as f32; 2]);
            assert_eq!(actions[i], vec![0.5]);
        }
        Ok(())
    }

    #[test]
    fn test_fewer_records_than_declared() -> Result<()> {
        let dir = TempDir::new("demo")?;
        let path = dir.path().join("partial.demo");
        let meta = DemonstrationMetaMessage {
            api_version: 1,
            number_steps: 5,
            ..Default::default()
        };
        let brain_params = BrainParametersMessage {
            action_spec: Some(ActionSpecMessage {
                num_continuous_actions: 1,
                discrete_branch_sizes: vec![],
            }),
            ..Default::default()
        };
        let pairs: Vec<_> = (0..3).map(|i| pair(i, false)).collect();
        write_demo(&path, &meta, &brain_params, &pairs)?;

        let demo = load_demonstration(&path, None)?;
        assert_eq!(demo.pairs[0], pairs);
        Ok(())
    }

    #[test]
    fn test_truncated_record_is_dropped() -> Result<()> {
        let dir = TempDir::new("demo")?;
        let path = dir.path().join("short.demo");
        write_fake_demo(&path, 6)?;
        let data = fs::read(&path)?;
        fs::write(&path, &data[..data.len() - 3])?;

        let demo = load_demonstration(&path, None)?;
        assert_eq!(demo.pairs[0].len(), 5);
        Ok(())
    }

    #[test]
    fn test_unsupported_version() -> Result<()> {
        let dir = TempDir::new("demo")?;
        let path = dir.path().join("v2.demo");
        let meta = DemonstrationMetaMessage {
            api_version: 2,
            ..Default::default()
        };
        write_demo(&path, &meta, &BrainParametersMessage::default(), &[])?;
        let err = load_demonstration(&path, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MlAgentsError>(),
            Some(MlAgentsError::UnsupportedDemoVersion(2))
        ));
        Ok(())
    }

    #[test]
    fn test_get_demo_files() -> Result<()> {
        let dir = TempDir::new("demo")?;
        let not_demo = dir.path().join("notes.txt");
        fs::write(&not_demo, b"")?;
        write_fake_demo(&dir.path().join("b.demo"), 4)?;
        write_fake_demo(&dir.path().join("a.demo"), 4)?;

        let files = get_demo_files(dir.path())?;
        assert_eq!(
            files,
            vec![dir.path().join("a.demo"), dir.path().join("b.demo")]
        );
        assert!(matches!(
            get_demo_files(&not_demo).unwrap_err().downcast_ref::<MlAgentsError>(),
            Some(MlAgentsError::InvalidDemoPath(_))
        ));
        assert!(matches!(
            get_demo_files(dir.path().join("missing")).unwrap_err().downcast_ref::<MlAgentsError>(),
            Some(MlAgentsError::DemoNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_spec_mismatch() -> Result<()> {
        let dir = TempDir::new("demo")?;
        let path = dir.path().join("test.demo");
        write_fake_demo(&path, 4)?;
        let expected = BehaviorSpec::new(
            vec![ObservationSpec::new(vec![3], "")],
            ActionSpec::create_continuous(1),
        );
        let err = demo_to_buffer(&path, 1, Some(&expected)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MlAgentsError>(),
            Some(MlAgentsError::DemoSpecMismatch(_))
        ));
        Ok(())
    }

    #[test_log::test]
    fn test_demo_manager_refresh() -> Result<()> {
        let dir = TempDir::new("demo")?;
        let mut manager = DemoManager::new(dir.path(), 1, Some(fake_spec()), 10)?;
        assert!(manager.demo_buffer().is_empty());
        assert_eq!(manager.refresh()?, 0);

        write_fake_demo(&dir.path().join("a.demo"), 8)?;
        assert_eq!(manager.refresh()?, 7);
        assert_eq!(manager.demo_buffer().num_experiences(), 7);
        // Already loaded files are skipped.
        assert_eq!(manager.refresh()?, 0);

        write_fake_demo(&dir.path().join("b.demo"), 8)?;
        assert_eq!(manager.refresh()?, 7);
        // 14 steps exceed the size of 10 and are cut to 8.
        assert_eq!(manager.demo_buffer().num_experiences(), 8);
        Ok(())
    }
}
