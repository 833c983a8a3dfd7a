//! Utilities.
use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use log::trace;
use mlagents_core::{
    buffer::{AgentBuffer, AgentBufferField, BufferKey},
    error::MlAgentsError,
    policy::{NamedWeights, PolicyWeights},
    record::{Record, RecordValue},
    trajectory::ObsUtil,
};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::{Mutex, MutexGuard},
};

/// Name of the step counter stored next to the variables of a checkpoint.
const GLOBAL_STEP: &str = "global_step";

/// Small value added to avoid division by zero or log of zero.
pub const EPSILON: f64 = 1e-7;

fn lock(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    lock_data(varmap.data())
}

fn lock_data(data: &Mutex<HashMap<String, Var>>) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    data.lock().map_err(|_| anyhow!("VarMap lock is poisoned"))
}

/// Apply soft update on variables.
///
/// Variables are identified by their names.
///
/// dest = tau * src + (1.0 - tau) * dest
pub fn track(dest: &VarMap, src: &VarMap, tau: f64) -> Result<()> {
    trace!("track with tau = {}", tau);
    let dest = lock(dest)?;
    let src = lock(src)?;

    for (k_dest, v_dest) in dest.iter() {
        let v_src = src
            .get(k_dest)
            .ok_or_else(|| MlAgentsError::Config(format!("{} is missing in the source", k_dest)))?;
        let t_dest = ((tau * v_src.as_tensor())? + (1.0 - tau) * v_dest.as_tensor())?;
        v_dest.set(&t_dest)?;
    }

    Ok(())
}

/// Copies every variable of `src` into the variable of the same name in `dest`.
pub fn copy_vars(dest: &VarMap, src: &VarMap) -> Result<()> {
    track(dest, src, 1.0)
}

/// Snapshot of the variables of a [`VarMap`], sorted by name.
pub fn varmap_to_weights(varmap: &VarMap, step: u64) -> Result<PolicyWeights> {
    let data = lock(varmap)?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let weights = names
        .into_iter()
        .map(|name| {
            let t = data[name].as_tensor();
            Ok(NamedWeights {
                name: name.clone(),
                shape: t.dims().to_vec(),
                values: t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PolicyWeights { step, weights })
}

/// Writes a snapshot into the variables of a [`VarMap`].
///
/// Fails if a variable is missing from the snapshot or has a different shape.
pub fn load_weights_into_varmap(varmap: &VarMap, weights: &PolicyWeights) -> Result<()> {
    let data = lock(varmap)?;
    let by_name: HashMap<&str, &NamedWeights> = weights
        .weights
        .iter()
        .map(|w| (w.name.as_str(), w))
        .collect();

    for (name, var) in data.iter() {
        let w = by_name.get(name.as_str()).ok_or_else(|| {
            MlAgentsError::Config(format!("the weights have no parameter {}", name))
        })?;
        if w.shape != var.dims() {
            return Err(MlAgentsError::Config(format!(
                "the parameter {} has shape {:?}, the weights have {:?}",
                name,
                var.dims(),
                w.shape
            ))
            .into());
        }
        let t = Tensor::from_vec(w.values.clone(), w.shape.as_slice(), var.device())?;
        var.set(&t)?;
    }
    Ok(())
}

/// Saves the variables of a [`VarMap`] and a step counter in safetensors format.
pub fn save_varmap(varmap: &VarMap, step: u64, path: impl AsRef<Path>) -> Result<()> {
    let data = lock(varmap)?;
    let mut tensors: HashMap<String, Tensor> = data
        .iter()
        .map(|(k, v)| (k.clone(), v.as_tensor().clone()))
        .collect();
    tensors.insert(
        GLOBAL_STEP.to_string(),
        Tensor::new(&[step as i64], &Device::Cpu)?,
    );
    candle_core::safetensors::save(&tensors, path.as_ref())?;
    trace!("Saved {} variables to {:?}", data.len(), path.as_ref());
    Ok(())
}

/// Loads variables saved by [`save_varmap`] and returns the saved step.
///
/// Every variable of `varmap` must be in the file with the same shape.
pub fn load_varmap(varmap: &VarMap, path: impl AsRef<Path>) -> Result<u64> {
    let data = lock(varmap)?;
    let tensors = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)?;
    for (name, var) in data.iter() {
        let t = tensors.get(name).ok_or_else(|| {
            MlAgentsError::Config(format!("{:?} has no parameter {}", path.as_ref(), name))
        })?;
        if t.dims() != var.dims() {
            return Err(MlAgentsError::Config(format!(
                "the parameter {} has shape {:?}, the file has {:?}",
                name,
                var.dims(),
                t.dims()
            ))
            .into());
        }
        var.set(&t.to_device(var.device())?.to_dtype(var.dtype())?)?;
    }
    let step = match tensors.get(GLOBAL_STEP) {
        Some(t) => t.to_vec1::<i64>()?.first().copied().unwrap_or(0) as u64,
        None => 0,
    };
    Ok(step)
}

/// Stacks rows of equal length into a `[n, d]` tensor.
pub fn rows_to_tensor(rows: &[Vec<f32>], device: &Device) -> Result<Tensor> {
    let d = rows.first().map_or(0, |r| r.len());
    if let Some(row) = rows.iter().find(|r| r.len() != d) {
        return Err(MlAgentsError::Config(format!(
            "rows of length {} and {} can not be stacked",
            d,
            row.len()
        ))
        .into());
    }
    let values: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(values, (rows.len(), d), device)?)
}

/// A `[n]` tensor.
pub fn vec_to_tensor(values: &[f32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(values, (values.len(),), device)?)
}

/// A buffer field as a `[n, d]` tensor.
pub fn field_to_tensor(field: &AgentBufferField, device: &Device) -> Result<Tensor> {
    rows_to_tensor(field.rows(), device)
}

/// A scalar buffer field as a `[n]` tensor.
pub fn scalars_to_tensor(buffer: &AgentBuffer, key: &BufferKey, device: &Device) -> Result<Tensor> {
    vec_to_tensor(&buffer.field(key)?.scalars(), device)
}

/// The observations of a buffer, one `[n, d]` tensor per observation.
pub fn obs_to_tensors(buffer: &AgentBuffer, num_obs: usize, device: &Device) -> Result<Vec<Tensor>> {
    ObsUtil::from_buffer(buffer, num_obs)?
        .into_iter()
        .map(|f| field_to_tensor(f, device))
        .collect()
}

/// The next observations of a buffer, one `[n, d]` tensor per observation.
pub fn next_obs_to_tensors(
    buffer: &AgentBuffer,
    num_obs: usize,
    device: &Device,
) -> Result<Vec<Tensor>> {
    ObsUtil::from_buffer_next(buffer, num_obs)?
        .into_iter()
        .map(|f| field_to_tensor(f, device))
        .collect()
}

/// The rows at the start of each sequence, as a `[n / sequence_length, d]` tensor.
///
/// Used to pick the initial memories of the sequences of a batch.
pub fn sequence_starts(
    field: &AgentBufferField,
    sequence_length: usize,
    device: &Device,
) -> Result<Tensor> {
    sequence_rows(field, sequence_length, 0, device)
}

/// The row `offset` steps into each sequence, the last row of the sequence
/// if the sequence is shorter.
pub fn sequence_rows(
    field: &AgentBufferField,
    sequence_length: usize,
    offset: usize,
    device: &Device,
) -> Result<Tensor> {
    let t = sequence_length.max(1);
    let rows: Vec<Vec<f32>> = (0..field.len())
        .step_by(t)
        .filter_map(|start| {
            let end = (start + t).min(field.len());
            field.get((start + offset).min(end - 1)).cloned()
        })
        .collect();
    rows_to_tensor(&rows, device)
}

/// Mean of `x` over the steps where `masks` is one.
///
/// `x` is `[n]` or `[n, k]`, `masks` is `[n]`. The sum of the kept values is
/// divided by the number of kept values, at least one.
pub fn masked_mean(x: &Tensor, masks: &Tensor) -> Result<Tensor> {
    let (masked, k) = match x.rank() {
        1 => ((x * masks)?, 1),
        _ => (x.broadcast_mul(&masks.unsqueeze(1)?)?, x.dim(1)?),
    };
    let n = (masks.sum_all()?.to_scalar::<f32>()? * k as f32).max(1.0);
    Ok((masked.sum_all()? / n as f64)?)
}

/// The value of a single element tensor.
pub fn to_scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?[0])
}

/// The rows of a `[n, d]` tensor.
pub fn tensor_to_rows(t: &Tensor) -> Result<Vec<Vec<f32>>> {
    Ok(t.to_dtype(DType::F32)?.to_vec2::<f32>()?)
}

/// Mean over a list of `[n]` tensors.
pub fn mean_of(tensors: &[Tensor]) -> Result<Tensor> {
    Ok(Tensor::stack(tensors, 0)?.mean(0)?)
}

/// Mean of every scalar over the records of several updates.
pub fn mean_records(records: &[Record]) -> Record {
    let mut sums: BTreeMap<String, (f32, usize)> = BTreeMap::new();
    for record in records {
        for (k, v) in record.iter() {
            if let RecordValue::Scalar(v) = v {
                let e = sums.entry(k.clone()).or_insert((0.0, 0));
                e.0 += v;
                e.1 += 1;
            }
        }
    }
    let mut mean = Record::empty();
    for (k, (sum, n)) in sums {
        mean.insert(k, RecordValue::Scalar(sum / n as f32));
    }
    mean
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_nn::Init;

    fn varmap_with(values: &[f32]) -> Result<VarMap> {
        let vm = VarMap::new();
        let init = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        let t = vm.get((values.len(),), "var1", init, DType::F32, &Device::Cpu)?;
        Var::from_tensor(&t)?.set(&Tensor::from_slice(values, (values.len(),), &Device::Cpu)?)?;
        Ok(vm)
    }

    fn values(vm: &VarMap) -> Result<Vec<f32>> {
        Ok(lock(vm)?["var1"].as_tensor().to_vec1::<f32>()?)
    }

    #[test]
    fn test_track() -> Result<()> {
        let vm_src = varmap_with(&[1.0, 2.0, 3.0])?;
        let vm_dest = varmap_with(&[4.0, 5.0, 6.0])?;
        track(&vm_dest, &vm_src, 0.5)?;

        let expected = [2.5f32, 3.5, 4.5];
        for (a, b) in values(&vm_dest)?.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_weights_snapshot() -> Result<()> {
        let vm_src = varmap_with(&[1.0, 2.0, 3.0])?;
        let weights = varmap_to_weights(&vm_src, 7)?;
        assert_eq!(weights.step, 7);
        assert_eq!(weights.weights[0].shape, vec![3]);

        let vm_dest = varmap_with(&[0.0, 0.0, 0.0])?;
        load_weights_into_varmap(&vm_dest, &weights)?;
        assert_eq!(values(&vm_dest)?, vec![1.0, 2.0, 3.0]);

        let vm_other = varmap_with(&[0.0, 0.0])?;
        assert!(load_weights_into_varmap(&vm_other, &weights).is_err());
        Ok(())
    }

    #[test]
    fn test_save_and_load_varmap() -> Result<()> {
        let dir = tempdir::TempDir::new("varmap")?;
        let path = dir.path().join("model.safetensors");
        save_varmap(&varmap_with(&[1.0, 2.0, 3.0])?, 42, &path)?;

        let vm = varmap_with(&[0.0, 0.0, 0.0])?;
        assert_eq!(load_varmap(&vm, &path)?, 42);
        assert_eq!(values(&vm)?, vec![1.0, 2.0, 3.0]);
        assert!(load_varmap(&varmap_with(&[0.0])?, &path).is_err());
        Ok(())
    }

    #[test]
    fn test_masked_mean() -> Result<()> {
        let x = Tensor::new(&[1f32, 2., 3., 4.], &Device::Cpu)?;
        let masks = Tensor::new(&[1f32, 1., 0., 0.], &Device::Cpu)?;
        assert!((to_scalar(&masked_mean(&x, &masks)?)? - 1.5).abs() < 1e-6);

        let x = Tensor::new(&[[1f32, 3.], [2., 2.]], &Device::Cpu)?;
        let masks = Tensor::new(&[1f32, 0.], &Device::Cpu)?;
        assert!((to_scalar(&masked_mean(&x, &masks)?)? - 2.0).abs() < 1e-6);

        let zeros = Tensor::zeros(2, DType::F32, &Device::Cpu)?;
        assert_eq!(to_scalar(&masked_mean(&masks, &zeros)?)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_mean_records() -> Result<()> {
        let records = vec![
            Record::from_scalar("loss", 1.0),
            Record::from_scalar("loss", 3.0).merge(Record::from_scalar("lr", 0.1)),
        ];
        let mean = mean_records(&records);
        assert_eq!(mean.get_scalar("loss")?, 2.0);
        assert_eq!(mean.get_scalar("lr")?, 0.1);
        assert!(mean_records(&[]).is_empty());
        Ok(())
    }

    #[test]
    fn test_sequence_starts() -> Result<()> {
        let field: AgentBufferField = (0..6).map(|i| vec![i as f32, 0.0]).collect::<Vec<_>>().into();
        let starts = sequence_starts(&field, 3, &Device::Cpu)?;
        assert_eq!(tensor_to_rows(&starts)?, vec![vec![0.0, 0.0], vec![3.0, 0.0]]);
        let next = sequence_rows(&field, 3, 1, &Device::Cpu)?;
        assert_eq!(tensor_to_rows(&next)?, vec![vec![1.0, 0.0], vec![4.0, 0.0]]);
        assert!(rows_to_tensor(&[vec![1.0], vec![1.0, 2.0]], &Device::Cpu).is_err());
        Ok(())
    }
}
