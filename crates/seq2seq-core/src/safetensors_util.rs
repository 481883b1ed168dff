use log::{debug, warn};
use memmap2::MmapOptions;
use safetensors::{Dtype, SafeTensors};
use std::fs::File;
use std::path::Path;
use tch::{nn, Kind, Tensor};

use crate::error::{Result, Seq2SeqError};

/// Copies every tensor of a safetensors checkpoint into the variable of the
/// same name. Returns how many variables were restored.
pub fn load_safetensors<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<usize> {
    let file = File::open(path.as_ref())?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();
    let mut restored = 0;

    for (name, view) in tensors.tensors() {
        let Some(var) = variables.get_mut(&name) else {
            warn!("Tensor {} found in checkpoint but not in model", name);
            continue;
        };

        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        let kind = match view.dtype() {
            Dtype::F32 => Kind::Float,
            Dtype::F64 => Kind::Double,
            Dtype::F16 => Kind::Half,
            Dtype::BF16 => Kind::BFloat16,
            Dtype::I64 => Kind::Int64,
            other => return Err(Seq2SeqError::UnsupportedDtype(format!("{:?}", other))),
        };

        if var.size() != shape {
            return Err(Seq2SeqError::CheckpointShape {
                name,
                expected: var.size(),
                found: shape,
            });
        }

        let value = Tensor::from_data_size(view.data(), &shape, kind).to_device(device);
        tch::no_grad(|| {
            var.copy_(&value);
        });
        debug!("Loaded tensor: {}", name);
        restored += 1;
    }

    if restored < variables.len() {
        warn!(
            "{} of {} model variables were not in {}",
            variables.len() - restored,
            variables.len(),
            path.as_ref().display()
        );
    }
    Ok(restored)
}
