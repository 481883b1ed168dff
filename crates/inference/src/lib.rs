use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tch::Device;
use tracing::{info, warn};

use seq2seq_core::{ModelConfig, Seq2SeqModel, Session, VocabularyInfo};

pub mod generator;

pub use generator::Responder;

/// Decoding settings that may differ from the ones the model was trained
/// with.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Overrides {
    pub beam_search: Option<bool>,
    pub beam_size: Option<i64>,
}

/// Rebuilds the inference graph of a checkpoint directory and loads its
/// newest weights.
pub fn load_model(dir: &Path, device: Device, overrides: &Overrides) -> Result<Session> {
    let config_path = dir.join("config.json");
    let config_str = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read model config.json at {:?}", config_path))?;
    let mut config: ModelConfig = serde_json::from_str(&config_str).context("Failed to parse model config.json")?;

    let vocab_path = dir.join("vocab.json");
    let vocab = VocabularyInfo::load(&vocab_path)
        .with_context(|| format!("Failed to read vocabulary at {:?}", vocab_path))?;

    config.test = true;
    if let Some(beam_search) = overrides.beam_search {
        config.beam_search = beam_search;
    }
    if let Some(beam_size) = overrides.beam_size {
        config.beam_size = beam_size;
    }

    let vs = tch::nn::VarStore::new(device);
    let model = Seq2SeqModel::new(&vs.root(), config, vocab)?;
    let mut session = Session::new(Arc::new(model), vs)?;

    match newest_checkpoint(dir)? {
        Some(path) => {
            let restored = session
                .load(&path)
                .context("Failed to load safetensors checkpoint")?;
            info!("Loaded {} tensors from {:?}", restored, path);
        }
        None => warn!("No .safetensors checkpoint found in {:?}. Using random weights.", dir),
    }

    Ok(session)
}

/// The `.safetensors` file with the highest step number in its name.
pub fn newest_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    let mut checkpoints: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "safetensors"))
        .map(|p| (checkpoint_step(&p), p))
        .collect();

    checkpoints.sort();
    Ok(checkpoints.pop().map(|(_, path)| path))
}

fn checkpoint_step(path: &Path) -> u64 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.rsplit('_').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
