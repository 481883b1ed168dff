use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use tch::Device;

use seq2seq_core::{ModelConfig, VocabularyInfo};
use trainer::{SampleDataset, Trainer, TrainerConfig};

#[derive(Parser)]
#[command(about = "Train the seq2seq chatbot on tokenized samples")]
struct Cli {
    /// JSON-lines file of tokenized samples.
    #[arg(short, long)]
    data: PathBuf,
    /// Vocabulary description; inferred from the data when absent.
    #[arg(long)]
    vocab: Option<PathBuf>,
    #[arg(long, default_value = "configs/model_config.yaml")]
    model_config: PathBuf,
    #[arg(long, default_value = "configs/training_config.yaml")]
    training_config: PathBuf,
    /// Checkpoint to continue training from.
    #[arg(long)]
    resume: Option<PathBuf>,
    #[arg(long)]
    cpu: bool,
}

fn read_yaml<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        info!("{} not found, using defaults", path.display());
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let model_config: ModelConfig = read_yaml(&cli.model_config)?;
    let trainer_config: TrainerConfig = read_yaml(&cli.training_config)?;

    let mut dataset = SampleDataset::load(&cli.data)?;
    let vocab = match &cli.vocab {
        Some(path) => VocabularyInfo::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => VocabularyInfo::new(dataset.vocab_size()),
    };
    info!("Loaded {} samples, vocabulary of {}", dataset.len(), vocab.size);

    let device = if cli.cpu { Device::Cpu } else { Device::cuda_if_available() };
    info!("Using device: {:?}", device);

    let mut trainer = Trainer::new(model_config, trainer_config, vocab, device)?;
    if let Some(path) = &cli.resume {
        trainer.restore(path)?;
    }

    trainer.train(&mut dataset)?;
    info!("Training complete after {} steps", trainer.global_step());

    Ok(())
}
