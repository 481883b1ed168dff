use anyhow::{Context, Result};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tch::{nn, Device};

use seq2seq_core::{Batch, ExecutionEngine, Fetch, ModelConfig, Seq2SeqModel, Session, VocabularyInfo};

use crate::dataset::SampleDataset;
use crate::TrainerConfig;

/// Runs one optimizer update on `batch` and returns its loss.
pub fn train_step<E: ExecutionEngine>(model: &Seq2SeqModel, engine: &mut E, batch: &Batch) -> Result<f64> {
    let (fetches, feed) = model.step(batch, false);
    let results = engine.execute(&fetches, &feed)?;

    let loss_at = fetches
        .iter()
        .position(|f| *f == Fetch::Loss)
        .context("training graph has no loss fetch")?;
    results
        .get(loss_at)
        .and_then(|r| r.scalar())
        .context("engine returned no loss value")
}

/// Trains on every batch once, calling `after_step` with the engine and the
/// loss after each update. Returns the mean loss.
pub fn fit_epoch<E, F>(model: &Seq2SeqModel, engine: &mut E, batches: &[Batch], mut after_step: F) -> Result<f64>
where
    E: ExecutionEngine,
    F: FnMut(&mut E, f64) -> Result<()>,
{
    let mut total = 0.0;
    for batch in batches {
        let loss = train_step(model, engine, batch)?;
        total += loss;
        after_step(engine, loss)?;
    }
    Ok(if batches.is_empty() { 0.0 } else { total / batches.len() as f64 })
}

pub struct Trainer {
    config: TrainerConfig,
    model: Arc<Seq2SeqModel>,
    session: Session,
    global_step: usize,
}

impl Trainer {
    pub fn new(
        mut model_config: ModelConfig,
        trainer_config: TrainerConfig,
        vocab: VocabularyInfo,
        device: Device,
    ) -> Result<Self> {
        model_config.test = false;
        if let Some(lr) = trainer_config.learning_rate {
            model_config.learning_rate = lr;
        }

        let vs = nn::VarStore::new(device);
        let model = Arc::new(Seq2SeqModel::new(&vs.root(), model_config, vocab)?);
        let session = Session::new(Arc::clone(&model), vs)?;

        Ok(Self {
            config: trainer_config,
            model,
            session,
            global_step: 0,
        })
    }

    pub fn model(&self) -> &Seq2SeqModel {
        &self.model
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Continues from saved parameters.
    pub fn restore<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let restored = self
            .session
            .load(path)
            .with_context(|| format!("restoring {}", path.display()))?;
        info!("Restored {} tensors from {}", restored, path.display());
        Ok(())
    }

    pub fn train(&mut self, dataset: &mut SampleDataset) -> Result<()> {
        let dir = PathBuf::from(&self.config.checkpoint_dir);
        write_metadata(&dir, &self.model)?;

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!("Starting training with configuration: {:?}", self.config);
        info!("{} samples, model {:?}", dataset.len(), self.model.config());

        let model = Arc::clone(&self.model);
        for epoch in 0..self.config.epochs {
            let batches = dataset.batches(self.config.batch_size, model.config(), model.vocab(), &mut rng)?;

            let config = &self.config;
            let global_step = &mut self.global_step;
            let mean = fit_epoch(&model, &mut self.session, &batches, |session, loss| {
                *global_step += 1;
                if *global_step % config.log_every.max(1) == 0 {
                    info!("Epoch {} | Step {} | Loss: {:.4}", epoch + 1, global_step, loss);
                }
                if config.save_every > 0 && *global_step % config.save_every == 0 {
                    save_checkpoint(session, &dir, *global_step)?;
                }
                Ok(())
            })?;

            info!(
                "Epoch {}/{} average loss: {:.4} (perplexity {:.2})",
                epoch + 1,
                self.config.epochs,
                mean,
                mean.exp()
            );
        }

        save_checkpoint(&self.session, &dir, self.global_step)?;
        Ok(())
    }
}

/// Writes what is needed to rebuild the model next to its checkpoints.
fn write_metadata(dir: &Path, model: &Seq2SeqModel) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let config_json = serde_json::to_string_pretty(model.config())?;
    std::fs::write(dir.join("config.json"), config_json)?;
    model.vocab().save(dir.join("vocab.json"))?;
    Ok(())
}

fn save_checkpoint(session: &Session, dir: &Path, step: usize) -> Result<()> {
    let path = dir.join(format!("checkpoint_{}.safetensors", step));
    session
        .save(&path)
        .with_context(|| format!("saving {}", path.display()))?;
    info!("Saved checkpoint {}", path.display());
    Ok(())
}
