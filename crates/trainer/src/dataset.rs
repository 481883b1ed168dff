use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use seq2seq_core::{Batch, ModelConfig, Sample, VocabularyInfo};

/// Tokenized training samples, one JSON object per line:
/// `{"input": [..], "target": [..], "context": [..]?}`.
pub struct SampleDataset {
    samples: Vec<Sample>,
}

impl SampleDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening dataset {}", path.display()))?;

        let mut samples = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let sample: Sample = serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: malformed sample", path.display(), idx + 1))?;
            samples.push(sample);
        }

        if samples.is_empty() {
            bail!("dataset {} holds no sample", path.display());
        }
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Smallest vocabulary covering every id of the dataset and the
    /// reserved tokens.
    pub fn vocab_size(&self) -> i64 {
        let reserved = VocabularyInfo::new(0).unknown + 1;
        self.samples
            .iter()
            .flat_map(|s| s.input.iter().chain(&s.target))
            .map(|&id| id + 1)
            .fold(reserved, i64::max)
    }

    /// Shuffles the samples and cuts them into batches. The last batch may
    /// be smaller.
    pub fn batches<R: Rng>(
        &mut self,
        batch_size: usize,
        config: &ModelConfig,
        vocab: &VocabularyInfo,
        rng: &mut R,
    ) -> Result<Vec<Batch>> {
        if batch_size == 0 {
            bail!("batch_size must be positive");
        }
        self.samples.shuffle(rng);
        self.samples
            .chunks(batch_size)
            .map(|chunk| Batch::from_samples(chunk, config, vocab).map_err(Into::into))
            .collect()
    }
}
