use serde::{Deserialize, Serialize};

use crate::error::{Result, Seq2SeqError};

/// Width of the per-position food context vector (a summed food embedding).
pub const CONTEXT_WIDTH: usize = 64;

/// Corpus the model is trained on. Only `healthy-comments` carries a food
/// context vector alongside each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CorpusKind {
    #[default]
    Cornell,
    Opensubs,
    Scotus,
    Ubuntu,
    Lightweight,
    Meals,
    HealthyComments,
}

impl CorpusKind {
    pub fn enables_context(self) -> bool {
        matches!(self, CorpusKind::HealthyComments)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Width of every LSTM layer.
    pub hidden_size: i64,
    /// Number of stacked LSTM layers in the encoder and in the decoder.
    pub num_layers: i64,
    /// Dimension of the word embeddings.
    pub embedding_size: i64,
    /// Fixed encoder sequence length (inputs are padded to it).
    pub max_length_enco: usize,
    /// Fixed decoder sequence length, `<go>` and `<eos>` included.
    pub max_length_deco: usize,
    /// Negative classes drawn per batch for sampled softmax. 0 disables it.
    pub softmax_samples: i64,
    pub learning_rate: f64,
    pub attention: bool,
    pub food_context: bool,
    pub beam_search: bool,
    pub beam_size: i64,
    /// Build the inference graph instead of the training graph.
    pub test: bool,
    /// Keep training without feeding fresh encoder inputs.
    pub finetune: bool,
    pub corpus: CorpusKind,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 512,
            num_layers: 2,
            embedding_size: 64,
            max_length_enco: 10,
            max_length_deco: 12,
            softmax_samples: 0,
            learning_rate: 0.002,
            attention: false,
            food_context: false,
            beam_search: false,
            beam_size: 5,
            test: false,
            finetune: false,
            corpus: CorpusKind::default(),
        }
    }
}

impl ModelConfig {
    /// Sampled softmax only makes sense when sampling fewer classes than the
    /// vocabulary holds; otherwise the full softmax is used.
    pub fn uses_sampled_softmax(&self, vocab_size: i64) -> bool {
        0 < self.softmax_samples && self.softmax_samples < vocab_size
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Seq2SeqError::InvalidConfig(msg.to_string()));

        if self.hidden_size <= 0 || self.embedding_size <= 0 {
            return invalid("hidden_size and embedding_size must be positive");
        }
        if self.num_layers <= 0 {
            return invalid("num_layers must be positive");
        }
        if self.max_length_enco == 0 || self.max_length_deco == 0 {
            return invalid("sequence lengths must be positive");
        }
        if self.softmax_samples < 0 {
            return invalid("softmax_samples cannot be negative");
        }
        if self.learning_rate <= 0.0 {
            return invalid("learning_rate must be positive");
        }
        if self.beam_search && self.beam_size <= 0 {
            return invalid("beam_size must be positive when beam search is enabled");
        }
        if self.food_context && !self.attention && !self.corpus.enables_context() {
            return invalid("food context decoding needs a corpus with context vectors");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampled_softmax_needs_fewer_samples_than_classes() {
        let mut config = ModelConfig::default();
        assert!(!config.uses_sampled_softmax(1000));

        config.softmax_samples = 512;
        assert!(config.uses_sampled_softmax(1000));
        assert!(!config.uses_sampled_softmax(512));
        assert!(!config.uses_sampled_softmax(100));
    }

    #[test]
    fn corpus_names_are_kebab_case() {
        let corpus: CorpusKind = serde_json::from_str("\"healthy-comments\"").unwrap();
        assert_eq!(corpus, CorpusKind::HealthyComments);
        assert!(corpus.enables_context());
        assert!(!CorpusKind::Meals.enables_context());
    }

    #[test]
    fn food_context_without_context_corpus_is_rejected() {
        let config = ModelConfig {
            food_context: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ModelConfig {
            food_context: true,
            corpus: CorpusKind::HealthyComments,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: ModelConfig = serde_json::from_str(r#"{"hidden_size": 128, "attention": true}"#).unwrap();
        assert_eq!(config.hidden_size, 128);
        assert!(config.attention);
        assert_eq!(config.num_layers, ModelConfig::default().num_layers);
    }
}
