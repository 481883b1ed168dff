use serde::{Deserialize, Serialize};

use crate::config::{ModelConfig, CONTEXT_WIDTH};
use crate::error::{Result, Seq2SeqError};
use crate::vocab::VocabularyInfo;

/// One tokenized exchange: what was said and the answer to learn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub input: Vec<i64>,
    #[serde(default)]
    pub target: Vec<i64>,
    /// Summed food embedding of the meal the answer comments on.
    #[serde(default)]
    pub context: Option<Vec<f32>>,
}

/// A time-major batch: `encoder_seqs[t][b]` is the token of example `b` at
/// encoder position `t`. Every row holds `batch_size` entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub encoder_seqs: Vec<Vec<i64>>,
    pub decoder_seqs: Vec<Vec<i64>>,
    pub target_seqs: Vec<Vec<i64>>,
    pub weights: Vec<Vec<f32>>,
    /// Empty unless the corpus carries context vectors.
    pub context_seqs: Vec<Vec<Vec<f32>>>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.encoder_seqs
            .first()
            .or(self.decoder_seqs.first())
            .map_or(0, Vec::len)
    }

    /// Pads, reverses and transposes samples into the fixed-length layout the
    /// model placeholders expect.
    ///
    /// The encoder input is reversed and left-padded, keeping its last tokens
    /// when too long. The decoder input is `<go> target <eos>` right-padded
    /// and cut to `max_length_deco`; the target is the same sequence shifted
    /// by one, weighted 1.0 on real tokens and 0.0 on padding.
    pub fn from_samples(
        samples: &[Sample],
        config: &ModelConfig,
        vocab: &VocabularyInfo,
    ) -> Result<Self> {
        let enco_len = config.max_length_enco;
        let deco_len = config.max_length_deco;
        let with_context = config.corpus.enables_context();

        let mut encoder = Vec::with_capacity(samples.len());
        let mut decoder = Vec::with_capacity(samples.len());
        let mut targets = Vec::with_capacity(samples.len());
        let mut weights = Vec::with_capacity(samples.len());
        let mut contexts = Vec::with_capacity(samples.len());

        for (idx, sample) in samples.iter().enumerate() {
            let kept = &sample.input[sample.input.len().saturating_sub(enco_len)..];
            let mut enco = vec![vocab.pad; enco_len - kept.len()];
            enco.extend(kept.iter().rev());
            encoder.push(enco);

            let mut deco = Vec::with_capacity(deco_len + 1);
            deco.push(vocab.go);
            deco.extend_from_slice(&sample.target);
            deco.push(vocab.eos);
            deco.truncate(deco_len + 1);

            let mut target: Vec<i64> = deco[1..].to_vec();
            let real = target.len();
            target.resize(deco_len, vocab.pad);
            let mut weight = vec![1.0f32; real];
            weight.resize(deco_len, 0.0);

            deco.truncate(deco_len);
            deco.resize(deco_len, vocab.pad);

            decoder.push(deco);
            targets.push(target);
            weights.push(weight);

            if with_context {
                match &sample.context {
                    Some(ctx) if ctx.len() == CONTEXT_WIDTH => contexts.push(ctx.clone()),
                    _ => return Err(Seq2SeqError::MissingContext(idx, CONTEXT_WIDTH)),
                }
            }
        }

        let context_seqs = if with_context {
            (0..deco_len).map(|_| contexts.clone()).collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            encoder_seqs: transpose(&encoder, enco_len),
            decoder_seqs: transpose(&decoder, deco_len),
            target_seqs: transpose(&targets, deco_len),
            weights: transpose(&weights, deco_len),
            context_seqs,
        })
    }
}

fn transpose<T: Copy>(rows: &[Vec<T>], len: usize) -> Vec<Vec<T>> {
    (0..len)
        .map(|t| rows.iter().map(|row| row[t]).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorpusKind;

    fn config(enco: usize, deco: usize) -> ModelConfig {
        ModelConfig {
            max_length_enco: enco,
            max_length_deco: deco,
            ..Default::default()
        }
    }

    #[test]
    fn encoder_is_reversed_and_left_padded() {
        let vocab = VocabularyInfo::new(100);
        let samples = vec![Sample {
            input: vec![10, 11, 12],
            target: vec![20],
            context: None,
        }];
        let batch = Batch::from_samples(&samples, &config(5, 4), &vocab).unwrap();

        let column: Vec<i64> = batch.encoder_seqs.iter().map(|row| row[0]).collect();
        assert_eq!(column, vec![0, 0, 12, 11, 10]);
        assert_eq!(batch.batch_size(), 1);
    }

    #[test]
    fn long_input_keeps_its_tail() {
        let vocab = VocabularyInfo::new(100);
        let samples = vec![Sample {
            input: vec![10, 11, 12, 13],
            target: vec![],
            context: None,
        }];
        let batch = Batch::from_samples(&samples, &config(2, 3), &vocab).unwrap();
        let column: Vec<i64> = batch.encoder_seqs.iter().map(|row| row[0]).collect();
        assert_eq!(column, vec![13, 12]);
    }

    #[test]
    fn decoder_targets_are_shifted_and_weighted() {
        let vocab = VocabularyInfo::new(100);
        let samples = vec![Sample {
            input: vec![10],
            target: vec![20, 21],
            context: None,
        }];
        let batch = Batch::from_samples(&samples, &config(3, 6), &vocab).unwrap();

        let deco: Vec<i64> = batch.decoder_seqs.iter().map(|row| row[0]).collect();
        let target: Vec<i64> = batch.target_seqs.iter().map(|row| row[0]).collect();
        let weights: Vec<f32> = batch.weights.iter().map(|row| row[0]).collect();

        assert_eq!(deco, vec![1, 20, 21, 2, 0, 0]);
        assert_eq!(target, vec![20, 21, 2, 0, 0, 0]);
        assert_eq!(weights, vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn truncated_answer_fills_every_position() {
        let vocab = VocabularyInfo::new(100);
        let samples = vec![Sample {
            input: vec![10],
            target: vec![20, 21, 22, 23, 24],
            context: None,
        }];
        let batch = Batch::from_samples(&samples, &config(3, 4), &vocab).unwrap();

        let deco: Vec<i64> = batch.decoder_seqs.iter().map(|row| row[0]).collect();
        let target: Vec<i64> = batch.target_seqs.iter().map(|row| row[0]).collect();
        assert_eq!(deco, vec![1, 20, 21, 22]);
        assert_eq!(target, vec![20, 21, 22, 23]);
        assert!(batch.weights.iter().all(|row| row[0] == 1.0));
    }

    #[test]
    fn context_is_repeated_at_every_decoder_position() {
        let vocab = VocabularyInfo::new(100);
        let mut config = config(3, 4);
        config.corpus = CorpusKind::HealthyComments;

        let samples = vec![
            Sample {
                input: vec![10],
                target: vec![20],
                context: Some(vec![0.5; CONTEXT_WIDTH]),
            },
            Sample {
                input: vec![11],
                target: vec![21],
                context: Some(vec![1.5; CONTEXT_WIDTH]),
            },
        ];
        let batch = Batch::from_samples(&samples, &config, &vocab).unwrap();

        assert_eq!(batch.context_seqs.len(), 4);
        for row in &batch.context_seqs {
            assert_eq!(row.len(), 2);
            assert_eq!(row[1][0], 1.5);
        }
    }

    #[test]
    fn missing_context_is_an_error() {
        let vocab = VocabularyInfo::new(100);
        let mut config = config(3, 4);
        config.corpus = CorpusKind::HealthyComments;
        let samples = vec![Sample {
            input: vec![10],
            target: vec![20],
            context: Some(vec![0.0; 3]),
        }];
        assert!(matches!(
            Batch::from_samples(&samples, &config, &vocab),
            Err(Seq2SeqError::MissingContext(0, CONTEXT_WIDTH))
        ));
    }
}
