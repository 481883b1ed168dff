use anyhow::{Context, Result};
use tch::Tensor;

use seq2seq_core::beam::{backtrack, rows};
use seq2seq_core::{Batch, ExecutionEngine, Fetch, Fetched, Sample, Session};

/// Answers one tokenized sentence at a time.
pub struct Responder {
    session: Session,
}

impl Responder {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Predicts the answer to `tokens`, without the `<eos>` token.
    pub fn reply(&mut self, tokens: &[i64], context: Option<Vec<f32>>) -> Result<Vec<i64>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let model = std::sync::Arc::clone(self.session.model());
        let sample = Sample {
            input: tokens.to_vec(),
            target: Vec::new(),
            context,
        };
        let batch = Batch::from_samples(&[sample], model.config(), model.vocab())?;

        let (fetches, feed) = model.step(&batch, false);
        let results = self.session.execute(&fetches, &feed)?;
        let eos = model.vocab().eos;

        if model.config().beam_search {
            decode_beam(&fetches, &results, eos)
        } else {
            decode_greedy(&fetches, &results, eos)
        }
    }
}

/// Takes the most likely token at every position until `<eos>`.
fn decode_greedy(fetches: &[Fetch], results: &[Fetched], eos: i64) -> Result<Vec<i64>> {
    let mut answer = Vec::with_capacity(fetches.len());
    for (fetch, result) in fetches.iter().zip(results) {
        if !matches!(fetch, Fetch::DecoderOutput { .. }) {
            continue;
        }
        let logits = result.tensor().context("decoder output is not a tensor")?;
        let token = logits.argmax(-1, false).int64_value(&[0]);
        if token == eos {
            break;
        }
        answer.push(token);
    }
    Ok(answer)
}

fn decode_beam(fetches: &[Fetch], results: &[Fetched], eos: i64) -> Result<Vec<i64>> {
    let trace = |wanted: Fetch| -> Result<&Tensor> {
        fetches
            .iter()
            .zip(results)
            .find(|(fetch, _)| **fetch == wanted)
            .and_then(|(_, result)| result.tensor())
            .with_context(|| format!("missing {:?}", wanted))
    };

    let path = rows::<i64>(trace(Fetch::BeamPath)?)?;
    let symbols = rows::<i64>(trace(Fetch::BeamSymbols)?)?;
    let probs = rows::<f32>(trace(Fetch::BeamProbs)?)?;
    Ok(backtrack(&path, &symbols, &probs, eos))
}
