use log::debug;
use std::path::Path;
use std::sync::Arc;
use tch::{nn, nn::OptimizerConfig, Device, Tensor};

use crate::config::CONTEXT_WIDTH;
use crate::decoder::{DecoderInputs, DecoderRun, DecoderStrategy, Feeding};
use crate::engine::{ExecutionEngine, FeedDict, FeedValue, Fetched};
use crate::error::{Result, Seq2SeqError};
use crate::graph::{Fetch, Graph, LossFunction, Placeholder, TrainingGraph};
use crate::loss::{sequence_loss, softmax_cross_entropy, SampledSoftmax};
use crate::model::Seq2SeqModel;
use crate::safetensors_util;

/// Executes a model's fetches with libtorch, owning its parameters and,
/// for training graphs, its optimizer.
pub struct Session {
    model: Arc<Seq2SeqModel>,
    vs: nn::VarStore,
    optimizer: Option<nn::Optimizer>,
    sampled_softmax: Option<SampledSoftmax>,
}

/// Feed converted to tensors, indexed by position.
struct StepTensors {
    encoder: Vec<Tensor>,
    decoder: Vec<Option<Tensor>>,
    targets: Vec<Option<Tensor>>,
    weights: Vec<Option<Tensor>>,
    context: Option<Vec<Tensor>>,
}

impl Session {
    /// `vs` must be the store the model was built from.
    pub fn new(model: Arc<Seq2SeqModel>, vs: nn::VarStore) -> Result<Self> {
        let (optimizer, sampled_softmax) = match model.graph() {
            Graph::Training(graph) => {
                let spec = graph.optimizer;
                let optimizer = nn::Adam {
                    beta1: spec.beta1,
                    beta2: spec.beta2,
                    wd: 0.0,
                    eps: spec.eps,
                    amsgrad: false,
                }
                .build(&vs, spec.learning_rate)?;

                let sampled_softmax = match graph.loss_fn {
                    LossFunction::SampledSoftmax { num_sampled } => model
                        .network()
                        .projection()
                        .map(|p| SampledSoftmax::new(p.shallow_clone(), num_sampled, model.vocab().size)),
                    LossFunction::Softmax => None,
                };
                (Some(optimizer), sampled_softmax)
            }
            Graph::Inference(_) => (None, None),
        };

        Ok(Self {
            model,
            vs,
            optimizer,
            sampled_softmax,
        })
    }

    pub fn model(&self) -> &Arc<Seq2SeqModel> {
        &self.model
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// Writes every parameter; a `.safetensors` extension selects that format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.vs.save(path)?;
        Ok(())
    }

    /// Loads parameters from a safetensors checkpoint, returning how many
    /// tensors matched a model parameter.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        safetensors_util::load_safetensors(&mut self.vs, path)
    }

    fn resolve(&self, feed: &FeedDict) -> Result<StepTensors> {
        let device = self.device();
        let placeholders = self.model.placeholders();

        let first = placeholders.decoder_inputs()[0];
        let batch_size = feed.get(&first).ok_or(Seq2SeqError::MissingFeed(first))?.batch_size();

        for (placeholder, value) in feed.iter() {
            if value.batch_size() != batch_size {
                return Err(Seq2SeqError::BatchShape(format!(
                    "{} holds {} examples, {} holds {}",
                    first,
                    batch_size,
                    placeholder,
                    value.batch_size()
                )));
            }
        }

        // Unfed encoder slots (finetuning) read as padding.
        let pad = vec![self.model.vocab().pad; batch_size];
        let encoder = placeholders
            .encoder_inputs()
            .iter()
            .map(|p| match feed.get(p) {
                Some(value) => tokens(p, value, device),
                None => Ok(Tensor::from_slice(&pad).to_device(device)),
            })
            .collect::<Result<Vec<_>>>()?;

        let optional = |slots: &[Placeholder], convert: fn(&Placeholder, &FeedValue, Device) -> Result<Tensor>| {
            slots
                .iter()
                .map(|p| feed.get(p).map(|value| convert(p, value, device)).transpose())
                .collect::<Result<Vec<_>>>()
        };
        let decoder = optional(placeholders.decoder_inputs(), tokens)?;
        let targets = optional(placeholders.decoder_targets(), tokens)?;
        let weights = optional(placeholders.decoder_weights(), weights)?;

        let context = match placeholders.decoder_context() {
            Some(slots) if self.model.strategy() == DecoderStrategy::FoodContext => Some(
                slots
                    .iter()
                    .map(|p| {
                        let value = feed.get(p).ok_or(Seq2SeqError::MissingFeed(*p))?;
                        context(p, value, device)
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            _ => None,
        };

        Ok(StepTensors {
            encoder,
            decoder,
            targets,
            weights,
            context,
        })
    }

    fn run_training(&mut self, graph: &TrainingGraph, fetches: &[Fetch], inputs: &StepTensors) -> Result<Vec<Fetched>> {
        let update = fetches.contains(&graph.optimizer_step);
        let loss = if update {
            self.compute_loss(graph.loss_fn, inputs)?
        } else {
            tch::no_grad(|| self.compute_loss(graph.loss_fn, inputs))?
        };

        if update {
            if let Some(optimizer) = self.optimizer.as_mut() {
                optimizer.backward_step(&loss);
            }
        }
        let loss_value = loss.double_value(&[]);
        debug!("step loss {:.4} (update: {})", loss_value, update);

        fetches
            .iter()
            .map(|fetch| match fetch {
                Fetch::OptimizerStep => Ok(Fetched::Done),
                Fetch::Loss => Ok(Fetched::Scalar(loss_value)),
                other => Err(Seq2SeqError::UnknownFetch(*other)),
            })
            .collect()
    }

    fn compute_loss(&self, loss_fn: LossFunction, inputs: &StepTensors) -> Result<Tensor> {
        let placeholders = self.model.placeholders();
        let targets = required(&inputs.targets, placeholders.decoder_targets())?;
        let weights = required(&inputs.weights, placeholders.decoder_weights())?;

        let run = self.forward(inputs, Feeding::Forced)?;

        let loss = match (loss_fn, self.sampled_softmax.as_ref()) {
            (LossFunction::SampledSoftmax { .. }, Some(sampled)) => {
                sequence_loss(&run.hidden, &targets, &weights, |x, labels| sampled.loss(labels, x))
            }
            _ => {
                let logits = self.vocab_logits(run)?;
                sequence_loss(&logits, &targets, &weights, softmax_cross_entropy)
            }
        };
        Ok(loss)
    }

    fn vocab_logits(&self, run: DecoderRun) -> Result<Vec<Tensor>> {
        if self.model.strategy().emits_vocab_space() {
            return Ok(run.outputs);
        }
        let projection = self.projection()?;
        Ok(run.hidden.iter().map(|h| projection.apply(h)).collect())
    }

    fn projection(&self) -> Result<&crate::projection::OutputProjection> {
        self.model.network().projection().ok_or_else(|| {
            Seq2SeqError::InvalidConfig(format!(
                "{:?} decoder outputs need an output projection",
                self.model.strategy()
            ))
        })
    }

    fn forward(&self, inputs: &StepTensors, feeding: Feeding) -> Result<DecoderRun> {
        let decoder_inputs = DecoderInputs {
            tokens: &inputs.decoder,
            context: inputs.context.as_deref(),
        };
        self.model.network().forward(&inputs.encoder, &decoder_inputs, feeding)
    }

    fn run_inference(&self, fetches: &[Fetch], inputs: &StepTensors) -> Result<Vec<Fetched>> {
        tch::no_grad(|| {
            let run = self.forward(inputs, self.model.feeding())?;

            fetches
                .iter()
                .map(|fetch| match *fetch {
                    Fetch::DecoderOutput { position, projected } => {
                        let out = run.outputs.get(position).ok_or(Seq2SeqError::UnknownFetch(*fetch))?;
                        let out = if projected {
                            self.projection()?.apply(out)
                        } else {
                            out.shallow_clone()
                        };
                        Ok(Fetched::Tensor(out))
                    }
                    Fetch::BeamPath | Fetch::BeamSymbols | Fetch::BeamProbs => {
                        let trace = run.beam.as_ref().ok_or(Seq2SeqError::UnknownFetch(*fetch))?;
                        let t = match fetch {
                            Fetch::BeamPath => &trace.path,
                            Fetch::BeamSymbols => &trace.symbols,
                            _ => &trace.probs,
                        };
                        Ok(Fetched::Tensor(t.shallow_clone()))
                    }
                    Fetch::Loss | Fetch::OptimizerStep => Err(Seq2SeqError::UnknownFetch(*fetch)),
                })
                .collect()
        })
    }
}

impl ExecutionEngine for Session {
    fn execute(&mut self, fetches: &[Fetch], feed: &FeedDict) -> Result<Vec<Fetched>> {
        let model = Arc::clone(&self.model);
        if let Some(fetch) = fetches.iter().find(|f| !model.graph().contains(f)) {
            return Err(Seq2SeqError::UnknownFetch(*fetch));
        }

        let inputs = self.resolve(feed)?;
        match model.graph() {
            Graph::Training(graph) => self.run_training(graph, fetches, &inputs),
            Graph::Inference(_) => self.run_inference(fetches, &inputs),
        }
    }
}

unsafe impl Send for Session {}

fn mismatch(p: &Placeholder, expected: &'static str, value: &FeedValue) -> Seq2SeqError {
    Seq2SeqError::FeedMismatch {
        placeholder: *p,
        expected,
        found: value.kind(),
    }
}

fn tokens(p: &Placeholder, value: &FeedValue, device: Device) -> Result<Tensor> {
    match value {
        FeedValue::Tokens(ids) => Ok(Tensor::from_slice(ids).to_device(device)),
        other => Err(mismatch(p, "tokens", other)),
    }
}

fn weights(p: &Placeholder, value: &FeedValue, device: Device) -> Result<Tensor> {
    match value {
        FeedValue::Weights(w) => Ok(Tensor::from_slice(w).to_device(device)),
        other => Err(mismatch(p, "weights", other)),
    }
}

fn context(p: &Placeholder, value: &FeedValue, device: Device) -> Result<Tensor> {
    match value {
        FeedValue::Context(rows) => {
            if let Some(row) = rows.iter().find(|row| row.len() != CONTEXT_WIDTH) {
                return Err(Seq2SeqError::BatchShape(format!(
                    "{} holds a context of width {}, expected {}",
                    p,
                    row.len(),
                    CONTEXT_WIDTH
                )));
            }
            let flat: Vec<f32> = rows.concat();
            Ok(Tensor::from_slice(&flat)
                .view([rows.len() as i64, CONTEXT_WIDTH as i64])
                .to_device(device))
        }
        other => Err(mismatch(p, "context", other)),
    }
}

fn required(values: &[Option<Tensor>], slots: &[Placeholder]) -> Result<Vec<Tensor>> {
    values
        .iter()
        .zip(slots)
        .map(|(value, p)| {
            value
                .as_ref()
                .map(Tensor::shallow_clone)
                .ok_or(Seq2SeqError::MissingFeed(*p))
        })
        .collect()
}
