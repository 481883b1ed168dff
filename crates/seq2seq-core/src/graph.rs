//! Symbolic handles of the seq2seq graph.
//!
//! The model hands out these handles instead of tensors: a [`Placeholder`]
//! names an input slot to feed, a [`Fetch`] names a value an execution engine
//! should compute. Both are plain `Copy` values so a step can be prepared
//! without touching any parameter.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    EncoderInput,
    DecoderInput,
    DecoderTarget,
    DecoderWeight,
    DecoderContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Placeholder {
    pub slot: Slot,
    pub position: usize,
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{}]", self.slot, self.position)
    }
}

/// Every input slot of the graph, one per sequence position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    encoder_inputs: Vec<Placeholder>,
    decoder_inputs: Vec<Placeholder>,
    decoder_targets: Vec<Placeholder>,
    decoder_weights: Vec<Placeholder>,
    decoder_context: Option<Vec<Placeholder>>,
}

impl Placeholders {
    pub fn new(max_length_enco: usize, max_length_deco: usize, with_context: bool) -> Self {
        let slots = |slot, len| (0..len).map(|position| Placeholder { slot, position }).collect();
        Self {
            encoder_inputs: slots(Slot::EncoderInput, max_length_enco),
            decoder_inputs: slots(Slot::DecoderInput, max_length_deco),
            decoder_targets: slots(Slot::DecoderTarget, max_length_deco),
            decoder_weights: slots(Slot::DecoderWeight, max_length_deco),
            decoder_context: with_context.then(|| slots(Slot::DecoderContext, max_length_deco)),
        }
    }

    pub fn encoder_inputs(&self) -> &[Placeholder] {
        &self.encoder_inputs
    }

    pub fn decoder_inputs(&self) -> &[Placeholder] {
        &self.decoder_inputs
    }

    pub fn decoder_targets(&self) -> &[Placeholder] {
        &self.decoder_targets
    }

    pub fn decoder_weights(&self) -> &[Placeholder] {
        &self.decoder_weights
    }

    pub fn decoder_context(&self) -> Option<&[Placeholder]> {
        self.decoder_context.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fetch {
    /// Applies one optimizer update; yields nothing.
    OptimizerStep,
    /// Weighted sequence cross-entropy of the batch.
    Loss,
    /// Decoder output at `position`, passed through the output projection
    /// when `projected` is set.
    DecoderOutput { position: usize, projected: bool },
    /// Parent hypothesis of every beam entry, one row per position.
    BeamPath,
    /// Token chosen by every beam entry, one row per position.
    BeamSymbols,
    /// Cumulative log-probability of every beam entry, one row per position.
    BeamProbs,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossFunction {
    Softmax,
    SampledSoftmax { num_sampled: i64 },
}

/// Adam hyperparameters of the training graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamSpec {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl AdamSpec {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-08,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingGraph {
    pub loss: Fetch,
    pub optimizer_step: Fetch,
    pub loss_fn: LossFunction,
    pub optimizer: AdamSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceGraph {
    pub outputs: Vec<Fetch>,
}

/// The graph is built for exactly one mode and never switched afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Graph {
    Training(TrainingGraph),
    Inference(InferenceGraph),
}

impl Graph {
    pub fn contains(&self, fetch: &Fetch) -> bool {
        match self {
            Graph::Training(g) => *fetch == g.loss || *fetch == g.optimizer_step,
            Graph::Inference(g) => g.outputs.contains(fetch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_cover_every_position() {
        let placeholders = Placeholders::new(5, 7, false);
        assert_eq!(placeholders.encoder_inputs().len(), 5);
        assert_eq!(placeholders.decoder_inputs().len(), 7);
        assert_eq!(placeholders.decoder_targets().len(), 7);
        assert_eq!(placeholders.decoder_weights().len(), 7);
        assert!(placeholders.decoder_context().is_none());
        assert_eq!(placeholders.decoder_inputs()[3].position, 3);
    }

    #[test]
    fn context_slots_follow_the_decoder_length() {
        let placeholders = Placeholders::new(5, 7, true);
        let context = placeholders.decoder_context().unwrap();
        assert_eq!(context.len(), 7);
        assert!(context.iter().all(|p| p.slot == Slot::DecoderContext));
    }

    #[test]
    fn placeholder_display() {
        let p = Placeholder {
            slot: Slot::DecoderWeight,
            position: 2,
        };
        assert_eq!(p.to_string(), "DecoderWeight[2]");
    }
}
