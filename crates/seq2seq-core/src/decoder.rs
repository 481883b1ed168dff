//! Encoder and the three decoding strategies.

use log::warn;
use tch::{nn, Tensor};

use crate::attention::Attention;
use crate::beam::{BeamSearch, BeamTrace};
use crate::cell::{CellSpec, CellState, StackedLstm};
use crate::config::ModelConfig;
use crate::error::{Result, Seq2SeqError};
use crate::graph::{Placeholder, Slot};
use crate::projection::OutputProjection;

/// Which sequence decoder the graph uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderStrategy {
    /// Embedding decoder conditioned on the final encoder state only.
    Plain,
    /// Attention over the encoder outputs at every step.
    Attention,
    /// Attention plus the food context vector fed at every step.
    FoodContext,
}

impl DecoderStrategy {
    /// Attention takes priority over food context, which takes priority over
    /// the plain decoder.
    pub fn select(config: &ModelConfig) -> Self {
        if config.attention {
            if config.food_context {
                warn!("Both attention and food context are enabled: food context is ignored");
            }
            DecoderStrategy::Attention
        } else if config.food_context {
            DecoderStrategy::FoodContext
        } else {
            DecoderStrategy::Plain
        }
    }

    /// Whether the decoder outputs are already logits over the vocabulary.
    /// When not, they are hidden-size vectors that go through the shared
    /// output projection.
    pub fn emits_vocab_space(self) -> bool {
        matches!(self, DecoderStrategy::Plain)
    }
}

/// How the decoder gets its input after the first position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feeding {
    /// Ground-truth decoder inputs at every position.
    Forced,
    /// Argmax of the previous output.
    Previous,
    /// Best `size` continuations of every hypothesis.
    Beam { size: i64 },
}

impl Feeding {
    pub fn from_config(config: &ModelConfig) -> Self {
        match (config.test, config.beam_search) {
            (false, _) => Feeding::Forced,
            (true, false) => Feeding::Previous,
            (true, true) => Feeding::Beam {
                size: config.beam_size,
            },
        }
    }
}

/// Decoder side tensors of one step, indexed by position.
pub struct DecoderInputs<'a> {
    pub tokens: &'a [Option<Tensor>],
    pub context: Option<&'a [Tensor]>,
}

/// Result of unrolling the decoder.
#[derive(Debug)]
pub struct DecoderRun {
    /// Top layer output of every position, before any vocabulary head.
    pub hidden: Vec<Tensor>,
    /// What the decoder exposes: logits for vocabulary-space decoders,
    /// the hidden outputs otherwise.
    pub outputs: Vec<Tensor>,
    pub beam: Option<BeamTrace>,
}

/// Embeds the encoder inputs and runs them through its own stacked cell.
#[derive(Debug)]
pub struct Encoder {
    embedding: nn::Embedding,
    cell: StackedLstm,
}

impl Encoder {
    pub fn new(vs: &nn::Path, spec: CellSpec, vocab_size: i64, embedding_size: i64) -> Self {
        let embedding = nn::embedding(vs / "embedding", vocab_size, embedding_size, Default::default());
        let cell = StackedLstm::new(&(vs / "rnn"), spec, embedding_size);
        Self { embedding, cell }
    }

    /// inputs: one [batch] id tensor per position.
    /// Returns the outputs [batch, enc_len, hidden] and the final state.
    pub fn forward(&self, inputs: &[Tensor]) -> (Tensor, CellState) {
        let first = &inputs[0];
        let mut state = self.cell.zero_state(first.size()[0], &self.embedding.ws);
        let mut outputs = Vec::with_capacity(inputs.len());

        for ids in inputs {
            let (out, next) = self.cell.step(&ids.apply(&self.embedding), state);
            outputs.push(out);
            state = next;
        }

        (Tensor::stack(&outputs, 1), state)
    }
}

/// Vocabulary head of the plain decoder.
#[derive(Debug)]
pub enum VocabHead {
    /// The output projection shared with the sampled softmax loss.
    Shared(OutputProjection),
    Own(nn::Linear),
}

impl VocabHead {
    pub fn apply(&self, x: &Tensor) -> Tensor {
        match self {
            VocabHead::Shared(projection) => projection.apply(x),
            VocabHead::Own(linear) => x.apply(linear),
        }
    }
}

/// Picks the decoder input id of every position.
struct TokenFeeder<'a> {
    tokens: &'a [Option<Tensor>],
    feeding: Feeding,
    beam: Option<BeamSearch>,
}

impl<'a> TokenFeeder<'a> {
    fn new(tokens: &'a [Option<Tensor>], feeding: Feeding) -> Self {
        Self {
            tokens,
            feeding,
            beam: None,
        }
    }

    fn fed(&self, position: usize) -> Result<Tensor> {
        self.tokens
            .get(position)
            .and_then(Option::as_ref)
            .map(Tensor::shallow_clone)
            .ok_or(Seq2SeqError::MissingFeed(Placeholder {
                slot: Slot::DecoderInput,
                position,
            }))
    }

    /// Ids of position 0. With beam search the single example is repeated
    /// once per hypothesis.
    fn first(&mut self) -> Result<Tensor> {
        let ids = self.fed(0)?;
        match self.feeding {
            Feeding::Beam { size } => {
                let batch = ids.size()[0];
                if batch != 1 {
                    return Err(Seq2SeqError::BeamBatch(batch));
                }
                self.beam = Some(BeamSearch::new(size, &ids));
                Ok(ids.repeat(&[size]))
            }
            _ => Ok(ids),
        }
    }

    fn rows(&self) -> Option<i64> {
        self.beam.as_ref().map(BeamSearch::size)
    }

    /// Ids of `position`, given the vocabulary logits of the previous one.
    /// With beam search also returns which rows the state must be rebuilt
    /// from.
    fn next<F>(&mut self, position: usize, logits: F) -> Result<(Tensor, Option<Tensor>)>
    where
        F: FnOnce() -> Tensor,
    {
        match self.feeding {
            Feeding::Forced => Ok((self.fed(position)?, None)),
            Feeding::Previous => Ok((logits().argmax(-1, false), None)),
            Feeding::Beam { .. } => match self.advance(logits) {
                Some((parents, symbols)) => Ok((symbols, Some(parents))),
                // The beam starts with the first input; without it there is nothing to expand.
                None => Err(Seq2SeqError::MissingFeed(Placeholder {
                    slot: Slot::DecoderInput,
                    position: 0,
                })),
            },
        }
    }

    /// Records the beam choice made from the last output.
    fn advance<F>(&mut self, logits: F) -> Option<(Tensor, Tensor)>
    where
        F: FnOnce() -> Tensor,
    {
        self.beam.as_mut().map(|beam| beam.advance(&logits()))
    }

    fn finish(self) -> Option<BeamTrace> {
        self.beam.map(BeamSearch::finish)
    }
}

/// Embedding RNN decoder started from the final encoder state.
#[derive(Debug)]
pub struct PlainDecoder {
    embedding: nn::Embedding,
    cell: StackedLstm,
    head: VocabHead,
}

impl PlainDecoder {
    pub fn new(
        vs: &nn::Path,
        spec: CellSpec,
        vocab_size: i64,
        embedding_size: i64,
        projection: Option<&OutputProjection>,
    ) -> Self {
        let embedding = nn::embedding(vs / "embedding", vocab_size, embedding_size, Default::default());
        let cell = StackedLstm::new(&(vs / "rnn"), spec, embedding_size);
        let head = match projection {
            Some(projection) => VocabHead::Shared(projection.shallow_clone()),
            None => VocabHead::Own(nn::linear(vs / "head", spec.hidden_size, vocab_size, Default::default())),
        };
        Self {
            embedding,
            cell,
            head,
        }
    }

    pub fn forward(&self, initial: CellState, inputs: &DecoderInputs, feeding: Feeding) -> Result<DecoderRun> {
        let mut feeder = TokenFeeder::new(inputs.tokens, feeding);
        let mut ids = feeder.first()?;
        let mut state = match feeder.rows() {
            Some(rows) => initial.select_rows(&Tensor::zeros(&[rows], (tch::Kind::Int64, ids.device()))),
            None => initial,
        };

        let len = inputs.tokens.len();
        let mut hidden = Vec::with_capacity(len);
        let mut outputs = Vec::with_capacity(len);

        for position in 0..len {
            let (out, next_state) = self.cell.step(&ids.apply(&self.embedding), state);
            state = next_state;
            let logits = self.head.apply(&out);

            if position + 1 < len {
                let (next_ids, parents) = feeder.next(position + 1, || logits.shallow_clone())?;
                if let Some(parents) = parents {
                    state = state.select_rows(&parents);
                }
                ids = next_ids;
            } else if matches!(feeding, Feeding::Beam { .. }) {
                feeder.advance(|| logits.shallow_clone());
            }

            hidden.push(out);
            outputs.push(logits);
        }

        Ok(DecoderRun {
            hidden,
            outputs,
            beam: feeder.finish(),
        })
    }
}

/// Attention decoder. With `context_width` set, the food context vector of
/// each position is mixed into the decoder input as well.
#[derive(Debug)]
pub struct AttentionDecoder {
    embedding: nn::Embedding,
    cell: StackedLstm,
    attention: Attention,
    input_mix: nn::Linear,
    output_mix: nn::Linear,
    projection: OutputProjection,
    context_width: Option<i64>,
}

impl AttentionDecoder {
    pub fn new(
        vs: &nn::Path,
        spec: CellSpec,
        vocab_size: i64,
        embedding_size: i64,
        projection: &OutputProjection,
        context_width: Option<i64>,
    ) -> Self {
        let hidden = spec.hidden_size;
        let embedding = nn::embedding(vs / "embedding", vocab_size, embedding_size, Default::default());
        let cell = StackedLstm::new(&(vs / "rnn"), spec, embedding_size);
        let attention = Attention::new(&(vs / "attention"), hidden, cell.state_size());

        let mix_in = embedding_size + hidden + context_width.unwrap_or(0);
        let input_mix = nn::linear(vs / "input_mix", mix_in, embedding_size, Default::default());
        let output_mix = nn::linear(vs / "output_mix", 2 * hidden, hidden, Default::default());

        Self {
            embedding,
            cell,
            attention,
            input_mix,
            output_mix,
            projection: projection.shallow_clone(),
            context_width,
        }
    }

    /// encoder_outputs: [batch, enc_len, hidden]
    pub fn forward(
        &self,
        encoder_outputs: &Tensor,
        initial: CellState,
        inputs: &DecoderInputs,
        feeding: Feeding,
    ) -> Result<DecoderRun> {
        let context = match (self.context_width, inputs.context) {
            (Some(_), Some(context)) => Some(context),
            (Some(_), None) => {
                return Err(Seq2SeqError::MissingFeed(Placeholder {
                    slot: Slot::DecoderContext,
                    position: 0,
                }))
            }
            (None, _) => None,
        };

        let mut feeder = TokenFeeder::new(inputs.tokens, feeding);
        let mut ids = feeder.first()?;

        let (mut state, states) = match feeder.rows() {
            Some(rows) => {
                let index = Tensor::zeros(&[rows], (tch::Kind::Int64, ids.device()));
                (initial.select_rows(&index), encoder_outputs.index_select(0, &index))
            }
            None => (initial, encoder_outputs.shallow_clone()),
        };
        let keys = self.attention.keys(&states);
        let batch = states.size()[0];
        let mut attns = Tensor::zeros(&[batch, states.size()[2]], (states.kind(), states.device()));

        let len = inputs.tokens.len();
        let mut hidden = Vec::with_capacity(len);

        for position in 0..len {
            let embedded = ids.apply(&self.embedding);
            let x = match context {
                Some(context) => {
                    let ctx = context[position].to_kind(embedded.kind());
                    let ctx = if ctx.size()[0] == batch {
                        ctx
                    } else {
                        ctx.expand(&[batch, -1], false)
                    };
                    Tensor::cat(&[&embedded, &attns, &ctx], 1)
                }
                None => Tensor::cat(&[&embedded, &attns], 1),
            }
            .apply(&self.input_mix);

            let (cell_out, next_state) = self.cell.step(&x, state);
            state = next_state;
            attns = self.attention.forward(&state.flatten(), &keys, &states);
            let out = Tensor::cat(&[&cell_out, &attns], 1).apply(&self.output_mix);

            if position + 1 < len {
                let (next_ids, parents) = feeder.next(position + 1, || self.projection.apply(&out))?;
                if let Some(parents) = parents {
                    state = state.select_rows(&parents);
                    attns = attns.index_select(0, &parents);
                }
                ids = next_ids;
            } else if matches!(feeding, Feeding::Beam { .. }) {
                feeder.advance(|| self.projection.apply(&out));
            }

            hidden.push(out);
        }

        let outputs = hidden.iter().map(Tensor::shallow_clone).collect();
        Ok(DecoderRun {
            hidden,
            outputs,
            beam: feeder.finish(),
        })
    }
}

#[derive(Debug)]
pub enum Decoder {
    Plain(PlainDecoder),
    Attention(AttentionDecoder),
}
