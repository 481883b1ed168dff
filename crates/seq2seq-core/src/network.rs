use tch::{nn, Tensor};

use crate::cell::CellSpec;
use crate::config::{ModelConfig, CONTEXT_WIDTH};
use crate::decoder::{AttentionDecoder, Decoder, DecoderInputs, DecoderRun, DecoderStrategy, Encoder, Feeding, PlainDecoder};
use crate::error::Result;
use crate::projection::OutputProjection;

/// Parameters of the encoder/decoder pair and of the output projection.
#[derive(Debug)]
pub struct Network {
    encoder: Encoder,
    decoder: Decoder,
    projection: Option<OutputProjection>,
}

impl Network {
    /// The output projection is allocated when sampled softmax needs it, or
    /// when the decoder does not emit vocabulary-space outputs on its own.
    pub fn new(
        vs: &nn::Path,
        config: &ModelConfig,
        cell: CellSpec,
        vocab_size: i64,
        strategy: DecoderStrategy,
        sampled_softmax: bool,
    ) -> Self {
        let new_projection = || {
            OutputProjection::new(&(vs / "softmax_projection"), &[config.hidden_size, vocab_size])
        };
        let mut projection = sampled_softmax.then(new_projection);

        let encoder = Encoder::new(&(vs / "encoder"), cell, vocab_size, config.embedding_size);
        let decoder_vs = vs / "decoder";
        let decoder = match strategy {
            DecoderStrategy::Plain => Decoder::Plain(PlainDecoder::new(
                &decoder_vs,
                cell,
                vocab_size,
                config.embedding_size,
                projection.as_ref(),
            )),
            DecoderStrategy::Attention | DecoderStrategy::FoodContext => {
                let context_width = (strategy == DecoderStrategy::FoodContext).then_some(CONTEXT_WIDTH as i64);
                let projection = projection.get_or_insert_with(new_projection);
                Decoder::Attention(AttentionDecoder::new(
                    &decoder_vs,
                    cell,
                    vocab_size,
                    config.embedding_size,
                    projection,
                    context_width,
                ))
            }
        };

        Self {
            encoder,
            decoder,
            projection,
        }
    }

    pub fn projection(&self) -> Option<&OutputProjection> {
        self.projection.as_ref()
    }

    pub fn forward(&self, encoder_inputs: &[Tensor], inputs: &DecoderInputs, feeding: Feeding) -> Result<DecoderRun> {
        let (encoder_outputs, state) = self.encoder.forward(encoder_inputs);
        match &self.decoder {
            Decoder::Plain(decoder) => decoder.forward(state, inputs, feeding),
            Decoder::Attention(decoder) => decoder.forward(&encoder_outputs, state, inputs, feeding),
        }
    }
}
