use log::info;
use tch::nn;

use crate::batch::Batch;
use crate::cell::{CellSpec, StateLayout};
use crate::config::ModelConfig;
use crate::decoder::{DecoderStrategy, Feeding};
use crate::engine::{FeedDict, FeedValue};
use crate::error::Result;
use crate::graph::{AdamSpec, Fetch, Graph, InferenceGraph, LossFunction, Placeholder, Placeholders, TrainingGraph};
use crate::network::Network;
use crate::vocab::VocabularyInfo;

/// Encoder/decoder model predicting the answer to an input sentence.
///
/// Everything is built once by [`Seq2SeqModel::new`]; afterwards the model is
/// only read, so [`Seq2SeqModel::step`] can be prepared from many threads.
#[derive(Debug)]
pub struct Seq2SeqModel {
    config: ModelConfig,
    vocab: VocabularyInfo,
    placeholders: Placeholders,
    strategy: DecoderStrategy,
    graph: Graph,
    network: Network,
}

impl Seq2SeqModel {
    pub fn new(vs: &nn::Path, config: ModelConfig, vocab: VocabularyInfo) -> Result<Self> {
        config.validate()?;
        info!("Model creation...");
        Ok(Self::build_network(vs, config, vocab))
    }

    fn build_network(vs: &nn::Path, config: ModelConfig, vocab: VocabularyInfo) -> Self {
        let sampled_softmax = config.uses_sampled_softmax(vocab.size);

        let cell = CellSpec {
            hidden_size: config.hidden_size,
            num_layers: config.num_layers,
            layout: if config.beam_search {
                StateLayout::Flat
            } else {
                StateLayout::Tuple
            },
        };

        let placeholders = Placeholders::new(
            config.max_length_enco,
            config.max_length_deco,
            config.corpus.enables_context(),
        );

        let strategy = DecoderStrategy::select(&config);
        let network = Network::new(vs, &config, cell, vocab.size, strategy, sampled_softmax);

        let graph = if config.test {
            let mut outputs: Vec<Fetch> = (0..config.max_length_deco)
                .map(|position| Fetch::DecoderOutput {
                    position,
                    projected: false,
                })
                .collect();
            if config.beam_search {
                outputs.extend([Fetch::BeamPath, Fetch::BeamSymbols, Fetch::BeamProbs]);
            } else if !strategy.emits_vocab_space() {
                for output in outputs.iter_mut() {
                    if let Fetch::DecoderOutput { projected, .. } = output {
                        *projected = true;
                    }
                }
            }
            Graph::Inference(InferenceGraph { outputs })
        } else {
            let loss_fn = if sampled_softmax {
                LossFunction::SampledSoftmax {
                    num_sampled: config.softmax_samples,
                }
            } else {
                LossFunction::Softmax
            };
            Graph::Training(TrainingGraph {
                loss: Fetch::Loss,
                optimizer_step: Fetch::OptimizerStep,
                loss_fn,
                optimizer: AdamSpec::new(config.learning_rate),
            })
        };

        info!(
            "Built {} graph: {:?} decoder, {} loss, projection {}",
            if config.test { "inference" } else { "training" },
            strategy,
            if sampled_softmax { "sampled softmax" } else { "softmax" },
            if network.projection().is_some() { "allocated" } else { "not allocated" },
        );

        Self {
            config,
            vocab,
            placeholders,
            strategy,
            graph,
            network,
        }
    }

    /// Returns the fetches to run for `batch` with the feed binding every
    /// needed placeholder. Nothing is executed.
    ///
    /// In test mode `match_decoder_input` feeds the whole decoder sequence of
    /// the batch instead of the `<go>` token alone.
    pub fn step(&self, batch: &Batch, match_decoder_input: bool) -> (Vec<Fetch>, FeedDict) {
        let mut feed = FeedDict::new();
        let placeholders = &self.placeholders;

        let fetches = match &self.graph {
            Graph::Training(graph) => {
                if !self.config.finetune {
                    feed_rows(&mut feed, placeholders.encoder_inputs(), &batch.encoder_seqs, FeedValue::Tokens);
                }
                feed_rows(&mut feed, placeholders.decoder_inputs(), &batch.decoder_seqs, FeedValue::Tokens);
                feed_rows(&mut feed, placeholders.decoder_targets(), &batch.target_seqs, FeedValue::Tokens);
                feed_rows(&mut feed, placeholders.decoder_weights(), &batch.weights, FeedValue::Weights);
                self.feed_context(&mut feed, batch);

                vec![graph.optimizer_step, graph.loss]
            }
            Graph::Inference(graph) => {
                feed_rows(&mut feed, placeholders.encoder_inputs(), &batch.encoder_seqs, FeedValue::Tokens);
                if match_decoder_input {
                    feed_rows(&mut feed, placeholders.decoder_inputs(), &batch.decoder_seqs, FeedValue::Tokens);
                } else {
                    let go = vec![self.vocab.go; batch.batch_size()];
                    feed.insert(placeholders.decoder_inputs()[0], FeedValue::Tokens(go));
                }
                self.feed_context(&mut feed, batch);

                graph.outputs.clone()
            }
        };

        (fetches, feed)
    }

    fn feed_context(&self, feed: &mut FeedDict, batch: &Batch) {
        if let Some(context) = self.placeholders.decoder_context() {
            feed_rows(feed, context, &batch.context_seqs, FeedValue::Context);
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn vocab(&self) -> &VocabularyInfo {
        &self.vocab
    }

    pub fn placeholders(&self) -> &Placeholders {
        &self.placeholders
    }

    pub fn strategy(&self) -> DecoderStrategy {
        self.strategy
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn feeding(&self) -> Feeding {
        Feeding::from_config(&self.config)
    }
}

/// Binds one batch row per placeholder. A batch shorter than the graph leaves
/// the remaining placeholders unfed; the engine reports them.
fn feed_rows<T: Clone>(feed: &mut FeedDict, slots: &[Placeholder], rows: &[T], wrap: fn(T) -> FeedValue) {
    for (placeholder, row) in slots.iter().zip(rows) {
        feed.insert(*placeholder, wrap(row.clone()));
    }
}

// Parameters are only read once the model is built; training mutates them
// through the session's optimizer, never through a shared model.
unsafe impl Sync for Seq2SeqModel {}
