pub mod attention;
pub mod batch;
pub mod beam;
pub mod cell;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod graph;
pub mod loss;
pub mod model;
pub mod network;
pub mod projection;
pub mod safetensors_util;
pub mod session;
pub mod vocab;

pub use batch::{Batch, Sample};
pub use config::{CorpusKind, ModelConfig, CONTEXT_WIDTH};
pub use decoder::{DecoderStrategy, Feeding};
pub use engine::{ExecutionEngine, FeedDict, FeedValue, Fetched};
pub use error::{Result, Seq2SeqError};
pub use graph::{Fetch, Graph, Placeholder, Slot};
pub use model::Seq2SeqModel;
pub use projection::OutputProjection;
pub use session::Session;
pub use vocab::VocabularyInfo;
