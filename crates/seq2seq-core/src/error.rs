use thiserror::Error;

use crate::graph::{Fetch, Placeholder};

#[derive(Error, Debug)]
pub enum Seq2SeqError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Torch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Checkpoint tensor {name} has shape {found:?}, model expects {expected:?}")]
    CheckpointShape {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error("Unsupported checkpoint dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error("No value fed for placeholder {0}")]
    MissingFeed(Placeholder),

    #[error("Placeholder {placeholder} was fed a {found} value, expected {expected}")]
    FeedMismatch {
        placeholder: Placeholder,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Fetch {0:?} does not exist in this graph")]
    UnknownFetch(Fetch),

    #[error("Batch shape mismatch: {0}")]
    BatchShape(String),

    #[error("Beam search decodes one example at a time, got a batch of {0}")]
    BeamBatch(i64),

    #[error("Sample {0} has no context vector of width {1}")]
    MissingContext(usize, usize),
}

pub type Result<T> = std::result::Result<T, Seq2SeqError>;
