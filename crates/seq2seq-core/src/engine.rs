use std::collections::BTreeMap;
use tch::Tensor;

use crate::error::Result;
use crate::graph::{Fetch, Placeholder, Slot};

/// Value bound to one placeholder, covering the whole batch.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedValue {
    Tokens(Vec<i64>),
    Weights(Vec<f32>),
    Context(Vec<Vec<f32>>),
}

impl FeedValue {
    pub fn kind(&self) -> &'static str {
        match self {
            FeedValue::Tokens(_) => "tokens",
            FeedValue::Weights(_) => "weights",
            FeedValue::Context(_) => "context",
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            FeedValue::Tokens(v) => v.len(),
            FeedValue::Weights(v) => v.len(),
            FeedValue::Context(v) => v.len(),
        }
    }
}

/// Placeholder → value mapping for a single step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedDict {
    values: BTreeMap<Placeholder, FeedValue>,
}

impl FeedDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, placeholder: Placeholder, value: FeedValue) {
        self.values.insert(placeholder, value);
    }

    pub fn get(&self, placeholder: &Placeholder) -> Option<&FeedValue> {
        self.values.get(placeholder)
    }

    pub fn contains(&self, placeholder: &Placeholder) -> bool {
        self.values.contains_key(placeholder)
    }

    /// Number of fed placeholders of one slot kind.
    pub fn count(&self, slot: Slot) -> usize {
        self.values.keys().filter(|p| p.slot == slot).count()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Placeholder, &FeedValue)> {
        self.values.iter()
    }
}

/// Materialized result of one fetch.
#[derive(Debug)]
pub enum Fetched {
    /// The fetch had a side effect only (optimizer step).
    Done,
    Scalar(f64),
    Tensor(Tensor),
}

impl Fetched {
    pub fn scalar(&self) -> Option<f64> {
        match self {
            Fetched::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            Fetched::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

/// Anything able to run the fetches of a step against a feed.
///
/// Results come back in the order of `fetches`.
pub trait ExecutionEngine {
    fn execute(&mut self, fetches: &[Fetch], feed: &FeedDict) -> Result<Vec<Fetched>>;
}
