use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::Result;

/// Vocabulary facts the model needs: its size and the reserved token ids.
/// The tokens themselves live with whoever tokenizes the corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyInfo {
    pub size: i64,
    pub pad: i64,
    pub go: i64,
    pub eos: i64,
    pub unknown: i64,
}

impl VocabularyInfo {
    /// Reserved tokens take the first four ids: pad, go, eos, unknown.
    pub fn new(size: i64) -> Self {
        Self {
            size,
            pad: 0,
            go: 1,
            eos: 2,
            unknown: 3,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}
