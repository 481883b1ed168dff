pub mod dataset;
pub mod train;

pub use dataset::SampleDataset;
pub use train::{fit_epoch, train_step, Trainer};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub epochs: usize,
    /// Checkpoint every this many steps; a final checkpoint is always written.
    pub save_every: usize,
    pub log_every: usize,
    pub checkpoint_dir: String,
    /// Overrides the model configuration's learning rate.
    pub learning_rate: Option<f64>,
    /// Fixes the shuffling order.
    pub seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            epochs: 30,
            save_every: 2000,
            log_every: 100,
            checkpoint_dir: "./checkpoints".to_string(),
            learning_rate: None,
            seed: None,
        }
    }
}
