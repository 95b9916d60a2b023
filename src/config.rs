use crate::error::{Mismatch, Result, RunError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Rnn,
    Gru,
    Lstm,
}

/// Hyperparameters of one training run, persisted as `config.json` in the run directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub data_path: PathBuf,
    pub save_model: PathBuf,
    pub save_checkpoints: PathBuf,
    pub log_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub model: ModelKind,
    pub rnn_size: usize,
    pub num_layers: usize,
    pub batch_size: usize,
    pub seq_length: usize,
    pub num_epochs: usize,
    pub print_every: usize,
    pub save_every: usize,
    pub grad_clip: f64,
    pub learning_rate: f64,
    pub decay_rate: f64,
    pub output_keep_prob: f64,
    pub input_keep_prob: f64,
    pub total_time: bool,
    pub init_from: Option<PathBuf>,
    #[serde(default)]
    pub vocab_size: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/input.txt"),
            save_model: PathBuf::from("models"),
            save_checkpoints: PathBuf::from("checkpoints"),
            log_dir: PathBuf::from("logs"),
            cache_dir: PathBuf::from("textloader"),
            model: ModelKind::Lstm,
            rnn_size: 128,
            num_layers: 2,
            batch_size: 50,
            seq_length: 50,
            num_epochs: 50,
            print_every: 1,
            save_every: 1000,
            grad_clip: 5.0,
            learning_rate: 0.002,
            decay_rate: 0.97,
            output_keep_prob: 1.0,
            input_keep_prob: 1.0,
            total_time: false,
            init_from: None,
            vocab_size: 0,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("rnn_size", self.rnn_size),
            ("num_layers", self.num_layers),
            ("batch_size", self.batch_size),
            ("seq_length", self.seq_length),
            ("num_epochs", self.num_epochs),
            ("print_every", self.print_every),
            ("save_every", self.save_every),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RunError::Config(format!("{name} must be greater than zero")));
            }
        }
        for (name, p) in [
            ("output_keep_prob", self.output_keep_prob),
            ("input_keep_prob", self.input_keep_prob),
        ] {
            if !(p > 0.0 && p <= 1.0) {
                return Err(RunError::Config(format!("{name} must lie in (0, 1], got {p}")));
            }
        }
        for (name, v) in [
            ("learning_rate", self.learning_rate),
            ("decay_rate", self.decay_rate),
            ("grad_clip", self.grad_clip),
        ] {
            if !(v > 0.0) {
                return Err(RunError::Config(format!("{name} must be positive, got {v}")));
            }
        }
        Ok(())
    }

    /// Effective learning rate for zero-based epoch `epoch`.
    pub fn learning_rate_at(&self, epoch: usize) -> f64 {
        self.learning_rate * self.decay_rate.powi(epoch as i32)
    }

    /// Fields that fix the parameter shapes and the unroll length. A resumed run must agree on all
    /// of them; everything else may change between runs.
    pub fn topology_mismatches(&self, saved: &TrainConfig) -> Vec<Mismatch> {
        let mut out = Vec::new();
        if saved.model != self.model {
            out.push(Mismatch::new("model", saved.model, self.model));
        }
        if saved.rnn_size != self.rnn_size {
            out.push(Mismatch::new("rnn_size", saved.rnn_size, self.rnn_size));
        }
        if saved.num_layers != self.num_layers {
            out.push(Mismatch::new("num_layers", saved.num_layers, self.num_layers));
        }
        if saved.seq_length != self.seq_length {
            out.push(Mismatch::new("seq_length", saved.seq_length, self.seq_length));
        }
        out
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!("saved run configuration to '{}'", path.display());
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let json = fs::read_to_string(dir.join(CONFIG_FILE))?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Model name and cache key of a corpus: its file name up to the first `.`.
pub fn corpus_stem(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .and_then(|n| n.split('.').next().map(str::to_owned))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "corpus".to_owned())
}
