use crate::config::{ModelKind, TrainConfig};
use crate::export::PackageExporter;
use crate::model::CharRnn;
use crate::train::{Session, Trainer};
use crate::vocab::FileCache;
use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Train a multi-layer character-level recurrent language model and export it as a portable
/// package.
#[derive(Parser, Debug)]
#[command(name = "char-rnn", version)]
pub struct Cli {
    /// Text file to train on (`.gz` is decompressed)
    #[arg(long, default_value = "data/input.txt")]
    pub data_path: PathBuf,

    /// Directory to write the exported model package to
    #[arg(long, default_value = "models")]
    pub save_model: PathBuf,

    /// Directory to store checkpointed models
    #[arg(long, default_value = "checkpoints")]
    pub save_checkpoints: PathBuf,

    /// Directory for per-step training logs
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Directory for the preprocessed corpus cache
    #[arg(long, default_value = "textloader")]
    pub cache_dir: PathBuf,

    /// Size of the recurrent hidden state
    #[arg(long, default_value_t = 128)]
    pub rnn_size: usize,

    /// Number of stacked recurrent layers
    #[arg(long, default_value_t = 2)]
    pub num_layers: usize,

    #[arg(long, value_enum, default_value_t = ModelKind::Lstm)]
    pub model: ModelKind,

    #[arg(long, default_value_t = 50)]
    pub batch_size: usize,

    /// Number of time steps each batch is unrolled over
    #[arg(long, default_value_t = 50)]
    pub seq_length: usize,

    #[arg(long, default_value_t = 50)]
    pub num_epochs: usize,

    /// Print progress every this many global steps
    #[arg(long, default_value_t = 1)]
    pub print_every: usize,

    /// Checkpoint every this many global steps (the last step is always saved)
    #[arg(long, default_value_t = 1000)]
    pub save_every: usize,

    /// Clip gradients to this global norm
    #[arg(long, default_value_t = 5.0)]
    pub grad_clip: f64,

    #[arg(long, default_value_t = 0.002)]
    pub learning_rate: f64,

    /// Per-epoch learning rate decay factor
    #[arg(long, default_value_t = 0.97)]
    pub decay_rate: f64,

    /// Probability of keeping activations leaving the recurrent stack
    #[arg(long, default_value_t = 1.0)]
    pub output_keep_prob: f64,

    /// Probability of keeping activations entering the recurrent stack
    #[arg(long, default_value_t = 1.0)]
    pub input_keep_prob: f64,

    /// Print the total time spent on training
    #[arg(long)]
    pub total_time: bool,

    /// Continue training from the run directory of a previous run. It must hold that run's
    /// config.json, chars_vocab.json, checkpoint.json and the checkpoint it points at.
    #[arg(long)]
    pub init_from: Option<PathBuf>,
}

impl From<Cli> for TrainConfig {
    fn from(a: Cli) -> Self {
        TrainConfig {
            data_path: a.data_path,
            save_model: a.save_model,
            save_checkpoints: a.save_checkpoints,
            log_dir: a.log_dir,
            cache_dir: a.cache_dir,
            model: a.model,
            rnn_size: a.rnn_size,
            num_layers: a.num_layers,
            batch_size: a.batch_size,
            seq_length: a.seq_length,
            num_epochs: a.num_epochs,
            print_every: a.print_every,
            save_every: a.save_every,
            grad_clip: a.grad_clip,
            learning_rate: a.learning_rate,
            decay_rate: a.decay_rate,
            output_keep_prob: a.output_keep_prob,
            input_keep_prob: a.input_keep_prob,
            total_time: a.total_time,
            init_from: a.init_from,
            vocab_size: 0,
        }
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let cfg = TrainConfig::from(self);
        let cache = FileCache::new(&cfg.cache_dir)
            .with_context(|| format!("cannot create cache directory '{}'", cfg.cache_dir.display()))?;
        let session = Session::prepare(cfg, &cache)?;

        let device = Device::cuda_if_available(0)?;
        tracing::info!("using device {:?}", device);
        let model = CharRnn::new(&session.cfg, &device)?;

        let mut trainer = Trainer::new(session, model).with_stop_signal(interrupt_flag()?);
        let summary = trainer.run(&PackageExporter)?;
        tracing::info!(
            "finished {} steps in {:.1}s, last loss {:.3}",
            summary.global_steps,
            summary.elapsed.as_secs_f64(),
            summary.last_loss
        );

        let package = summary.export.with_context(|| {
            format!(
                "training finished at {} but the export failed",
                summary.final_checkpoint
            )
        })?;
        println!("Model exported to {}", package.display());
        Ok(())
    }
}

/// Flag raised by Ctrl-C. Training stops before its next step and keeps the last checkpoint.
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("cannot install the Ctrl-C handler")?;
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_is_installed_once_and_starts_clear() {
        let flag = interrupt_flag().unwrap();
        assert!(!flag.load(Ordering::Relaxed));
        // the process-wide handler is now taken
        assert!(interrupt_flag().is_err());
    }

    #[test]
    fn defaults_match_the_config_defaults() {
        let cfg = TrainConfig::from(Cli::parse_from(["char-rnn"]));
        let defaults = TrainConfig::default();
        assert_eq!(cfg, defaults);
    }

    #[test]
    fn flags_reach_the_config() {
        let cli = Cli::parse_from([
            "char-rnn",
            "--model",
            "gru",
            "--seq-length",
            "25",
            "--total-time",
            "--init-from",
            "checkpoints/input",
        ]);
        let cfg = TrainConfig::from(cli);
        assert_eq!(cfg.model, ModelKind::Gru);
        assert_eq!(cfg.seq_length, 25);
        assert!(cfg.total_time);
        assert_eq!(cfg.init_from, Some(PathBuf::from("checkpoints/input")));
    }
}
