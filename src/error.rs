use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// One field that differs between a saved run and the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub field: &'static str,
    pub saved: String,
    pub current: String,
}

impl Mismatch {
    pub fn new(field: &'static str, saved: impl fmt::Debug, current: impl fmt::Debug) -> Self {
        Self {
            field,
            saved: format!("{saved:?}"),
            current: format!("{current:?}"),
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' (saved {}, current {})",
            self.field, self.saved, self.current
        )
    }
}

fn list_mismatches(mismatches: &[Mismatch]) -> String {
    mismatches
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("cannot read corpus '{}': {source}", .path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "not enough data: {tensor_len} characters cannot fill one batch of \
         batch_size * seq_length = {required}; make seq_length and batch_size smaller"
    )]
    InsufficientData { tensor_len: usize, required: usize },

    #[error("saved model and current run disagree on {}", list_mismatches(.mismatches))]
    ResumeIncompatibility { mismatches: Vec<Mismatch> },

    #[error("cannot resume from '{}': missing {artifact}", .dir.display())]
    MissingResumeArtifact { dir: PathBuf, artifact: String },

    #[error("checkpoint {action} failed for '{}': {source}", .path.display())]
    CheckpointIo {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("corpus cache artifact '{}': {source}", .path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("training interrupted at global step {0}")]
    Interrupted(usize),

    #[error(transparent)]
    Model(#[from] candle_core::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incompatibility_names_every_field() {
        let err = RunError::ResumeIncompatibility {
            mismatches: vec![
                Mismatch::new("seq_length", 50, 64),
                Mismatch::new("rnn_size", 128, 256),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("'seq_length' (saved 50, current 64)"));
        assert!(msg.contains("'rnn_size'"));
    }

    #[test]
    fn insufficient_data_names_requirement() {
        let err = RunError::InsufficientData {
            tensor_len: 3,
            required: 4,
        };
        assert!(err.to_string().contains("batch_size * seq_length = 4"));
    }
}
