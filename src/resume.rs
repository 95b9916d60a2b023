use crate::checkpoint::{CheckpointRecord, CHECKPOINT_RECORD};
use crate::config::{TrainConfig, CONFIG_FILE};
use crate::error::{Result, RunError};
use crate::vocab::{VocabArtifact, Vocabulary, VOCAB_FILE};
use std::path::{Path, PathBuf};

fn missing(dir: &Path, artifact: impl Into<String>) -> RunError {
    RunError::MissingResumeArtifact {
        dir: dir.to_path_buf(),
        artifact: artifact.into(),
    }
}

/// Checks that the run saved in `dir` can be continued with `current` and `vocab`, and returns
/// the checkpoint to load. Every topology and vocabulary disagreement is reported at once.
pub fn validate_resume(dir: &Path, current: &TrainConfig, vocab: &Vocabulary) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(missing(dir, "run directory"));
    }
    for artifact in [CONFIG_FILE, VOCAB_FILE, CHECKPOINT_RECORD] {
        if !dir.join(artifact).is_file() {
            return Err(missing(dir, artifact));
        }
    }

    let record = CheckpointRecord::load(dir)?;
    let checkpoint = record.resolve(dir);
    if !checkpoint.is_file() {
        return Err(missing(
            dir,
            format!("checkpoint file '{}'", checkpoint.display()),
        ));
    }

    let saved_cfg = TrainConfig::load(dir)?;
    let saved_vocab = VocabArtifact::load(dir)?;
    let mut mismatches = current.topology_mismatches(&saved_cfg);
    mismatches.extend(saved_vocab.mismatches(vocab));
    if !mismatches.is_empty() {
        return Err(RunError::ResumeIncompatibility { mismatches });
    }

    tracing::info!("resuming from '{}'", checkpoint.display());
    Ok(checkpoint)
}
