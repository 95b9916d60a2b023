use crate::error::{Result, RunError};
use crate::model::SequenceModel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_RECORD: &str = "checkpoint.json";
const EXTENSION: &str = "safetensors";
const PARTIAL_SUFFIX: &str = ".partial";

/// A checkpoint is addressed by the model it belongs to and the global step it was taken at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointId {
    pub model_name: String,
    pub global_step: usize,
}

impl CheckpointId {
    pub fn file_name(&self) -> String {
        format!("{self}.{EXTENSION}")
    }

    fn partial_name(&self) -> String {
        format!(".{}{PARTIAL_SUFFIX}", self.file_name())
    }

    /// Parses `<model>-<step>.safetensors` and the in-flight `.<model>-<step>.safetensors.partial`
    /// for the given model. Any other name, including other models sharing a prefix, is `None`.
    fn parse(model_name: &str, file_name: &str) -> Option<Self> {
        let name = match file_name.strip_suffix(PARTIAL_SUFFIX) {
            Some(partial) => partial.strip_prefix('.')?,
            None => file_name,
        };
        let step = name
            .strip_suffix(EXTENSION)?
            .strip_suffix('.')?
            .strip_prefix(model_name)?
            .strip_prefix('-')?;
        if step.is_empty() || !step.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            model_name: model_name.to_owned(),
            global_step: step.parse().ok()?,
        })
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.model_name, self.global_step)
    }
}

/// Pointer to the live checkpoint of a run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub model_checkpoint_path: PathBuf,
    pub model_name: String,
    pub global_step: usize,
}

impl CheckpointRecord {
    pub fn load(dir: &Path) -> Result<Self> {
        let json = fs::read_to_string(dir.join(CHECKPOINT_RECORD))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Relative paths are taken relative to the run directory.
    pub fn resolve(&self, dir: &Path) -> PathBuf {
        if self.model_checkpoint_path.is_absolute() {
            self.model_checkpoint_path.clone()
        } else {
            dir.join(&self.model_checkpoint_path)
        }
    }
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> RunError {
    let path = path.to_path_buf();
    move |source| RunError::CheckpointIo {
        action,
        path,
        source: Box::new(source),
    }
}

/// Keeps exactly one live checkpoint per model name in a run directory.
pub struct CheckpointStore {
    dir: PathBuf,
    model_name: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, model_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            model_name: model_name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Checkpoint files of this model currently on disk, finished or not.
    pub fn existing(&self) -> Result<Vec<(CheckpointId, PathBuf)>> {
        let entries = fs::read_dir(&self.dir).map_err(io_err("listing", &self.dir))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err("listing", &self.dir))?;
            let name = entry.file_name();
            if let Some(id) = CheckpointId::parse(&self.model_name, &name.to_string_lossy()) {
                found.push((id, entry.path()));
            }
        }
        found.sort_by_key(|(id, _)| id.global_step);
        Ok(found)
    }

    /// Writes a checkpoint for `global_step` under a temporary name, removes every other
    /// checkpoint of this model, moves the new one into place and repoints the record.
    pub fn rotate(&self, model: &dyn SequenceModel, global_step: usize) -> Result<CheckpointId> {
        let id = CheckpointId {
            model_name: self.model_name.clone(),
            global_step,
        };
        let partial = self.dir.join(id.partial_name());
        let target = self.dir.join(id.file_name());

        model.save(&partial).map_err(|e| match e {
            RunError::Io(source) => io_err("write", &partial)(source),
            other => RunError::CheckpointIo {
                action: "write",
                path: partial.clone(),
                source: Box::new(other),
            },
        })?;

        for (_, stale) in self.existing()? {
            if stale != partial {
                fs::remove_file(&stale).map_err(io_err("delete", &stale))?;
            }
        }
        fs::rename(&partial, &target).map_err(io_err("rename", &target))?;

        let record = CheckpointRecord {
            model_checkpoint_path: PathBuf::from(id.file_name()),
            model_name: id.model_name.clone(),
            global_step,
        };
        let record_path = self.dir.join(CHECKPOINT_RECORD);
        let record_tmp = self.dir.join(format!("{CHECKPOINT_RECORD}{PARTIAL_SUFFIX}"));
        let json = serde_json::to_string_pretty(&record)?;
        fs::write(&record_tmp, json).map_err(io_err("write", &record_tmp))?;
        fs::rename(&record_tmp, &record_path).map_err(io_err("rename", &record_path))?;

        tracing::info!("model saved to '{}'", target.display());
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use crate::model::RecurrentState;

    /// Writes a fixed byte string as its "weights".
    struct Weights(&'static [u8]);

    impl SequenceModel for Weights {
        fn initial_state(&self) -> Result<RecurrentState> {
            Ok(RecurrentState { layers: Vec::new() })
        }
        fn train_step(&mut self, _: &Batch, s: &RecurrentState) -> Result<(f32, RecurrentState)> {
            Ok((0.0, s.clone()))
        }
        fn set_learning_rate(&mut self, _: f64) {}
        fn save(&self, path: &Path) -> Result<()> {
            fs::write(path, self.0)?;
            Ok(())
        }
        fn restore(&mut self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn parses_only_its_own_model() {
        let parse = |n: &str| CheckpointId::parse("input", n).map(|id| id.global_step);
        assert_eq!(parse("input-12.safetensors"), Some(12));
        assert_eq!(parse(".input-3.safetensors.partial"), Some(3));
        assert_eq!(parse("input2-5.safetensors"), None);
        assert_eq!(parse("my_input-5.safetensors"), None);
        assert_eq!(parse("input-.safetensors"), None);
        assert_eq!(parse("input-x1.safetensors"), None);
        assert_eq!(parse("chars_vocab.json"), None);
    }

    #[test]
    fn rotation_keeps_one_live_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "input");
        // files of another model and run metadata survive rotation
        fs::write(dir.path().join("input2-7.safetensors"), b"other").unwrap();
        fs::write(dir.path().join("config.json"), b"{}").unwrap();
        // leftover from an aborted rotation
        fs::write(dir.path().join(".input-1.safetensors.partial"), b"junk").unwrap();

        for step in [0, 1000, 2000, 2499] {
            let id = store.rotate(&Weights(b"w"), step).unwrap();
            let live = store.existing().unwrap();
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].0, id);
        }
        assert!(dir.path().join("input2-7.safetensors").exists());
        assert!(dir.path().join("config.json").exists());

        let record = CheckpointRecord::load(dir.path()).unwrap();
        assert_eq!(record.global_step, 2499);
        let live = record.resolve(dir.path());
        assert_eq!(live, dir.path().join("input-2499.safetensors"));
        assert_eq!(fs::read(live).unwrap(), b"w");
    }

    #[test]
    fn failed_write_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("missing"), "input");
        let err = store.rotate(&Weights(b"w"), 5).unwrap_err();
        assert!(matches!(err, RunError::CheckpointIo { action: "write", .. }));
    }

    /// Fails inside the numeric framework rather than the filesystem.
    struct Unserializable;

    impl SequenceModel for Unserializable {
        fn initial_state(&self) -> Result<RecurrentState> {
            Ok(RecurrentState { layers: Vec::new() })
        }
        fn train_step(&mut self, _: &Batch, s: &RecurrentState) -> Result<(f32, RecurrentState)> {
            Ok((0.0, s.clone()))
        }
        fn set_learning_rate(&mut self, _: f64) {}
        fn save(&self, _: &Path) -> Result<()> {
            Err(candle_core::Error::Msg("dtype not serializable".to_owned()).into())
        }
        fn restore(&mut self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn model_save_failure_keeps_its_cause() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), "input");
        let err = store.rotate(&Unserializable, 5).unwrap_err();
        assert!(matches!(err, RunError::CheckpointIo { action: "write", .. }));

        let cause = std::error::Error::source(&err).unwrap();
        let inner = cause.downcast_ref::<RunError>().unwrap();
        assert!(matches!(inner, RunError::Model(_)));
        assert!(err.to_string().contains("dtype not serializable"));
        assert!(store.existing().unwrap().is_empty());
    }
}
