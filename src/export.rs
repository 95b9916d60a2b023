use crate::checkpoint::CheckpointId;
use crate::error::Result;
use crate::vocab::Vocabulary;
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ExportRequest<'a> {
    pub checkpoint_dir: &'a Path,
    pub export_dir: &'a Path,
    pub vocab: &'a Vocabulary,
    pub model_name: &'a str,
    pub checkpoint: &'a CheckpointId,
}

/// Turns a finished run's checkpoint into something a consumer outside this crate can load.
pub trait CheckpointExporter {
    fn export(&self, request: &ExportRequest) -> Result<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub shape: Vec<usize>,
}

/// Writes `<export_dir>/<model>/` with a `manifest.json`, one little-endian f32 file per
/// variable and the `vocab.json` index table.
pub struct PackageExporter;

impl CheckpointExporter for PackageExporter {
    fn export(&self, request: &ExportRequest) -> Result<PathBuf> {
        let source = request.checkpoint_dir.join(request.checkpoint.file_name());
        let out_dir = request.export_dir.join(request.model_name);
        fs::create_dir_all(&out_dir)?;

        let tensors = candle_core::safetensors::load(&source, &Device::Cpu)?;
        let mut manifest = BTreeMap::new();
        for (name, tensor) in tensors {
            let filename = name.replace(['.', '/'], "_");
            let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            fs::write(out_dir.join(&filename), bytes)?;
            manifest.insert(
                name,
                ManifestEntry {
                    filename,
                    shape: tensor.dims().to_vec(),
                },
            );
        }
        fs::write(
            out_dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        fs::write(
            out_dir.join("vocab.json"),
            serde_json::to_string(&request.vocab.mapping())?,
        )?;

        tracing::info!(
            "exported {} to '{}'",
            request.checkpoint,
            out_dir.display()
        );
        Ok(out_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;
    use std::collections::HashMap;

    #[test]
    fn package_lists_every_variable() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = dir.path().join("checkpoints");
        fs::create_dir_all(&checkpoints)?;
        let id = CheckpointId {
            model_name: "input".to_owned(),
            global_step: 9,
        };
        let weights = HashMap::from([
            (
                "cell0.weight_ih_l0".to_owned(),
                Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu)?,
            ),
            ("to_logits.bias".to_owned(), Tensor::new(&[0.5f32], &Device::Cpu)?),
        ]);
        candle_core::safetensors::save(&weights, checkpoints.join(id.file_name()))?;

        let vocab = Vocabulary::from_corpus("aab");
        let out = PackageExporter.export(&ExportRequest {
            checkpoint_dir: &checkpoints,
            export_dir: &dir.path().join("models"),
            vocab: &vocab,
            model_name: "input",
            checkpoint: &id,
        })?;

        let manifest: BTreeMap<String, ManifestEntry> =
            serde_json::from_str(&fs::read_to_string(out.join("manifest.json"))?)?;
        let entry = &manifest["cell0.weight_ih_l0"];
        assert_eq!(entry.shape, [2, 2]);
        assert_eq!(fs::read(out.join(&entry.filename))?.len(), 16);
        assert_eq!(manifest["to_logits.bias"].filename, "to_logits_bias");

        let table: BTreeMap<String, u32> =
            serde_json::from_str(&fs::read_to_string(out.join("vocab.json"))?)?;
        assert_eq!(table["a"], 0);
        assert_eq!(table["b"], 1);
        Ok(())
    }
}
