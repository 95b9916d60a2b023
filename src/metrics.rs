use crate::error::Result;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct StepMetrics {
    pub global_step: usize,
    pub epoch: usize,
    pub loss: f32,
    pub learning_rate: f64,
    pub seconds: f64,
}

/// Appends one CSV row per training step to `<log_dir>/run-<unix seconds>/train_log.csv`.
pub struct StepLogger {
    csv_path: PathBuf,
    out: BufWriter<File>,
}

impl StepLogger {
    pub fn new(log_dir: &Path) -> Result<Self> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let dir = log_dir.join(format!("run-{stamp}"));
        fs::create_dir_all(&dir)?;
        let csv_path = dir.join("train_log.csv");
        let mut out = BufWriter::new(File::create(&csv_path)?);
        writeln!(out, "step,epoch,loss,learning_rate,seconds")?;
        tracing::debug!("logging steps to '{}'", csv_path.display());
        Ok(Self { csv_path, out })
    }

    pub fn log(&mut self, m: &StepMetrics) -> Result<()> {
        writeln!(
            self.out,
            "{},{},{:.6},{:.6e},{:.6}",
            m.global_step, m.epoch, m.loss, m.learning_rate, m.seconds
        )?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = StepLogger::new(dir.path()).unwrap();
        logger
            .log(&StepMetrics {
                global_step: 3,
                epoch: 1,
                loss: 2.5,
                learning_rate: 0.002,
                seconds: 0.25,
            })
            .unwrap();
        logger.flush().unwrap();

        let csv = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], "step,epoch,loss,learning_rate,seconds");
        assert!(lines[1].starts_with("3,1,2.500000,"));
    }
}
