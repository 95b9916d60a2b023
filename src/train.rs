use crate::checkpoint::{CheckpointId, CheckpointStore};
use crate::config::{corpus_stem, TrainConfig};
use crate::data::Batcher;
use crate::error::{Result, RunError};
use crate::export::{CheckpointExporter, ExportRequest};
use crate::metrics::{StepLogger, StepMetrics};
use crate::model::SequenceModel;
use crate::resume::validate_resume;
use crate::vocab::{load_corpus, CorpusCache, VocabArtifact, Vocabulary};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything a run needs before the model exists: validated config, encoded corpus, run
/// directory, and the checkpoint to resume from if any.
pub struct Session {
    pub cfg: TrainConfig,
    pub model_name: String,
    pub save_dir: PathBuf,
    pub vocab: Vocabulary,
    pub batcher: Batcher,
    pub resume_from: Option<PathBuf>,
}

impl Session {
    /// Loads the corpus, checks a resume target and writes `config.json` and `chars_vocab.json`
    /// to the run directory. Resume validation happens first so a run resumed from its own
    /// directory is compared against the previous artifacts.
    pub fn prepare(mut cfg: TrainConfig, cache: &dyn CorpusCache) -> Result<Self> {
        cfg.validate()?;
        let model_name = corpus_stem(&cfg.data_path);
        let save_dir = cfg.save_checkpoints.join(&model_name);
        fs::create_dir_all(&save_dir)?;

        let corpus = load_corpus(&cfg.data_path, &model_name, cache)?;
        cfg.vocab_size = corpus.vocab.len();
        let batcher = Batcher::new(corpus.tensor, cfg.batch_size, cfg.seq_length)?;
        tracing::info!(
            "{} characters, vocabulary of {}, {} batches per epoch",
            batcher.num_batches() * cfg.batch_size * cfg.seq_length,
            cfg.vocab_size,
            batcher.num_batches()
        );

        let resume_from = match &cfg.init_from {
            Some(dir) => Some(validate_resume(dir, &cfg, &corpus.vocab)?),
            None => None,
        };

        cfg.save(&save_dir)?;
        VocabArtifact::save(&corpus.vocab, &save_dir)?;

        Ok(Self {
            cfg,
            model_name,
            save_dir,
            vocab: corpus.vocab,
            batcher,
            resume_from,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Training { epoch: usize, batch: usize },
    Completed,
    Aborted,
}

#[derive(Debug)]
pub struct RunSummary {
    pub final_checkpoint: CheckpointId,
    pub global_steps: usize,
    pub last_loss: f32,
    pub elapsed: Duration,
    /// Outcome of the export; a failure here does not undo the training run.
    pub export: Result<PathBuf>,
}

struct EpochsDone {
    final_checkpoint: CheckpointId,
    global_steps: usize,
    last_loss: f32,
}

pub struct Trainer<M: SequenceModel> {
    session: Session,
    model: M,
    store: CheckpointStore,
    state: RunState,
    stop: Option<Arc<AtomicBool>>,
    out: Box<dyn Write>,
}

impl<M: SequenceModel> Trainer<M> {
    pub fn new(session: Session, model: M) -> Self {
        let store = CheckpointStore::new(&session.save_dir, &session.model_name);
        Self {
            session,
            model,
            store,
            state: RunState::NotStarted,
            stop: None,
            out: Box::new(io::stdout()),
        }
    }

    /// The flag is polled between batches; once set the run aborts before the next step.
    pub fn with_stop_signal(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Progress lines go to stdout unless redirected here.
    pub fn with_output(mut self, out: impl Write + 'static) -> Self {
        self.out = Box::new(out);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn run(&mut self, exporter: &dyn CheckpointExporter) -> Result<RunSummary> {
        let started = Instant::now();
        let done = match self.train_epochs(started) {
            Ok(done) => done,
            Err(e) => {
                self.state = RunState::Aborted;
                tracing::error!("training aborted: {e}");
                return Err(e);
            }
        };

        let export = exporter.export(&ExportRequest {
            checkpoint_dir: self.store.dir(),
            export_dir: &self.session.cfg.save_model,
            vocab: &self.session.vocab,
            model_name: &self.session.model_name,
            checkpoint: &done.final_checkpoint,
        });
        if let Err(e) = &export {
            tracing::error!("export of {} failed: {e}", done.final_checkpoint);
        }

        self.state = RunState::Completed;
        let elapsed = started.elapsed();
        if self.session.cfg.total_time {
            writeln!(self.out, "Total time: {:.3}s", elapsed.as_secs_f64())?;
        }
        Ok(RunSummary {
            final_checkpoint: done.final_checkpoint,
            global_steps: done.global_steps,
            last_loss: done.last_loss,
            elapsed,
            export,
        })
    }

    fn train_epochs(&mut self, started: Instant) -> Result<EpochsDone> {
        if let Some(path) = &self.session.resume_from {
            self.model.restore(path)?;
        }

        let Session { cfg, batcher, .. } = &mut self.session;
        let mut logger = StepLogger::new(&cfg.log_dir)?;
        let num_batches = batcher.num_batches();
        let total_steps = cfg.num_epochs * num_batches;
        let mut final_checkpoint = None;
        let mut last_loss = f32::NAN;

        for e in 0..cfg.num_epochs {
            let lr = cfg.learning_rate_at(e);
            self.model.set_learning_rate(lr);
            batcher.reset();
            let mut state = self.model.initial_state()?;
            let mut loss_sum = 0f64;

            while let Some(batch) = batcher.next_batch() {
                let b = batcher.pointer() - 1;
                let global_step = e * num_batches + b;
                if self
                    .stop
                    .as_ref()
                    .is_some_and(|stop| stop.load(Ordering::Relaxed))
                {
                    return Err(RunError::Interrupted(global_step));
                }
                self.state = RunState::Training { epoch: e, batch: b };

                let start = Instant::now();
                let (loss, next) = self.model.train_step(&batch, &state)?;
                state = next;
                let seconds = start.elapsed().as_secs_f64();

                last_loss = loss;
                loss_sum += loss as f64;
                logger.log(&StepMetrics {
                    global_step,
                    epoch: e,
                    loss,
                    learning_rate: lr,
                    seconds,
                })?;

                if global_step % cfg.print_every == 0 {
                    writeln!(
                        self.out,
                        "{}/{} (epoch {}), train_loss = {:.3}, running_loss = {:.3}, time/batch = {:.3}",
                        global_step,
                        total_steps,
                        e,
                        loss,
                        loss_sum / (b + 1) as f64,
                        seconds
                    )?;
                }

                let last_batch = e + 1 == cfg.num_epochs && b + 1 == num_batches;
                if global_step % cfg.save_every == 0 || last_batch {
                    final_checkpoint = Some(self.store.rotate(&self.model, global_step)?);
                    if cfg.total_time {
                        writeln!(
                            self.out,
                            "Training time: {:.3}s",
                            started.elapsed().as_secs_f64()
                        )?;
                    }
                }
            }
        }
        logger.flush()?;
        self.out.flush()?;

        let final_checkpoint = final_checkpoint
            .ok_or_else(|| RunError::Config("num_epochs must be greater than zero".to_owned()))?;
        Ok(EpochsDone {
            final_checkpoint,
            global_steps: total_steps,
            last_loss,
        })
    }
}
