use crate::config::{ModelKind, TrainConfig};
use crate::data::Batch;
use crate::error::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::rnn::{gru, lstm, GRUConfig, GRUState, LSTMConfig, LSTMState, GRU, LSTM, RNN};
use candle_nn::{
    embedding, linear, linear_no_bias, loss::cross_entropy, ops, AdamW, Embedding, Linear,
    Module, Optimizer, ParamsAdamW, VarBuilder, VarMap,
};
use std::path::Path;

/// Hidden and cell arrays of one layer, each `batch_size x rnn_size`. Cells without a separate
/// memory (`rnn`, `gru`) carry `c` through unchanged.
#[derive(Debug, Clone)]
pub struct LayerState {
    pub h: Tensor,
    pub c: Tensor,
}

#[derive(Debug, Clone)]
pub struct RecurrentState {
    pub layers: Vec<LayerState>,
}

/// The numeric side of training: everything the orchestrator needs from a model.
pub trait SequenceModel {
    fn initial_state(&self) -> Result<RecurrentState>;

    /// Runs forward and backward on one batch starting from `state` and applies one optimizer
    /// update. Returns the mean loss and the state after the last time step.
    fn train_step(&mut self, batch: &Batch, state: &RecurrentState) -> Result<(f32, RecurrentState)>;

    fn set_learning_rate(&mut self, lr: f64);

    fn save(&self, path: &Path) -> Result<()>;

    fn restore(&mut self, path: &Path) -> Result<()>;
}

enum Cell {
    Rnn { ih: Linear, hh: Linear },
    Gru(GRU),
    Lstm(LSTM),
}

impl Cell {
    fn new(kind: ModelKind, in_dim: usize, hidden: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(match kind {
            ModelKind::Rnn => Cell::Rnn {
                ih: linear(in_dim, hidden, vb.pp("ih"))?,
                hh: linear_no_bias(hidden, hidden, vb.pp("hh"))?,
            },
            ModelKind::Gru => Cell::Gru(gru(in_dim, hidden, GRUConfig::default(), vb)?),
            ModelKind::Lstm => Cell::Lstm(lstm(in_dim, hidden, LSTMConfig::default(), vb)?),
        })
    }

    fn step(&self, x: &Tensor, state: &LayerState) -> candle_core::Result<LayerState> {
        match self {
            Cell::Rnn { ih, hh } => {
                let h = ih.forward(x)?.add(&hh.forward(&state.h)?)?.tanh()?;
                Ok(LayerState {
                    h,
                    c: state.c.clone(),
                })
            }
            Cell::Gru(cell) => {
                let next = cell.step(x, &GRUState { h: state.h.clone() })?;
                Ok(LayerState {
                    h: next.h,
                    c: state.c.clone(),
                })
            }
            Cell::Lstm(cell) => {
                let prev = LSTMState {
                    h: state.h.clone(),
                    c: state.c.clone(),
                };
                let next = cell.step(x, &prev)?;
                Ok(LayerState {
                    h: next.h,
                    c: next.c,
                })
            }
        }
    }
}

/// Character-level language model: embedding, stacked recurrent cells unrolled over the
/// sequence, projection back to the vocabulary. Owns its parameters and optimizer.
pub struct CharRnn {
    token_emb: Embedding,
    cells: Vec<Cell>,
    to_logits: Linear,
    varmap: VarMap,
    optim: AdamW,
    batch_size: usize,
    rnn_size: usize,
    input_drop: f32,
    output_drop: f32,
    grad_clip: f64,
    device: Device,
}

impl CharRnn {
    pub fn new(cfg: &TrainConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let token_emb = embedding(cfg.vocab_size, cfg.rnn_size, vb.pp("embedding"))?;
        let mut cells = Vec::with_capacity(cfg.num_layers);
        for i in 0..cfg.num_layers {
            cells.push(Cell::new(
                cfg.model,
                cfg.rnn_size,
                cfg.rnn_size,
                vb.pp(format!("cell{i}")),
            )?);
        }
        let to_logits = linear(cfg.rnn_size, cfg.vocab_size, vb.pp("to_logits"))?;

        let params = ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: 0.0,
            ..ParamsAdamW::default()
        };
        let optim = AdamW::new(varmap.all_vars(), params)?;

        Ok(Self {
            token_emb,
            cells,
            to_logits,
            varmap,
            optim,
            batch_size: cfg.batch_size,
            rnn_size: cfg.rnn_size,
            input_drop: (1.0 - cfg.input_keep_prob) as f32,
            output_drop: (1.0 - cfg.output_keep_prob) as f32,
            grad_clip: cfg.grad_clip,
            device: device.clone(),
        })
    }

    fn forward(&self, xs: &Tensor, state: &RecurrentState) -> candle_core::Result<(Tensor, RecurrentState)> {
        let seq_len = xs.dims()[1];
        let mut emb = self.token_emb.forward(xs)?;
        if self.input_drop > 0.0 {
            emb = ops::dropout(&emb, self.input_drop)?;
        }

        let mut layers = state.layers.clone();
        let mut outputs = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let mut out = emb.i((.., t, ..))?.contiguous()?;
            for (cell, layer) in self.cells.iter().zip(layers.iter_mut()) {
                *layer = cell.step(&out, layer)?;
                out = layer.h.clone();
            }
            outputs.push(out);
        }

        let mut out = Tensor::stack(&outputs, 1)?;
        if self.output_drop > 0.0 {
            out = ops::dropout(&out, self.output_drop)?;
        }
        let logits = self.to_logits.forward(&out)?;
        Ok((logits, RecurrentState { layers }))
    }

    /// Scales all gradients down so their global L2 norm is at most `grad_clip`.
    fn clip_gradients(&self, grads: &mut candle_core::backprop::GradStore) -> candle_core::Result<()> {
        let vars = self.varmap.all_vars();
        let mut sq_norm = 0f32;
        for var in vars.iter() {
            if let Some(g) = grads.get(var) {
                sq_norm += g.sqr()?.sum_all()?.to_vec0::<f32>()?;
            }
        }
        let norm = sq_norm.sqrt() as f64;
        if norm <= self.grad_clip {
            return Ok(());
        }
        let scale = self.grad_clip / norm;
        for var in vars.iter() {
            if let Some(g) = grads.remove(var) {
                grads.insert(var, g.affine(scale, 0.)?);
            }
        }
        Ok(())
    }
}

impl SequenceModel for CharRnn {
    fn initial_state(&self) -> Result<RecurrentState> {
        let zeros = Tensor::zeros((self.batch_size, self.rnn_size), DType::F32, &self.device)?;
        let layers = self
            .cells
            .iter()
            .map(|_| LayerState {
                h: zeros.clone(),
                c: zeros.clone(),
            })
            .collect();
        Ok(RecurrentState { layers })
    }

    fn train_step(&mut self, batch: &Batch, state: &RecurrentState) -> Result<(f32, RecurrentState)> {
        let (xs, ys) = batch.to_tensors(&self.device)?;
        let (logits, next) = self.forward(&xs, state)?;
        let vocab = logits.dims()[2];
        let loss = cross_entropy(&logits.reshape(((), vocab))?, &ys.flatten_all()?)?;

        let mut grads = loss.backward()?;
        self.clip_gradients(&mut grads)?;
        self.optim.step(&grads)?;

        // truncated backprop: the next batch starts from values, not from this graph
        let layers = next
            .layers
            .into_iter()
            .map(|l| LayerState {
                h: l.h.detach(),
                c: l.c.detach(),
            })
            .collect();
        Ok((loss.to_vec0::<f32>()?, RecurrentState { layers }))
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.optim.set_learning_rate(lr);
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    fn restore(&mut self, path: &Path) -> Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }
}
