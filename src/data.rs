use crate::error::{Result, RunError};
use candle_core::{Device, Tensor};

/// One `(x, y)` training pair, both `batch_size x seq_length`, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub x: Vec<u32>,
    pub y: Vec<u32>,
    pub batch_size: usize,
    pub seq_length: usize,
}

impl Batch {
    #[cfg(test)]
    fn x_row(&self, i: usize) -> &[u32] {
        &self.x[i * self.seq_length..(i + 1) * self.seq_length]
    }

    #[cfg(test)]
    fn y_row(&self, i: usize) -> &[u32] {
        &self.y[i * self.seq_length..(i + 1) * self.seq_length]
    }

    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let shape = (self.batch_size, self.seq_length);
        let x = Tensor::from_slice(&self.x, shape, device)?;
        let y = Tensor::from_slice(&self.y, shape, device)?;
        Ok((x, y))
    }
}

/// Walks an encoded corpus in fixed-shape batches.
///
/// The truncated tensor is laid out as `batch_size` contiguous rows, and batch `k` is the `k`-th
/// `seq_length`-wide column slice of those rows, so row `i` of batch `k + 1` continues row `i` of
/// batch `k`. Targets are the flat tensor shifted left by one; the very last target wraps around
/// to the first character of the corpus.
pub struct Batcher {
    tensor: Vec<u32>,
    batch_size: usize,
    seq_length: usize,
    num_batches: usize,
    pointer: usize,
}

impl Batcher {
    pub fn new(mut tensor: Vec<u32>, batch_size: usize, seq_length: usize) -> Result<Self> {
        let required = batch_size * seq_length;
        let num_batches = if required == 0 { 0 } else { tensor.len() / required };
        if num_batches == 0 {
            return Err(RunError::InsufficientData {
                tensor_len: tensor.len(),
                required,
            });
        }
        tensor.truncate(num_batches * required);
        Ok(Self {
            tensor,
            batch_size,
            seq_length,
            num_batches,
            pointer: 0,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn pointer(&self) -> usize {
        self.pointer
    }

    pub fn reset(&mut self) {
        self.pointer = 0;
    }

    /// Returns `None` once all `num_batches` batches of the current pass have been handed out.
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.pointer >= self.num_batches {
            return None;
        }
        let batch = self.batch_at(self.pointer);
        self.pointer += 1;
        Some(batch)
    }

    fn batch_at(&self, k: usize) -> Batch {
        let total = self.tensor.len();
        let row_len = self.num_batches * self.seq_length;
        let mut x = Vec::with_capacity(self.batch_size * self.seq_length);
        let mut y = Vec::with_capacity(self.batch_size * self.seq_length);
        for i in 0..self.batch_size {
            let start = i * row_len + k * self.seq_length;
            for flat in start..start + self.seq_length {
                x.push(self.tensor[flat]);
                y.push(self.tensor[(flat + 1) % total]);
            }
        }
        Batch {
            x,
            y,
            batch_size: self.batch_size,
            seq_length: self.seq_length,
        }
    }
}
