//! Character-level recurrent language model training: corpus batching, resumable runs with
//! rotating checkpoints, and export of the final model.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod metrics;
pub mod model;
pub mod resume;
pub mod train;
pub mod vocab;
