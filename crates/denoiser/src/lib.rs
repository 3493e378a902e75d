//! Demucs speech enhancement (Rust) core library.
//!
//! This crate provides:
//! - Length-recovering encoder/decoder forward pass (`model`)
//! - Band-limited resampling (`resample`)
//! - Safetensors weight loading with shape checks (`weights`, `stage`)
//! - Load-time numeric precision policies (`quantize`)
//! - WAV I/O and batch/chunked processing helpers (`audio`, `pipeline`)

pub mod audio;
pub mod config;
pub mod constants;
pub mod conv;
pub mod lstm;
pub mod math;
pub mod model;
pub mod ops;
pub mod pipeline;
pub mod quantize;
pub mod resample;
pub mod stage;
pub mod weights;

use weights::WeightError;

/// Errors raised while building or running the filter.
#[derive(Debug, thiserror::Error)]
pub enum DenoiserError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("weight shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("computation error: {0}")]
    Computation(String),
    #[error(transparent)]
    Weights(#[from] WeightError),
}

pub type Result<T, E = DenoiserError> = std::result::Result<T, E>;
