// src/error.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoraError {
    #[error("invalid LoRA rank {rank}: rank must be at least 1")]
    InvalidRank { rank: usize },

    #[error("layer `{layer}` already has an adapter attached")]
    AlreadyAdapted { layer: String },

    #[error("layer `{layer}` has no adapter attached")]
    NotAdapted { layer: String },

    #[error("shape mismatch: adapter produces {expected:?}, base weight is {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("non-finite loss {value} at iteration {iteration}")]
    NonFiniteLoss { iteration: usize, value: f32 },

    #[error("base weights of layer `{layer}` changed during fine-tuning")]
    BaseWeightsChanged { layer: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("dataset error: {0}")]
    Dataset(String),
}

pub type Result<T> = std::result::Result<T, LoraError>;
