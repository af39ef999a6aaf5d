//! Crate-wide error type.

use std::{io, path::PathBuf};

use burn::record::RecorderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unable to read or write model weights: {0}")]
    Record(#[from] RecorderError),

    /// The saved model doesn't match the model we are trying to load it into, e.g. after
    /// changing the depth or hidden size between training and evaluation.
    #[error("Checkpoint at {path:?} does not match the model: {reason}")]
    CheckpointMismatch { path: PathBuf, reason: String },

    #[error("Unknown optimizer '{0}'. Expected one of: Adam, AdamW, SGD")]
    UnknownOptimizer(String),

    #[error("Invalid SMILES: {0}")]
    Smiles(String),

    #[error("Invalid token sequence: {0}")]
    InvalidSequence(String),

    #[error("Symbol {0:?} is not in the vocabulary")]
    UnknownSymbol(char),

    #[error("Invalid vocabulary: {0}")]
    InvalidVocabulary(String),

    #[error("Tensor error: {0}")]
    Tensor(String),

    #[error("Unable to sample a token: {0}")]
    Sampling(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
