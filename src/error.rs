//! Error type shared by the library.
//!
//! Shape mismatches inside tensor math stay panics (they are programming
//! errors); everything that depends on files, downloads or user input comes
//! back as a [`FinetuneError`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while loading data, models or running an experiment.
#[derive(Debug, Error)]
pub enum FinetuneError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("HuggingFace hub error for {repo}: {message}")]
    Hub { repo: String, message: String },

    #[error("dataset error in {path}: {message}")]
    Dataset { path: PathBuf, message: String },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("model files error: {0}")]
    ModelFiles(String),

    #[error("weights error: {0}")]
    Weights(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FinetuneError {
    pub(crate) fn dataset(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Dataset {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FinetuneError>;
