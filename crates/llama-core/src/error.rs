use std::path::Path;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlamaError {
    #[error("Failed to load model from '{path}': {reason}")]
    ModelLoadFailed { path: String, reason: String },

    #[error("Model not loaded")]
    ModelNotLoaded,

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizationFailed(String),

    #[error("Chat formatting failed: {0}")]
    FormatFailed(String),

    #[error("Context is busy with another call")]
    Busy,
}

impl LlamaError {
    pub fn load(path: &Path, reason: impl Into<String>) -> Self {
        Self::ModelLoadFailed {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelLoadFailed { .. } => ErrorKind::Load,
            Self::ModelNotLoaded => ErrorKind::NotLoaded,
            Self::InferenceFailed(_) | Self::TokenizationFailed(_) => ErrorKind::Inference,
            Self::FormatFailed(_) => ErrorKind::Format,
            Self::Busy => ErrorKind::Busy,
        }
    }
}

/// Coarse error category surfaced to host code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Load,
    NotLoaded,
    Inference,
    Format,
    Busy,
}

pub type Result<T> = std::result::Result<T, LlamaError>;
