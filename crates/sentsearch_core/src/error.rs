use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    /// An embedding, similarity, or ANN provider call failed or returned
    /// malformed output.
    #[error("provider error: {0}")]
    Provider(String),

    /// A persisted index is missing, corrupt, or shape-inconsistent.
    #[error("index load error at {path}: {reason}")]
    IndexLoad { path: PathBuf, reason: String },

    /// A relation references a query or collection id that does not exist.
    #[error("relation integrity error: {0}")]
    RelationIntegrity(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl SearchError {
    pub fn index_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SearchError::IndexLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;
