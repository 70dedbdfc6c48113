//! Crate-wide error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Busy(String),

    #[error("{target} is currently being updated")]
    AlreadyUpdating { target: String },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    Command(String),

    #[error("{0}")]
    NoProvider(String),

    #[error("{0}")]
    Transaction(String),

    #[error("{0}")]
    Update(String),

    #[error("{0}")]
    Github(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl UpdateError {
    /// HTTP-style status code for the web layer that forwards these errors.
    pub fn status_code(&self) -> u16 {
        match self {
            UpdateError::NotFound(_) => 404,
            UpdateError::Busy(_) => 503,
            UpdateError::AlreadyUpdating { .. }
            | UpdateError::Unsupported(_)
            | UpdateError::Config(_) => 400,
            _ => 500,
        }
    }
}
