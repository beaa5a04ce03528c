//! Error type shared by the loader, configuration and snapshot code.

use std::path::PathBuf;

/// Errors that stop an analysis before or after the event stream.
///
/// Nothing observed inside the log body is an error: malformed lines are
/// dropped and semantic inconsistencies are logged and kept as diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid experiment header: {0}")]
    Metadata(String),

    #[error("invalid configuration {}: {message}", .path.display())]
    Config { path: PathBuf, message: String },

    #[error("snapshot {} is unusable: {source}", .path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("view bin size {bin}s over a {span}s span exceeds {max} bins")]
    TooManyBins { bin: f64, span: f64, max: usize },
}

impl AnalysisError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AnalysisError::Io { path: path.into(), source }
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
