//! Persisted analysis state.
//!
//! Parsing a large log is the expensive part of a run, so the finished
//! [`Analysis`] can be written to a JSON snapshot and loaded back later.
//! A loaded snapshot renders the same summary text as the run that wrote it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::analysis::Analysis;
use crate::common::{AnalysisError, AnalysisResult};

/// Bumped whenever the serialized tracker layout changes.
pub const SNAPSHOT_FORMAT: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format: u32,
    pub analysis: Analysis,
}

impl Snapshot {
    pub fn capture(analysis: &Analysis) -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            analysis: analysis.clone(),
        }
    }

    pub fn into_analysis(self) -> Analysis {
        self.analysis
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Write the snapshot to `path`.
    pub fn save(&self, path: &Path) -> AnalysisResult<()> {
        let json = self.to_json().map_err(|source| AnalysisError::Snapshot {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|e| AnalysisError::io(path, e))?;
        log::info!("Snapshot written to {}", path.display());
        Ok(())
    }

    /// Read a snapshot from `path`.
    ///
    /// Snapshots of another format version are loaded with a warning; the
    /// decoder fails on its own if the layout no longer matches.
    pub fn load(path: &Path) -> AnalysisResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| AnalysisError::io(path, e))?;
        let snapshot = Self::from_json(&content).map_err(|source| AnalysisError::Snapshot {
            path: path.to_path_buf(),
            source,
        })?;
        if snapshot.format != SNAPSHOT_FORMAT {
            log::warn!(
                "{}: snapshot format {} differs from current format {}",
                path.display(),
                snapshot.format,
                SNAPSHOT_FORMAT
            );
        }
        Ok(snapshot)
    }
}
