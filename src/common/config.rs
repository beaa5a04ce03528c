//! Analysis configuration loaded from an optional TOML file.
//!
//! ```toml
//! liveness-threshold = 10
//! flow-key-policy = { split-after-idle = 30.0 }
//!
//! [nodes.nrf52dk-1]
//! mac = "c2:a1:5d:89:54:03"
//! l2addr = "c2:a1:5d:89:54:03"
//!
//! [buffer-pool]
//! count = 40
//! size = 264
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::error::{AnalysisError, AnalysisResult};
use super::node_directory::NodeAddress;
use crate::analyzer::conservation::{ConservationRule, default_rules};
use crate::analyzer::flows::KeyPolicy;
use crate::analyzer::iface::default_watched_threads;
use crate::analyzer::liveness::DEFAULT_BROKEN_THRESHOLD;
use crate::analyzer::topology::TopologyVocabulary;

/// Packet buffer pool geometry of the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BufferPool {
    pub count: u32,
    pub size: u32,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self { count: 40, size: 264 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AnalysisConfig {
    /// Node name to configured addresses.
    pub nodes: BTreeMap<String, NodeAddress>,
    pub liveness_threshold: u32,
    /// Overrides the vocabulary derived from the experiment name.
    pub topology_vocabulary: Option<TopologyVocabulary>,
    pub flow_key_policy: KeyPolicy,
    pub conservation_rules: Vec<ConservationRule>,
    /// Thread name to expected `ps` state.
    pub watched_threads: BTreeMap<String, String>,
    pub buffer_pool: BufferPool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            nodes: BTreeMap::new(),
            liveness_threshold: DEFAULT_BROKEN_THRESHOLD,
            topology_vocabulary: None,
            flow_key_policy: KeyPolicy::Merge,
            conservation_rules: default_rules(),
            watched_threads: default_watched_threads(),
            buffer_pool: BufferPool::default(),
        }
    }
}

impl AnalysisConfig {
    /// Load configuration from a TOML file.
    pub fn load(config_path: &Path) -> AnalysisResult<Self> {
        let content = std::fs::read_to_string(config_path).map_err(|e| AnalysisError::io(config_path, e))?;
        Self::from_toml(&content).map_err(|message| AnalysisError::Config {
            path: config_path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| format!("Failed to parse config file: {}", e))
    }

    /// Load `path` if given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> AnalysisResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Derive the config path from a log file path.
    ///
    /// Replaces the log filename with "config.toml" in the same directory.
    pub fn config_path_for_log(log_path: &Path) -> PathBuf {
        log_path.parent().unwrap_or(Path::new(".")).join("config.toml")
    }
}
