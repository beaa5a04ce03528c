//! Experiment header parsing and validation.
//!
//! The header precedes the log body and consists of `exp: <category>:
//! <value>` lines. A line holding only `----` ends it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::error::{AnalysisError, AnalysisResult};
use crate::analyzer::types::NodeId;

/// Line terminating the header block.
pub const HEADER_SENTINEL: &str = "----";

const HEADER_PREFIX: &str = "exp: ";

/// Largest testbed allocation accepted.
const MAX_NODES: usize = 10000;

/// Per-role setup: firmware image and the nodes flashed with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSetup {
    pub fwpath: Option<String>,
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMeta {
    pub name: String,
    pub site: Option<String>,
    /// Planned duration as written by the driver (seconds).
    pub duration: Option<f64>,
    pub logfile: Option<String>,
    pub nodes: Vec<NodeId>,
    pub setups: BTreeMap<String, RoleSetup>,
    pub expvars: BTreeMap<String, String>,
    /// Every other category, first occurrence wins.
    pub extra: BTreeMap<String, String>,
}

/// Split `exp: <category>: <value>` into category and value.
pub fn parse_header_line(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_end().strip_prefix(HEADER_PREFIX)?;
    let (cat, val) = rest.split_once(": ")?;
    let valid = !cat.is_empty() && cat.chars().all(|c| c.is_ascii_alphanumeric() || "-._".contains(c));
    valid.then_some((cat, val))
}

/// `['a', 'b']` as written by the experiment driver.
fn parse_node_list(value: &str) -> Vec<NodeId> {
    value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|n| n.trim().trim_matches(|c| c == '\'' || c == '"'))
        .filter(|n| !n.is_empty())
        .map(NodeId::from)
        .collect()
}

impl ExperimentMeta {
    /// Build metadata from header lines; stops at the sentinel.
    pub fn from_header<'a>(lines: impl IntoIterator<Item = &'a str>) -> AnalysisResult<Self> {
        let mut meta = ExperimentMeta::default();
        let mut seen: HashSet<String> = HashSet::new();

        for line in lines {
            if line.trim_end() == HEADER_SENTINEL {
                break;
            }
            let Some((cat, val)) = parse_header_line(line) else {
                continue;
            };
            if !seen.insert(cat.to_string()) {
                continue;
            }
            meta.apply(cat, val);
        }

        meta.nodes.sort();
        validate_meta(&meta).map_err(AnalysisError::Metadata)?;
        Ok(meta)
    }

    fn apply(&mut self, cat: &str, val: &str) {
        match cat {
            "name" => self.name = val.to_string(),
            "site" => self.site = Some(val.to_string()),
            "logfile" => self.logfile = Some(val.to_string()),
            "duration" => match val.trim().parse() {
                Ok(secs) => self.duration = Some(secs),
                Err(_) => log::warn!("header: unreadable duration '{}'", val),
            },
            "used_nodes" => self.nodes = parse_node_list(val),
            _ => {
                if let Some(var) = cat.strip_prefix("expvars.") {
                    self.expvars.insert(var.to_string(), val.to_string());
                } else if let Some((role, field)) = cat.strip_prefix("setup.").and_then(|r| r.rsplit_once('.')) {
                    let setup = self.setups.entry(role.to_string()).or_default();
                    match field {
                        "fwpath" => setup.fwpath = Some(val.to_string()),
                        "node" => setup.nodes = parse_node_list(val),
                        _ => {
                            self.extra.insert(cat.to_string(), val.to_string());
                        }
                    }
                } else {
                    self.extra.insert(cat.to_string(), val.to_string());
                }
            }
        }
    }

    /// Role of `node` according to the setup sections.
    pub fn role_of(&self, node: &NodeId) -> Option<&str> {
        self.setups
            .iter()
            .find(|(_, setup)| setup.nodes.contains(node))
            .map(|(role, _)| role.as_str())
    }
}

/// Validate parsed metadata before any tracker is built.
///
/// # Returns
///
/// `Ok(())` if validation passes, `Err(String)` with error description otherwise.
pub fn validate_meta(meta: &ExperimentMeta) -> Result<(), String> {
    if meta.nodes.is_empty() {
        return Err("header must list at least one node in 'used_nodes'".to_string());
    }
    if meta.nodes.len() > MAX_NODES {
        return Err(format!("node count {} exceeds maximum of {}", meta.nodes.len(), MAX_NODES));
    }

    let mut ids = HashSet::new();
    for node in &meta.nodes {
        if !ids.insert(node) {
            return Err(format!("duplicate node found: {}", node));
        }
    }

    for (role, setup) in &meta.setups {
        if let Some(stray) = setup.nodes.iter().find(|n| !ids.contains(n)) {
            return Err(format!("setup '{}' uses node {} which is not in 'used_nodes'", role, stray));
        }
    }

    if let Some(duration) = meta.duration {
        if duration < 0.0 {
            return Err(format!("invalid duration {}, must be non-negative", duration));
        }
    }
    Ok(())
}
