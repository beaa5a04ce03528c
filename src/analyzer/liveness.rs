//! Heartbeat (`ALIVE-<seq>`) continuity per node.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::NodeId;

/// Nodes with fewer heartbeats than this over the whole log are flagged.
pub const DEFAULT_BROKEN_THRESHOLD: u32 = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    /// Largest sequence number seen so far.
    pub max: Option<u32>,
    pub count: u32,
    /// For every jump, the sequence number right before the new one.
    pub gaps: Vec<u32>,
    /// Repeats of the current maximum.
    pub duplicates: Vec<u32>,
    /// Sequence numbers arriving below the current maximum.
    pub reordered: Vec<u32>,
}

impl LivenessRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, seq: u32) {
        match self.max {
            None => {}
            Some(max) if seq == max => self.duplicates.push(seq),
            Some(max) if seq < max => self.reordered.push(seq),
            Some(max) if seq > max + 1 => self.gaps.push(seq - 1),
            Some(_) => {}
        }
        self.max = Some(self.max.map_or(seq, |max| max.max(seq)));
        self.count += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessTracker {
    threshold: u32,
    used: bool,
    records: BTreeMap<NodeId, LivenessRecord>,
}

impl LivenessTracker {
    pub fn new(nodes: &[NodeId], threshold: u32) -> Self {
        Self {
            threshold,
            used: false,
            records: nodes.iter().map(|n| (n.clone(), LivenessRecord::new())).collect(),
        }
    }

    pub fn heartbeat(&mut self, node: &NodeId, seq: u32) {
        self.used = true;
        self.records.entry(node.clone()).or_default().observe(seq);
    }

    /// Whether any heartbeat was seen at all.
    pub fn used(&self) -> bool {
        self.used
    }

    pub fn records(&self) -> &BTreeMap<NodeId, LivenessRecord> {
        &self.records
    }

    pub fn record(&self, node: &NodeId) -> Option<&LivenessRecord> {
        self.records.get(node)
    }

    /// Nodes whose heartbeat count stayed below the threshold.
    pub fn broken_nodes(&self) -> Vec<NodeId> {
        self.records
            .iter()
            .filter(|(_, r)| r.count < self.threshold)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Diagnostic pass after ingestion. Broken nodes are a warning only.
    pub fn finish(&self) {
        if !self.used {
            return;
        }
        let broken = self.broken_nodes();
        if !broken.is_empty() {
            let names: Vec<&str> = broken.iter().map(|n| n.as_str()).collect();
            log::warn!("ALIVE: nodes {:?} seem to be broken, bad heartbeat count", names);
        }
    }
}
