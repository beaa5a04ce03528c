//! Dynamic parent/child topology built from connection events.
//!
//! A node reporting `connect` for a peer becomes that peer's parent; a
//! `close` removes the edge again. Hop distances are derived after the
//! stream in [`TopologyTracker::compute_hops`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::types::{NodeId, TimeWindow, Timestamp};

/// Event names that connect and disconnect a child in the generic
/// vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TopologyVocabulary {
    pub connect: String,
    pub close: String,
}

impl TopologyVocabulary {
    /// Mesh connection experiments report their children as downlinks.
    pub fn for_experiment(name: &str) -> Self {
        if name.contains("meshconn") {
            Self { connect: "conn_downlink".into(), close: "close_downlink".into() }
        } else {
            Self { connect: "conn_s".into(), close: "close_s".into() }
        }
    }
}

impl Default for TopologyVocabulary {
    fn default() -> Self {
        Self::for_experiment("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyAction {
    Connect,
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyEvent {
    pub time: Timestamp,
    pub action: TopologyAction,
    pub node: NodeId,
    pub peer: NodeId,
    pub handle: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyNode {
    pub parent: Option<NodeId>,
    pub children: BTreeSet<NodeId>,
    /// Times at which this node lost its uplink.
    pub lost: Vec<Timestamp>,
    /// Distance from a root, `None` while unknown.
    pub hops: Option<u32>,
}

/// Links and hop distribution after one topology-affecting event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HopSample {
    pub time: Timestamp,
    pub links: usize,
    pub max: f64,
    pub avg: f64,
}

impl HopSample {
    pub(crate) fn from_hops(time: Timestamp, hops: &[f64]) -> Self {
        if hops.is_empty() {
            return Self { time, links: 0, max: 0.0, avg: 0.0 };
        }
        Self {
            time,
            links: hops.len(),
            max: hops.iter().copied().fold(f64::MIN, f64::max),
            avg: hops.iter().sum::<f64>() / hops.len() as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HopStats {
    pub max: u32,
    pub mean: f64,
    pub median: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyTracker {
    vocabulary: TopologyVocabulary,
    nodes: BTreeMap<NodeId, TopologyNode>,
    events: Vec<TopologyEvent>,
}

impl TopologyTracker {
    pub fn new(nodes: &[NodeId], vocabulary: TopologyVocabulary) -> Self {
        Self {
            vocabulary,
            nodes: nodes.iter().map(|n| (n.clone(), TopologyNode::default())).collect(),
            events: Vec::new(),
        }
    }

    pub fn vocabulary(&self) -> &TopologyVocabulary {
        &self.vocabulary
    }

    /// Apply a connection event by name. Names outside the active
    /// vocabulary are ignored.
    pub fn apply(&mut self, time: Timestamp, action: &str, node: &NodeId, peer: &NodeId, handle: u16) {
        let action = if action == self.vocabulary.connect {
            TopologyAction::Connect
        } else if action == self.vocabulary.close {
            TopologyAction::Close
        } else {
            return;
        };

        self.events.push(TopologyEvent {
            time,
            action,
            node: node.clone(),
            peer: peer.clone(),
            handle,
        });
        match action {
            TopologyAction::Connect => self.connect(node, peer),
            TopologyAction::Close => self.close(time, node, peer),
        }
    }

    pub fn connect(&mut self, node: &NodeId, peer: &NodeId) {
        if node == peer {
            log::warn!("topology: {} reports a connection to itself", node);
            return;
        }

        let previous = self.nodes.entry(peer.clone()).or_default().parent.replace(node.clone());
        if let Some(old) = previous.filter(|old| old != node) {
            log::warn!("topology: {} moves from parent {} to {} without a close", peer, old, node);
            if let Some(old_parent) = self.nodes.get_mut(&old) {
                old_parent.children.remove(peer);
            }
        }
        self.nodes.entry(node.clone()).or_default().children.insert(peer.clone());
    }

    pub fn close(&mut self, time: Timestamp, node: &NodeId, peer: &NodeId) {
        let entry = self.nodes.entry(peer.clone()).or_default();
        entry.lost.push(time);

        if entry.parent.as_ref() != Some(node) {
            log::warn!("topology: close of unknown edge {} -> {}", node, peer);
            return;
        }
        entry.parent = None;
        if let Some(parent) = self.nodes.get_mut(node) {
            parent.children.remove(peer);
        }

        self.nodes.entry(peer.clone()).or_default().hops = None;
        for descendant in self.descendants(peer) {
            if let Some(rec) = self.nodes.get_mut(&descendant) {
                rec.hops = None;
            }
        }
    }

    /// All nodes below `node`, collected with an explicit work-list.
    pub fn descendants(&self, node: &NodeId) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut seen = BTreeSet::new();
        let mut work: Vec<NodeId> = self.children_of(node).cloned().collect();
        while let Some(next) = work.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            work.extend(self.children_of(&next).cloned());
            found.push(next);
        }
        found.sort();
        found
    }

    fn children_of<'a>(&'a self, node: &NodeId) -> impl Iterator<Item = &'a NodeId> + 'a {
        self.nodes.get(node).into_iter().flat_map(|rec| rec.children.iter())
    }

    /// Parentless nodes with children that never lost an uplink.
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, rec)| rec.parent.is_none() && !rec.children.is_empty() && rec.lost.is_empty())
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Recompute every hop distance breadth-first from the roots.
    pub fn compute_hops(&mut self) {
        for rec in self.nodes.values_mut() {
            rec.hops = None;
        }

        let mut frontier: VecDeque<(NodeId, u32)> = VecDeque::new();
        for root in self.roots() {
            if let Some(rec) = self.nodes.get_mut(&root) {
                rec.hops = Some(0);
            }
            frontier.push_back((root, 0));
        }

        while let Some((node, hop)) = frontier.pop_front() {
            let children: Vec<NodeId> = self.children_of(&node).cloned().collect();
            for child in children {
                let Some(rec) = self.nodes.get_mut(&child) else {
                    continue;
                };
                if rec.hops.is_none() {
                    rec.hops = Some(hop + 1);
                    frontier.push_back((child, hop + 1));
                }
            }
        }
    }

    pub fn hop(&self, node: &NodeId) -> Option<u32> {
        self.nodes.get(node).and_then(|rec| rec.hops)
    }

    pub fn node(&self, node: &NodeId) -> Option<&TopologyNode> {
        self.nodes.get(node)
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, TopologyNode> {
        &self.nodes
    }

    pub fn events(&self) -> &[TopologyEvent] {
        &self.events
    }

    /// Number of uplink losses over all nodes.
    pub fn reconnects(&self) -> usize {
        self.nodes.values().map(|rec| rec.lost.len()).sum()
    }

    /// max/mean/median over nodes with a positive hop distance.
    pub fn hop_stats(&self) -> Option<HopStats> {
        let mut hops: Vec<u32> = self.nodes.values().filter_map(|rec| rec.hops).filter(|&h| h > 0).collect();
        if hops.is_empty() {
            return None;
        }
        hops.sort_unstable();
        let mid = hops.len() / 2;
        let median = if hops.len() % 2 == 0 {
            (hops[mid - 1] + hops[mid]) as f64 / 2.0
        } else {
            hops[mid] as f64
        };
        Some(HopStats {
            max: hops[hops.len() - 1],
            mean: hops.iter().map(|&h| h as f64).sum::<f64>() / hops.len() as f64,
            median,
        })
    }

    /// Replay the recorded events and sample the chain length of every
    /// node after each of them.
    pub fn hop_timeline(&self) -> Vec<HopSample> {
        let mut parent: BTreeMap<&NodeId, &NodeId> = BTreeMap::new();
        let mut samples = Vec::with_capacity(self.events.len());

        for evt in &self.events {
            match evt.action {
                TopologyAction::Connect => {
                    parent.insert(&evt.peer, &evt.node);
                }
                TopologyAction::Close => {
                    parent.remove(&evt.peer);
                }
            }

            let limit = parent.len();
            let hops: Vec<f64> = parent
                .keys()
                .map(|start| {
                    let mut count = 0;
                    let mut cur = *start;
                    while let Some(next) = parent.get(cur) {
                        count += 1;
                        if count > limit {
                            break;
                        }
                        cur = next;
                    }
                    count as f64
                })
                .collect();
            samples.push(HopSample::from_hops(evt.time, &hops));
        }
        samples
    }

    /// Render the final topology as an indented tree, one line per node.
    pub fn render_tree(&self, window: &TimeWindow) -> Vec<String> {
        let mut lines = Vec::new();
        let mut seen = BTreeSet::new();

        for (root, rec) in &self.nodes {
            if rec.parent.is_some() {
                continue;
            }
            lines.push(root.to_string());
            seen.insert(root.clone());

            let mut stack: Vec<(NodeId, usize)> = rec.children.iter().rev().map(|c| (c.clone(), 0)).collect();
            while let Some((node, depth)) = stack.pop() {
                if !seen.insert(node.clone()) {
                    continue;
                }
                let Some(child) = self.nodes.get(&node) else {
                    continue;
                };
                let mut line = format!("{}|-- {}", "|   ".repeat(depth), node);
                if !child.lost.is_empty() {
                    let closed: Vec<String> = child.lost.iter().map(|t| format!("{:.2}", window.rel(*t))).collect();
                    line.push_str(&format!(" --> closed: {}", closed.join(", ")));
                }
                lines.push(line);
                stack.extend(child.children.iter().rev().map(|c| (c.clone(), depth + 1)));
            }
        }
        lines
    }
}
