//! Uplink/downlink bookkeeping for the mesh connection vocabulary.
//!
//! Mesh experiments report `conn_uplink`, `close_uplink`, `conn_downlink`,
//! `close_downlink` and `reconn`. Hop distances follow a local rule: an
//! uplink connect puts a node one hop behind its peer, an uplink close
//! resets it to zero.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::topology::HopSample;
use super::types::{NodeId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshAction {
    ConnUplink,
    CloseUplink,
    ConnDownlink,
    CloseDownlink,
    Reconn,
}

impl MeshAction {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "conn_uplink" => Some(MeshAction::ConnUplink),
            "close_uplink" => Some(MeshAction::CloseUplink),
            "conn_downlink" => Some(MeshAction::ConnDownlink),
            "close_downlink" => Some(MeshAction::CloseDownlink),
            "reconn" => Some(MeshAction::Reconn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshEvent {
    pub time: Timestamp,
    pub node: NodeId,
    pub peer: NodeId,
    pub action: MeshAction,
    pub handle: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshTopologyTracker {
    hops: BTreeMap<NodeId, u32>,
    reconnects: BTreeMap<NodeId, u32>,
    events: Vec<MeshEvent>,
}

impl MeshTopologyTracker {
    pub fn new(nodes: &[NodeId]) -> Self {
        Self {
            hops: nodes.iter().map(|n| (n.clone(), 0)).collect(),
            reconnects: nodes.iter().map(|n| (n.clone(), 0)).collect(),
            events: Vec::new(),
        }
    }

    pub fn apply(&mut self, time: Timestamp, action: &str, node: &NodeId, peer: &NodeId, handle: u16) {
        let Some(action) = MeshAction::parse(action) else {
            return;
        };

        Self::step(&mut self.hops, node, peer, action);
        if action == MeshAction::Reconn {
            *self.reconnects.entry(node.clone()).or_default() += 1;
        }
        self.events.push(MeshEvent {
            time,
            node: node.clone(),
            peer: peer.clone(),
            action,
            handle,
        });
    }

    fn step(hops: &mut BTreeMap<NodeId, u32>, node: &NodeId, peer: &NodeId, action: MeshAction) {
        match action {
            MeshAction::ConnUplink => {
                let above = hops.get(peer).copied().unwrap_or(0);
                hops.insert(node.clone(), above + 1);
            }
            MeshAction::CloseUplink => {
                hops.insert(node.clone(), 0);
            }
            _ => {}
        }
    }

    pub fn used(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn hop(&self, node: &NodeId) -> u32 {
        self.hops.get(node).copied().unwrap_or(0)
    }

    pub fn hops(&self) -> &BTreeMap<NodeId, u32> {
        &self.hops
    }

    pub fn events(&self) -> &[MeshEvent] {
        &self.events
    }

    pub fn reconnects(&self) -> &BTreeMap<NodeId, u32> {
        &self.reconnects
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.values().map(|&c| c as usize).sum()
    }

    /// Replay the events, sampling linked nodes and hop distances after each.
    pub fn hop_timeline(&self) -> Vec<HopSample> {
        let mut hops: BTreeMap<NodeId, u32> = self.hops.keys().map(|n| (n.clone(), 0)).collect();
        self.events
            .iter()
            .map(|evt| {
                Self::step(&mut hops, &evt.node, &evt.peer, evt.action);
                let linked: Vec<f64> = hops.values().filter(|&&h| h > 0).map(|&h| h as f64).collect();
                HopSample::from_hops(evt.time, &linked)
            })
            .collect()
    }
}
