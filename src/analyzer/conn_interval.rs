//! Connection parameters per node and handle, from the connection listing
//! nodes print on request.
//!
//! A listed slot replaces whatever was known for that handle, a slot
//! reported unused clears it. The summary reports the closest spacing
//! between the intervals of the connections still open at the end.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{ConnParams, ConnRole, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnSlot {
    /// `None` when the peer address is not in the directory.
    pub peer: Option<NodeId>,
    pub role: ConnRole,
    pub interval_ms: u32,
    pub supervision_ms: u32,
    pub slave_latency: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnIntervalTracker {
    slots: BTreeMap<NodeId, BTreeMap<u16, ConnSlot>>,
    used: bool,
}

impl ConnIntervalTracker {
    pub fn new(nodes: &[NodeId]) -> Self {
        Self {
            slots: nodes.iter().map(|n| (n.clone(), BTreeMap::new())).collect(),
            used: false,
        }
    }

    pub fn listed(&mut self, node: &NodeId, params: &ConnParams, peer: Option<NodeId>) {
        self.used = true;
        let slot = ConnSlot {
            peer,
            role: params.role,
            interval_ms: params.interval_ms,
            supervision_ms: params.supervision_ms,
            slave_latency: params.slave_latency,
        };
        self.slots.entry(node.clone()).or_default().insert(params.handle, slot);
    }

    pub fn unused(&mut self, node: &NodeId, handle: u16) {
        self.used = true;
        if let Some(slots) = self.slots.get_mut(node) {
            slots.remove(&handle);
        }
    }

    /// Whether any connection listing was seen.
    pub fn used(&self) -> bool {
        self.used
    }

    pub fn slots(&self, node: &NodeId) -> Option<&BTreeMap<u16, ConnSlot>> {
        self.slots.get(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.slots.keys()
    }

    /// Intervals of the open connections of `node`, ascending.
    pub fn intervals(&self, node: &NodeId) -> Vec<u32> {
        let mut itvls: Vec<u32> = self
            .slots
            .get(node)
            .map(|slots| slots.values().map(|s| s.interval_ms).collect())
            .unwrap_or_default();
        itvls.sort_unstable();
        itvls
    }

    /// Smallest distance between two interval values of `node`; needs at
    /// least two open connections.
    pub fn min_spacing(&self, node: &NodeId) -> Option<u32> {
        self.intervals(node).windows(2).map(|w| w[1] - w[0]).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(handle: u16, interval_ms: u32) -> ConnParams {
        ConnParams {
            handle,
            peer_addr: "aa:aa:aa:aa:aa:02".to_string(),
            role: ConnRole::Master,
            interval_ms,
            supervision_ms: 2500,
            slave_latency: 0,
        }
    }

    #[test]
    fn spacing_over_open_connections() {
        let (a, b) = (NodeId::new("n-1"), NodeId::new("n-2"));
        let mut tracker = ConnIntervalTracker::new(&[a.clone(), b.clone()]);
        assert!(!tracker.used());

        tracker.listed(&a, &params(0, 100), Some(b.clone()));
        tracker.listed(&a, &params(1, 75), None);
        tracker.listed(&a, &params(2, 80), None);
        assert!(tracker.used());
        assert_eq!(tracker.intervals(&a), vec![75, 80, 100]);
        assert_eq!(tracker.min_spacing(&a), Some(5));
        assert_eq!(tracker.slots(&a).unwrap()[&0].peer, Some(b.clone()));

        tracker.unused(&a, 2);
        assert_eq!(tracker.min_spacing(&a), Some(25));
        tracker.unused(&a, 1);
        assert_eq!(tracker.min_spacing(&a), None);
        assert_eq!(tracker.min_spacing(&b), None);
    }

    #[test]
    fn relisting_a_handle_replaces_it() {
        let a = NodeId::new("n-1");
        let mut tracker = ConnIntervalTracker::new(&[a.clone()]);
        tracker.listed(&a, &params(0, 100), None);
        tracker.listed(&a, &params(0, 30), None);
        tracker.listed(&a, &params(1, 30), None);
        assert_eq!(tracker.intervals(&a), vec![30, 30]);
        assert_eq!(tracker.min_spacing(&a), Some(0));
    }
}
