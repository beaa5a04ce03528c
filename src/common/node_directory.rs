//! MAC address to node name resolution.
//!
//! Connection events name their peer by BLE address only. The directory is
//! seeded from the configuration file and corrected by the `Own Address`
//! lines the nodes print at boot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::analyzer::types::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeAddress {
    pub mac: String,
    #[serde(default)]
    pub l2addr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDirectory {
    nodes: BTreeMap<NodeId, NodeAddress>,
}

impl NodeDirectory {
    pub fn from_addresses(addresses: &BTreeMap<String, NodeAddress>) -> Self {
        let mut dir = Self::default();
        for (name, addr) in addresses {
            dir.insert(NodeId::new(name.as_str()), &addr.mac, addr.l2addr.as_deref());
        }
        dir
    }

    pub fn insert(&mut self, node: NodeId, mac: &str, l2addr: Option<&str>) {
        self.nodes.insert(
            node,
            NodeAddress {
                mac: mac.to_lowercase(),
                l2addr: l2addr.map(str::to_lowercase),
            },
        );
    }

    /// Apply a self-announced address. Returns `true` when it deviated from
    /// the known one.
    pub fn observe_own_address(&mut self, node: &NodeId, mac: &str, l2addr: &str) -> bool {
        let mac = mac.to_lowercase();
        let changed = match self.nodes.get(node) {
            Some(known) if known.mac == mac => false,
            Some(known) => {
                log::warn!("addr conf for {} broken (cfg {} but is {})", node, known.mac, mac);
                true
            }
            None => false,
        };
        self.insert(node.clone(), &mac, Some(l2addr));
        changed
    }

    /// Node owning `mac`, case-insensitive.
    pub fn resolve_mac(&self, mac: &str) -> Option<&NodeId> {
        let mac = mac.to_lowercase();
        self.nodes.iter().find(|(_, addr)| addr.mac == mac).map(|(node, _)| node)
    }

    pub fn resolve_l2addr(&self, l2addr: &str) -> Option<&NodeId> {
        let l2addr = l2addr.to_lowercase();
        self.nodes
            .iter()
            .find(|(_, addr)| addr.l2addr.as_deref() == Some(l2addr.as_str()))
            .map(|(node, _)| node)
    }

    pub fn mac_of(&self, node: &NodeId) -> Option<&str> {
        self.nodes.get(node).map(|addr| addr.mac.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_case_insensitively() {
        let mut dir = NodeDirectory::default();
        dir.insert(NodeId::new("n-1"), "C2:A1:5D:89:54:03", Some("C2:A1"));
        assert_eq!(dir.resolve_mac("c2:a1:5d:89:54:03"), Some(&NodeId::new("n-1")));
        assert_eq!(dir.resolve_l2addr("c2:a1"), Some(&NodeId::new("n-1")));
        assert!(dir.resolve_mac("00:00:00:00:00:00").is_none());
    }

    #[test]
    fn own_address_overrides_config() {
        let n = NodeId::new("n-1");
        let mut dir = NodeDirectory::default();
        dir.insert(n.clone(), "aa:aa:aa:aa:aa:aa", None);
        assert!(dir.observe_own_address(&n, "BB:BB:BB:BB:BB:BB", "bb:bb"));
        assert_eq!(dir.mac_of(&n), Some("bb:bb:bb:bb:bb:bb"));
        assert!(!dir.observe_own_address(&n, "bb:bb:bb:bb:bb:bb", "bb:bb"));

        let fresh = NodeId::new("n-2");
        assert!(!dir.observe_own_address(&fresh, "cc:cc:cc:cc:cc:cc", "cc:cc"));
        assert_eq!(dir.resolve_mac("CC:CC:CC:CC:CC:CC"), Some(&fresh));
    }
}
