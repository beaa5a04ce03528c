//! Flow-control credit bookkeeping per node, channel and connection instance.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{CreditNotice, MarkerTag, NodeId};

/// Running min/max of one credit counter. Empty until the first
/// signal/update-type notice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extremes {
    pub min: Option<i32>,
    pub max: Option<i32>,
}

impl Extremes {
    fn widen(&mut self, value: i32) {
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }
}

/// One connection instance on a credit-based channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRecord {
    pub handle: u16,
    pub init_rx: Option<i32>,
    pub init_tx: Option<i32>,
    pub rx: Extremes,
    pub tx: Extremes,
    pub signal_count: i64,
    pub update_count: i64,
}

impl CreditRecord {
    pub fn new(handle: u16) -> Self {
        Self {
            handle,
            init_rx: None,
            init_tx: None,
            rx: Extremes::default(),
            tx: Extremes::default(),
            signal_count: 0,
            update_count: 0,
        }
    }

    fn seeded(&self) -> bool {
        self.init_rx.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditTracker {
    /// node -> channel -> connection instances, oldest first
    records: BTreeMap<NodeId, BTreeMap<String, Vec<CreditRecord>>>,
}

impl CreditTracker {
    pub fn new(nodes: &[NodeId]) -> Self {
        Self {
            records: nodes.iter().map(|n| (n.clone(), BTreeMap::new())).collect(),
        }
    }

    pub fn record(&mut self, node: &NodeId, notice: &CreditNotice) {
        let instances = self
            .records
            .entry(node.clone())
            .or_default()
            .entry(notice.channel.clone())
            .or_default();

        let reopen = match instances.last() {
            None => true,
            Some(current) => {
                current.handle != notice.handle || (notice.tag == MarkerTag::CreditInit && current.seeded())
            }
        };
        if reopen {
            instances.push(CreditRecord::new(notice.handle));
        }
        let Some(current) = instances.last_mut() else {
            return;
        };

        match notice.tag {
            MarkerTag::CreditInit => {
                current.init_rx = Some(notice.rx_credits);
                current.init_tx = Some(notice.tx_credits);
            }
            MarkerTag::CreditSignal | MarkerTag::CreditRxReady | MarkerTag::CreditUpdate | MarkerTag::CreditTx => {
                current.rx.widen(notice.rx_credits);
                current.tx.widen(notice.tx_credits);
                match notice.tag {
                    MarkerTag::CreditSignal => current.signal_count += notice.change as i64,
                    MarkerTag::CreditUpdate => current.update_count += notice.change as i64,
                    _ => {}
                }
            }
            _ => log::debug!("{}: ignoring credit notice {} on {}", node, notice.tag, notice.channel),
        }
    }

    pub fn records(&self) -> &BTreeMap<NodeId, BTreeMap<String, Vec<CreditRecord>>> {
        &self.records
    }

    pub fn instances(&self, node: &NodeId, channel: &str) -> &[CreditRecord] {
        self.records
            .get(node)
            .and_then(|chans| chans.get(channel))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Signal and update counts summed over every instance of a node.
    pub fn node_totals(&self, node: &NodeId) -> (i64, i64) {
        self.records
            .get(node)
            .into_iter()
            .flat_map(|chans| chans.values().flatten())
            .fold((0, 0), |(sig, upd), r| (sig + r.signal_count, upd + r.update_count))
    }

    pub fn is_empty(&self) -> bool {
        self.records.values().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(tag: MarkerTag, handle: u16, rx: i32, tx: i32, change: i32) -> CreditNotice {
        CreditNotice {
            tag,
            channel: "0x20003a4c".to_string(),
            handle,
            rx_credits: rx,
            tx_credits: tx,
            change,
        }
    }

    #[test]
    fn init_then_signals_widen_extremes() {
        let n = NodeId::new("n-1");
        let mut tracker = CreditTracker::new(&[n.clone()]);
        tracker.record(&n, &notice(MarkerTag::CreditInit, 0, 10, 10, 0));
        tracker.record(&n, &notice(MarkerTag::CreditSignal, 0, 9, 10, 1));
        tracker.record(&n, &notice(MarkerTag::CreditTx, 0, 9, 7, 0));
        tracker.record(&n, &notice(MarkerTag::CreditUpdate, 0, 12, 8, 3));

        let instances = tracker.instances(&n, "0x20003a4c");
        assert_eq!(instances.len(), 1);
        let rec = &instances[0];
        assert_eq!(rec.init_rx, Some(10));
        assert_eq!(rec.rx, Extremes { min: Some(9), max: Some(12) });
        assert_eq!(rec.tx, Extremes { min: Some(7), max: Some(10) });
        assert_eq!(rec.signal_count, 1);
        assert_eq!(rec.update_count, 3);
        assert_eq!(tracker.node_totals(&n), (1, 3));
    }

    #[test]
    fn second_init_starts_new_instance() {
        let n = NodeId::new("n-1");
        let mut tracker = CreditTracker::new(&[n.clone()]);
        tracker.record(&n, &notice(MarkerTag::CreditInit, 0, 10, 10, 0));
        tracker.record(&n, &notice(MarkerTag::CreditSignal, 0, 9, 10, 2));
        tracker.record(&n, &notice(MarkerTag::CreditInit, 0, 5, 5, 0));
        tracker.record(&n, &notice(MarkerTag::CreditSignal, 0, 4, 5, 1));

        let instances = tracker.instances(&n, "0x20003a4c");
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].signal_count, 2);
        assert_eq!(instances[1].init_rx, Some(5));
        assert_eq!(instances[1].signal_count, 1);
        assert_eq!(tracker.node_totals(&n), (3, 0));
    }

    #[test]
    fn signal_before_init_keeps_baseline_unset() {
        let n = NodeId::new("n-1");
        let mut tracker = CreditTracker::new(&[n.clone()]);
        tracker.record(&n, &notice(MarkerTag::CreditRxReady, 1, 3, 4, 0));
        tracker.record(&n, &notice(MarkerTag::CreditInit, 1, 10, 10, 0));

        let instances = tracker.instances(&n, "0x20003a4c");
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].init_rx, Some(10));
        assert_eq!(instances[0].rx.min, Some(3));
    }
}
