//! Per-node and total marker counts, split by traffic class.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{Direction, MarkerTag, NodeId, SeqDesc};

/// Column of the event count matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    All,
    /// Markers carrying a sequence descriptor.
    #[default]
    Data,
    /// Markers without one.
    Control,
    Request,
    Reply,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub all: u64,
    pub data: u64,
    pub control: u64,
    pub request: u64,
    pub reply: u64,
}

impl Column {
    pub fn name(self) -> &'static str {
        match self {
            Column::All => "all",
            Column::Data => "data",
            Column::Control => "ctrl",
            Column::Request => "req",
            Column::Reply => "reply",
        }
    }
}

impl TagCount {
    pub fn add(&mut self, seq: Option<&SeqDesc>) {
        self.all += 1;
        match seq {
            None => self.control += 1,
            Some(desc) => {
                self.data += 1;
                match desc.direction {
                    Direction::Request => self.request += 1,
                    Direction::Reply => self.reply += 1,
                }
            }
        }
    }

    pub fn get(&self, column: Column) -> u64 {
        match column {
            Column::All => self.all,
            Column::Data => self.data,
            Column::Control => self.control,
            Column::Request => self.request,
            Column::Reply => self.reply,
        }
    }
}

/// Tags that always show up in the per-node tables, even with zero counts.
pub const REPORTED_TAGS: &[MarkerTag] = &[
    MarkerTag::AppRx,
    MarkerTag::AppTx,
    MarkerTag::AppTxRetry,
    MarkerTag::AppAck,
    MarkerTag::AppTxError,
    MarkerTag::NetifRx,
    MarkerTag::NetifTx,
    MarkerTag::NetifTxNotConnected,
    MarkerTag::NetifTxAbort,
    MarkerTag::IpDrop,
    MarkerTag::CtrlRxError,
    MarkerTag::NetifRxNoPktBuf,
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCounts {
    per_node: BTreeMap<NodeId, BTreeMap<MarkerTag, TagCount>>,
    total: BTreeMap<MarkerTag, TagCount>,
}

impl EventCounts {
    pub fn new(nodes: &[NodeId]) -> Self {
        let seeded: BTreeMap<MarkerTag, TagCount> =
            REPORTED_TAGS.iter().map(|t| (t.clone(), TagCount::default())).collect();
        Self {
            per_node: nodes.iter().map(|n| (n.clone(), seeded.clone())).collect(),
            total: seeded,
        }
    }

    pub fn add(&mut self, node: &NodeId, tag: &MarkerTag, seq: Option<&SeqDesc>) {
        self.per_node
            .entry(node.clone())
            .or_default()
            .entry(tag.clone())
            .or_default()
            .add(seq);
        self.total.entry(tag.clone()).or_default().add(seq);
    }

    /// Count at one node; zero for tags never seen there.
    pub fn node(&self, node: &NodeId, tag: &MarkerTag, column: Column) -> u64 {
        self.per_node
            .get(node)
            .and_then(|tags| tags.get(tag))
            .map_or(0, |c| c.get(column))
    }

    pub fn total(&self, tag: &MarkerTag, column: Column) -> u64 {
        self.total.get(tag).map_or(0, |c| c.get(column))
    }

    pub fn totals(&self) -> &BTreeMap<MarkerTag, TagCount> {
        &self.total
    }

    pub fn per_node(&self) -> &BTreeMap<NodeId, BTreeMap<MarkerTag, TagCount>> {
        &self.per_node
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.per_node.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_split_by_descriptor() {
        let n = NodeId::new("n-1");
        let mut counts = EventCounts::new(&[n.clone()]);
        let req = SeqDesc::parse("1>2");
        let rep = SeqDesc::parse("1<2");
        counts.add(&n, &MarkerTag::NetifTx, req.as_ref());
        counts.add(&n, &MarkerTag::NetifTx, rep.as_ref());
        counts.add(&n, &MarkerTag::NetifTx, None);

        assert_eq!(counts.node(&n, &MarkerTag::NetifTx, Column::All), 3);
        assert_eq!(counts.node(&n, &MarkerTag::NetifTx, Column::Data), 2);
        assert_eq!(counts.node(&n, &MarkerTag::NetifTx, Column::Control), 1);
        assert_eq!(counts.node(&n, &MarkerTag::NetifTx, Column::Request), 1);
        assert_eq!(counts.total(&MarkerTag::NetifTx, Column::Reply), 1);
        assert_eq!(counts.total(&MarkerTag::AppAck, Column::All), 0);
    }

    #[test]
    fn unknown_tags_are_counted() {
        let n = NodeId::new("n-1");
        let mut counts = EventCounts::new(&[n.clone()]);
        let tag = MarkerTag::parse("RPL_X");
        counts.add(&n, &tag, None);
        assert_eq!(counts.total(&tag, Column::Control), 1);
        assert!(counts.totals().contains_key(&MarkerTag::IpDrop));
    }
}
