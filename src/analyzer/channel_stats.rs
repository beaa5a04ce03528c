//! Link-layer statistics: per-channel digests, PHY usage and buffer levels.
//!
//! Nodes periodically print one `ll<conn>,<digest>` line per connection. The
//! digest is 80 base-62 characters, two per data channel: the even position
//! counts attempted transmissions, the odd position the acknowledged ones.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{ChannelSample, NodeId, PhySample, Timestamp};

/// BLE data channels carried by a digest.
pub const CHANNEL_COUNT: usize = 40;

/// Characters per digest (two per channel).
pub const DIGEST_LEN: usize = CHANNEL_COUNT * 2;

/// Rate reported for a channel that never saw an attempt. Negative so that
/// "no data" can be told apart from a true zero delivery rate.
pub const NO_DATA_RATE: f64 = -0.005;

/// Decode one base-62 digit (`0-9`, `a-z`, `A-Z`).
fn decode_digit(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some((c - b'0') as u32),
        b'a'..=b'z' => Some(10 + (c - b'a') as u32),
        b'A'..=b'Z' => Some(36 + (c - b'A') as u32),
        _ => None,
    }
}

/// Decode a full channel digest. Returns `None` for wrong length or a
/// character outside the base-62 alphabet.
pub fn decode_digest(conn: u16, digest: &str) -> Option<ChannelSample> {
    if digest.len() != DIGEST_LEN {
        return None;
    }

    let mut attempted = Vec::with_capacity(CHANNEL_COUNT);
    let mut acked = Vec::with_capacity(CHANNEL_COUNT);
    for pair in digest.as_bytes().chunks_exact(2) {
        attempted.push(decode_digit(pair[0])?);
        acked.push(decode_digit(pair[1])?);
    }

    Some(ChannelSample { conn, attempted, acked })
}

/// Acknowledged/attempted ratio, clamped to 1.0, `NO_DATA_RATE` when nothing
/// was attempted.
pub fn delivery_rate(attempted: u64, acked: u64) -> f64 {
    if attempted == 0 {
        return NO_DATA_RATE;
    }
    (acked as f64 / attempted as f64).min(1.0)
}

/// Cumulative per-channel counters of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCounterSet {
    pub attempted: Vec<u64>,
    pub acked: Vec<u64>,
}

impl ChannelCounterSet {
    pub fn new() -> Self {
        Self {
            attempted: vec![0; CHANNEL_COUNT],
            acked: vec![0; CHANNEL_COUNT],
        }
    }

    fn add(&mut self, sample: &ChannelSample) {
        for (chan, (&tx, &ok)) in sample.attempted.iter().zip(&sample.acked).enumerate() {
            self.attempted[chan] += tx as u64;
            self.acked[chan] += ok as u64;
        }
    }

    fn merge(&mut self, other: &ChannelCounterSet) {
        for chan in 0..CHANNEL_COUNT {
            self.attempted[chan] += other.attempted[chan];
            self.acked[chan] += other.acked[chan];
        }
    }

    pub fn rate(&self, chan: usize) -> f64 {
        delivery_rate(self.attempted[chan], self.acked[chan])
    }

    pub fn rates(&self) -> Vec<f64> {
        (0..CHANNEL_COUNT).map(|chan| self.rate(chan)).collect()
    }

    pub fn total_attempted(&self) -> u64 {
        self.attempted.iter().sum()
    }

    pub fn total_acked(&self) -> u64 {
        self.acked.iter().sum()
    }
}

impl Default for ChannelCounterSet {
    fn default() -> Self {
        Self::new()
    }
}

/// A channel digest as observed at a node and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestRecord {
    pub time: Timestamp,
    pub node: NodeId,
    pub sample: ChannelSample,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferLevel {
    pub time: Timestamp,
    pub free: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhyRecord {
    pub time: Timestamp,
    pub sample: PhySample,
}

/// Summed PHY on/off switching counts of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyTotals {
    pub rx_on: u64,
    pub rx_off: u64,
    pub tx_on: u64,
    pub tx_off: u64,
}

/// min/avg/max of the free-buffer samples of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSummary {
    pub min: u32,
    pub avg: u32,
    pub max: u32,
}

/// Memory pool usage (in bytes) derived from free-buffer samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BufferUsage {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub size: f64,
}

/// Tracker for `ll<conn>,...`, `ll,...` and `buf<n>` lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStatsTracker {
    digests: Vec<DigestRecord>,
    counters: BTreeMap<NodeId, ChannelCounterSet>,
    phy: BTreeMap<NodeId, Vec<PhyRecord>>,
    buffers: BTreeMap<NodeId, Vec<BufferLevel>>,
}

impl LinkStatsTracker {
    pub fn new(nodes: &[NodeId]) -> Self {
        Self {
            digests: Vec::new(),
            counters: nodes.iter().map(|n| (n.clone(), ChannelCounterSet::new())).collect(),
            phy: nodes.iter().map(|n| (n.clone(), Vec::new())).collect(),
            buffers: nodes.iter().map(|n| (n.clone(), Vec::new())).collect(),
        }
    }

    pub fn record_digest(&mut self, time: Timestamp, node: &NodeId, sample: &ChannelSample) {
        self.counters.entry(node.clone()).or_default().add(sample);
        self.digests.push(DigestRecord {
            time,
            node: node.clone(),
            sample: sample.clone(),
        });
    }

    /// A link summary carries the free-buffer level as well.
    pub fn record_phy(&mut self, time: Timestamp, node: &NodeId, sample: &PhySample) {
        self.phy.entry(node.clone()).or_default().push(PhyRecord { time, sample: *sample });
        self.record_buffer(time, node, sample.free_buffers);
    }

    pub fn record_buffer(&mut self, time: Timestamp, node: &NodeId, free: u32) {
        self.buffers.entry(node.clone()).or_default().push(BufferLevel { time, free });
    }

    pub fn digests(&self) -> &[DigestRecord] {
        &self.digests
    }

    pub fn counters(&self) -> &BTreeMap<NodeId, ChannelCounterSet> {
        &self.counters
    }

    pub fn node_counters(&self, node: &NodeId) -> Option<&ChannelCounterSet> {
        self.counters.get(node)
    }

    /// Counters summed over every node.
    pub fn aggregate(&self) -> ChannelCounterSet {
        let mut sum = ChannelCounterSet::new();
        for set in self.counters.values() {
            sum.merge(set);
        }
        sum
    }

    /// Overall link-layer delivery rate over all nodes and channels.
    pub fn overall_rate(&self) -> f64 {
        let sum = self.aggregate();
        delivery_rate(sum.total_attempted(), sum.total_acked())
    }

    pub fn has_phy(&self) -> bool {
        self.phy.values().any(|v| !v.is_empty())
    }

    pub fn phy_totals(&self) -> BTreeMap<NodeId, PhyTotals> {
        self.phy
            .iter()
            .map(|(node, records)| {
                let totals = records.iter().fold(PhyTotals::default(), |mut acc, r| {
                    acc.rx_on += r.sample.rx_count;
                    acc.rx_off += r.sample.rx_count_off;
                    acc.tx_on += r.sample.tx_count;
                    acc.tx_off += r.sample.tx_count_off;
                    acc
                });
                (node.clone(), totals)
            })
            .collect()
    }

    pub fn buffer_summary(&self) -> BTreeMap<NodeId, BufferSummary> {
        self.buffers
            .iter()
            .filter(|(_, levels)| !levels.is_empty())
            .map(|(node, levels)| {
                let min = levels.iter().map(|l| l.free).min().unwrap_or(0);
                let max = levels.iter().map(|l| l.free).max().unwrap_or(0);
                let sum: u64 = levels.iter().map(|l| l.free as u64).sum();
                let avg = (sum / levels.len() as u64) as u32;
                (node.clone(), BufferSummary { min, avg, max })
            })
            .collect()
    }

    /// Pool usage within `[from, to]` for a pool of `count` buffers of
    /// `size` bytes. `None` without samples in range.
    pub fn buffer_usage(&self, from: Timestamp, to: Timestamp, count: u32, size: u32) -> Option<BufferUsage> {
        let mut free: Vec<f64> = self
            .buffers
            .values()
            .flatten()
            .filter(|l| l.time >= from && l.time <= to)
            .map(|l| l.free as f64 * size as f64)
            .collect();
        if free.is_empty() {
            return None;
        }
        free.sort_by(|a, b| a.total_cmp(b));

        let pool = count as f64 * size as f64;
        let mid = free.len() / 2;
        let median = if free.len() % 2 == 0 { (free[mid - 1] + free[mid]) / 2.0 } else { free[mid] };
        let mean = free.iter().sum::<f64>() / free.len() as f64;
        Some(BufferUsage {
            min: pool - free[free.len() - 1],
            max: pool - free[0],
            avg: pool - mean,
            median: pool - median,
            size: pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    #[test]
    fn decode_digits() {
        let digest = format!("09azAZ{}", "0".repeat(74));
        let sample = decode_digest(1, &digest).unwrap();
        assert_eq!(&sample.attempted[..3], &[0, 10, 36]);
        assert_eq!(&sample.acked[..3], &[9, 35, 61]);
    }

    #[test]
    fn all_zero_digest_reports_no_data() {
        let sample = decode_digest(1, &"0".repeat(DIGEST_LEN)).unwrap();
        assert!(sample.attempted.iter().all(|&v| v == 0));
        assert!(sample.acked.iter().all(|&v| v == 0));

        let mut tracker = LinkStatsTracker::new(&[node("n-1")]);
        tracker.record_digest(1.0, &node("n-1"), &sample);
        let counters = tracker.node_counters(&node("n-1")).unwrap();
        for rate in counters.rates() {
            assert_eq!(rate, NO_DATA_RATE);
            assert_ne!(rate, 0.0);
        }
    }

    #[test]
    fn rejects_malformed_digests() {
        assert!(decode_digest(1, &"0".repeat(79)).is_none());
        assert!(decode_digest(1, &format!("-{}", "0".repeat(79))).is_none());
    }

    #[test]
    fn rate_is_clamped() {
        assert_eq!(delivery_rate(2, 3), 1.0);
        assert_eq!(delivery_rate(4, 1), 0.25);
        assert_eq!(delivery_rate(0, 0), NO_DATA_RATE);
    }

    #[test]
    fn sums_accumulate_across_digests() {
        let n = node("n-1");
        let mut tracker = LinkStatsTracker::new(&[n.clone()]);
        let digest = format!("42{}", "0".repeat(78));
        tracker.record_digest(1.0, &n, &decode_digest(1, &digest).unwrap());
        tracker.record_digest(2.0, &n, &decode_digest(2, &digest).unwrap());

        let counters = tracker.node_counters(&n).unwrap();
        assert_eq!(counters.attempted[0], 8);
        assert_eq!(counters.acked[0], 4);
        assert_eq!(counters.rate(0), 0.5);
        assert_eq!(counters.rate(1), NO_DATA_RATE);
        assert_eq!(tracker.overall_rate(), 0.5);
    }

    #[test]
    fn buffers_and_phy() {
        let n = node("n-1");
        let mut tracker = LinkStatsTracker::new(&[n.clone()]);
        let phy = PhySample {
            duration: 1000,
            rx_count: 5,
            rx_time: 10,
            tx_count: 7,
            tx_time: 12,
            free_buffers: 30,
            rx_count_off: 4,
            tx_count_off: 7,
        };
        tracker.record_phy(1.0, &n, &phy);
        tracker.record_buffer(2.0, &n, 40);

        let summary = tracker.buffer_summary()[&n];
        assert_eq!(summary, BufferSummary { min: 30, avg: 35, max: 40 });

        let totals = tracker.phy_totals()[&n];
        assert_eq!(totals, PhyTotals { rx_on: 5, rx_off: 4, tx_on: 7, tx_off: 7 });

        let usage = tracker.buffer_usage(0.0, 10.0, 40, 10).unwrap();
        assert_eq!(usage.size, 400.0);
        assert_eq!(usage.min, 0.0);
        assert_eq!(usage.max, 100.0);
        assert_eq!(usage.median, 50.0);
        assert!(tracker.buffer_usage(5.0, 10.0, 40, 10).is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_decoded_values_stay_in_range(chars in prop::collection::vec(0usize..62, DIGEST_LEN)) {
            let digest: String = chars.iter().map(|&i| ALPHABET.as_bytes()[i] as char).collect();
            let sample = decode_digest(0, &digest).unwrap();
            prop_assert_eq!(sample.attempted.len(), CHANNEL_COUNT);
            prop_assert_eq!(sample.acked.len(), CHANNEL_COUNT);
            for (i, pair) in chars.chunks(2).enumerate() {
                prop_assert_eq!(sample.attempted[i] as usize, pair[0]);
                prop_assert_eq!(sample.acked[i] as usize, pair[1]);
            }
        }
    }
}
