//! Type definitions specific to the analyzer module.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Log time in seconds, as printed by the testbed serial aggregator.
pub type Timestamp = f64;

/// Testbed node name (e.g. `nrf52dk-3`).
///
/// Ordering follows the testbed's natural order: names carrying a `-<n>`
/// suffix before the rest, shorter names first, then by that number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numbered names first, then by length and number.
    fn sort_key(&self) -> (bool, usize, u64) {
        let suffix = self.0.rsplit_once('-').and_then(|(_, n)| n.parse::<u64>().ok());
        (suffix.is_none(), self.0.len(), suffix.unwrap_or(0))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key()).then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Leg of a request/reply exchange encoded in a sequence descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// `>` marker: producer towards consumer.
    Request,
    /// `<` marker: the reply travelling back.
    Reply,
}

/// Sequence descriptor `<id>(>|<)<seq>` attached to data-path markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqDesc {
    pub id: u32,
    pub direction: Direction,
    pub seq: u32,
}

impl SeqDesc {
    pub fn parse(info: &str) -> Option<Self> {
        let (split, direction) = match (info.find('>'), info.find('<')) {
            (Some(pos), None) => (pos, Direction::Request),
            (None, Some(pos)) => (pos, Direction::Reply),
            _ => return None,
        };
        let id = info[..split].trim().parse().ok()?;
        let seq = info[split + 1..].trim().parse().ok()?;
        Some(Self { id, direction, seq })
    }

    /// Direction-free key shared by both legs of one logical packet.
    pub fn flow_key(&self) -> FlowKey {
        FlowKey(format!("{}-{}", self.id, self.seq))
    }
}

impl fmt::Display for SeqDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Request => '>',
            Direction::Reply => '<',
        };
        write!(f, "{}{}{}", self.id, dir, self.seq)
    }
}

/// Normalized flow identifier (`<id>-<seq>`, plus `#<generation>` when a
/// key is reused under the idle-split policy).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowKey(String);

impl FlowKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn generation(&self, generation: u32) -> Self {
        if generation <= 1 {
            self.clone()
        } else {
            Self(format!("{}#{}", self.0, generation))
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Firmware statistics marker printed as `~<TAG>[:<info>]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MarkerTag {
    /// Application packet sent.
    AppTx,
    /// Application send failed for lack of buffers.
    AppTxNoBuf,
    AppTxError,
    AppTxRetry,
    AppRx,
    AppAck,
    AppAckError,
    AppAckTimeout,
    NetifRx,
    NetifRxError,
    /// Received but dropped because the packet buffer was full.
    NetifRxNoPktBuf,
    NetifTx,
    NetifTxError,
    NetifTxNoBuf,
    /// Dropped because the next hop was not connected.
    NetifTxNotConnected,
    NetifTxAbort,
    NetifTxUnstalled,
    /// IP layer drop.
    IpDrop,
    CtrlRxError,
    /// Objective function update.
    ObjectiveFunction,
    CreditInit,
    CreditSignal,
    CreditRxReady,
    CreditUpdate,
    CreditTx,
    ChannelAlloc,
    ChannelFree,
    Other(String),
}

const TAG_NAMES: &[(MarkerTag, &str)] = &[
    (MarkerTag::AppTx, "A_TX"),
    (MarkerTag::AppTxNoBuf, "A_TX_F"),
    (MarkerTag::AppTxError, "A_TX_ER"),
    (MarkerTag::AppTxRetry, "A_TX_RE"),
    (MarkerTag::AppRx, "A_RX"),
    (MarkerTag::AppAck, "A_ACK"),
    (MarkerTag::AppAckError, "A_ACK_ER"),
    (MarkerTag::AppAckTimeout, "A_ACK_TO"),
    (MarkerTag::NetifRx, "N_RX"),
    (MarkerTag::NetifRxError, "N_RX_ER"),
    (MarkerTag::NetifRxNoPktBuf, "N_RX_NPB"),
    (MarkerTag::NetifTx, "N_TX"),
    (MarkerTag::NetifTxError, "N_TX_ER"),
    (MarkerTag::NetifTxNoBuf, "N_TX_NNB"),
    (MarkerTag::NetifTxNotConnected, "N_TX_NC"),
    (MarkerTag::NetifTxAbort, "N_TX_A"),
    (MarkerTag::NetifTxUnstalled, "N_TX_US"),
    (MarkerTag::IpDrop, "I_D"),
    (MarkerTag::CtrlRxError, "C_RXER"),
    (MarkerTag::ObjectiveFunction, "OF"),
    (MarkerTag::CreditInit, "H_CI"),
    (MarkerTag::CreditSignal, "H_CS"),
    (MarkerTag::CreditRxReady, "H_CRR"),
    (MarkerTag::CreditUpdate, "H_CU"),
    (MarkerTag::CreditTx, "H_CTX"),
    (MarkerTag::ChannelAlloc, "H_CHA"),
    (MarkerTag::ChannelFree, "H_CHF"),
];

impl MarkerTag {
    pub fn parse(name: &str) -> Self {
        TAG_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(tag, _)| tag.clone())
            .unwrap_or_else(|| MarkerTag::Other(name.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            MarkerTag::Other(name) => name,
            known => TAG_NAMES.iter().find(|(tag, _)| tag == known).map(|(_, n)| *n).unwrap_or("?"),
        }
    }

    /// Application-layer markers define the experiment's active time window.
    pub fn is_application(&self) -> bool {
        self.name().starts_with("A_")
    }
}

impl From<String> for MarkerTag {
    fn from(name: String) -> Self {
        MarkerTag::parse(&name)
    }
}

impl From<MarkerTag> for String {
    fn from(tag: MarkerTag) -> Self {
        tag.name().to_string()
    }
}

impl fmt::Display for MarkerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Which of the two connection-event line shapes produced a link notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkForm {
    /// `ble: <evt> (<handle>|<addr>)`
    Generic,
    /// `ble:<evt> <addr> <handle>`
    Mesh,
}

/// Connection event reported by a node about one of its peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkNotice {
    pub form: LinkForm,
    /// Raw event name, e.g. `conn_s`, `close_uplink`, `reconn`.
    pub action: String,
    pub handle: u16,
    pub peer_addr: String,
}

/// One `ll,...` link summary sample (PHY usage over one print interval).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhySample {
    pub duration: u64,
    pub rx_count: u64,
    pub rx_time: u64,
    pub tx_count: u64,
    pub tx_time: u64,
    pub free_buffers: u32,
    pub rx_count_off: u64,
    pub tx_count_off: u64,
}

/// Decoded `ll<conn>,<digest>` line: per channel attempted and acknowledged
/// transmissions during one sampling interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSample {
    pub conn: u16,
    pub attempted: Vec<u32>,
    pub acked: Vec<u32>,
}

impl ChannelSample {
    pub fn sum_attempted(&self) -> u64 {
        self.attempted.iter().map(|&v| v as u64).sum()
    }

    pub fn sum_acked(&self) -> u64 {
        self.acked.iter().map(|&v| v as u64).sum()
    }
}

/// Flow-control credit notice `~H_C*:<chan>;<handle>;<rx>;<tx>;<change>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditNotice {
    pub tag: MarkerTag,
    pub channel: String,
    pub handle: u16,
    pub rx_credits: i32,
    pub tx_credits: i32,
    pub change: i32,
}

/// Local role on one BLE connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnRole {
    Master,
    Slave,
}

/// One row of the connection listing:
/// `[<handle>] <peer> [<l2addr>] (<M|S>,<itvl>ms,<timeout>ms,<latency>)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnParams {
    pub handle: u16,
    pub peer_addr: String,
    pub role: ConnRole,
    pub interval_ms: u32,
    pub supervision_ms: u32,
    pub slave_latency: u32,
}

/// Typed result of classifying one log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    Heartbeat { seq: u32 },
    OwnAddress { mac: String, l2addr: String },
    Link(LinkNotice),
    ChannelDigest(ChannelSample),
    LinkSummary(PhySample),
    BufferFree { free: u32 },
    Credit(CreditNotice),
    Marker { tag: MarkerTag, seq: Option<SeqDesc>, payload: Option<i64> },
    IfaceCall,
    IfaceHwAddr { addr: String },
    IfaceIpAddr { addr: String },
    ThreadState { pid: u32, name: String, state: String },
    ConnParams(ConnParams),
    /// Connection slot reported as unused.
    ConnUnused { handle: u16 },
}

/// A classified log line. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub time: Timestamp,
    pub node: NodeId,
    pub kind: EventKind,
}

/// Experiment time markers.
///
/// `prep`/`finish` span every body line; `start`/`end` are narrowed to the
/// application-layer activity by the flow `finish` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub prep: Timestamp,
    pub start: Timestamp,
    pub end: Timestamp,
    pub finish: Timestamp,
    pub duration: Timestamp,
}

impl TimeWindow {
    /// Widen the raw log span with one body timestamp.
    pub fn observe(&mut self, time: Timestamp, first: bool) {
        if first {
            self.prep = time;
            self.finish = time;
        } else {
            self.prep = self.prep.min(time);
            self.finish = self.finish.max(time);
        }
        self.start = self.prep;
        self.end = self.finish;
        self.duration = self.end - self.start;
    }

    pub fn narrow_to(&mut self, start: Timestamp, end: Timestamp) {
        self.start = start;
        self.end = end;
        self.duration = end - start;
    }

    /// Time relative to the start of application activity.
    pub fn rel(&self, time: Timestamp) -> Timestamp {
        time - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_order_follows_testbed_numbering() {
        let mut nodes: Vec<NodeId> = ["nrf52dk-10", "nrf52840dk-2", "nrf52dk-2", "nrf52dk-1"].into_iter().map(NodeId::from).collect();
        nodes.sort();
        let names: Vec<&str> = nodes.iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["nrf52dk-1", "nrf52dk-2", "nrf52dk-10", "nrf52840dk-2"]);
    }

    #[test]
    fn node_order_with_huge_suffix() {
        let max = format!("n-{}", u64::MAX);
        let mut nodes: Vec<NodeId> = [max.as_str(), "gw", "n-1", "n-99999999999999999999"]
            .into_iter()
            .map(NodeId::from)
            .collect();
        nodes.sort();
        let names: Vec<&str> = nodes.iter().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["n-1", max.as_str(), "gw", "n-99999999999999999999"]);
        assert!(NodeId::new(max.clone()) > NodeId::new("n-18446744073709551614"));
    }

    #[test]
    fn seq_desc_normalizes_direction() {
        let req = SeqDesc::parse("12>345").unwrap();
        let rep = SeqDesc::parse("12<345").unwrap();
        assert_eq!(req.direction, Direction::Request);
        assert_eq!(rep.direction, Direction::Reply);
        assert_eq!(req.flow_key(), rep.flow_key());
        assert_eq!(req.flow_key().as_str(), "12-345");
        assert_eq!(req.to_string(), "12>345");
        assert!(SeqDesc::parse("12").is_none());
        assert!(SeqDesc::parse("a>b").is_none());
    }

    #[test]
    fn marker_tag_names_round_trip() {
        assert_eq!(MarkerTag::parse("A_TX_RE"), MarkerTag::AppTxRetry);
        assert_eq!(MarkerTag::AppTxRetry.name(), "A_TX_RE");
        assert_eq!(MarkerTag::parse("RPL_TX_DIO"), MarkerTag::Other("RPL_TX_DIO".to_string()));
        assert!(MarkerTag::AppAckTimeout.is_application());
        assert!(!MarkerTag::NetifTx.is_application());
        let json = serde_json::to_string(&MarkerTag::IpDrop).unwrap();
        assert_eq!(json, "\"I_D\"");
    }

    #[test]
    fn flow_key_generations() {
        let key = FlowKey::new("1-2");
        assert_eq!(key.generation(1).as_str(), "1-2");
        assert_eq!(key.generation(3).as_str(), "1-2#3");
    }
}
