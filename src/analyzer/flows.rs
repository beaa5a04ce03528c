//! End-to-end flow reconstruction from per-hop markers.
//!
//! Every marker carrying a sequence descriptor belongs to the flow keyed by
//! the descriptor with its direction stripped, so the request and the reply
//! leg of one packet end up in the same [`Flow`]. Roles (source,
//! destination, acknowledger) are bound by the first node reporting them.
//!
//! Aggregates that need the whole stream are derived in
//! [`FlowReconstructor::finish`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::event_counts::EventCounts;
use super::types::{Direction, FlowKey, MarkerTag, NodeId, SeqDesc, TimeWindow, Timestamp};

/// How markers reusing an existing flow key are assigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyPolicy {
    /// Every marker sharing a key belongs to one flow.
    #[default]
    Merge,
    /// A marker arriving more than this many seconds after the last marker
    /// of the flow opens a new generation of the key.
    SplitAfterIdle(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropRecord {
    pub node: NodeId,
    pub time: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Source,
    Destination,
    Acknowledger,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Source => "SOURCE",
            Role::Destination => "DEST",
            Role::Acknowledger => "ACK",
        };
        f.pad(name)
    }
}

/// A second node claiming an already bound role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleConflict {
    pub key: FlowKey,
    pub role: Role,
    pub bound: NodeId,
    pub observed: NodeId,
    pub time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub key: FlowKey,
    pub src: Option<NodeId>,
    pub dst: Option<NodeId>,
    pub ack: Option<NodeId>,
    /// Nodes touched, consecutive repeats collapsed.
    pub path: Vec<NodeId>,
    pub t_tx: Vec<Timestamp>,
    pub t_tx_retry: Vec<Timestamp>,
    pub t_tx_error: Vec<Timestamp>,
    pub t_rx: Vec<Timestamp>,
    pub t_ack: Vec<Timestamp>,
    pub drop_request: Vec<DropRecord>,
    pub drop_reply: Vec<DropRecord>,
    pub drop_nc_request: Vec<DropRecord>,
    pub drop_nc_reply: Vec<DropRecord>,
    pub last_seen: Timestamp,
}

impl Flow {
    pub fn new(key: FlowKey, time: Timestamp) -> Self {
        Self {
            key,
            src: None,
            dst: None,
            ack: None,
            path: Vec::new(),
            t_tx: Vec::new(),
            t_tx_retry: Vec::new(),
            t_tx_error: Vec::new(),
            t_rx: Vec::new(),
            t_ack: Vec::new(),
            drop_request: Vec::new(),
            drop_reply: Vec::new(),
            drop_nc_request: Vec::new(),
            drop_nc_reply: Vec::new(),
            last_seen: time,
        }
    }

    /// A flow without destination is incomplete.
    pub fn is_complete(&self) -> bool {
        self.dst.is_some()
    }

    pub fn is_acked(&self) -> bool {
        self.ack.is_some()
    }

    pub fn is_broken(&self) -> bool {
        self.src.is_none()
    }

    pub fn first_tx(&self) -> Option<Timestamp> {
        self.t_tx.first().copied()
    }

    /// First RX minus first TX, zero when the RX was logged earlier.
    pub fn rx_completion(&self) -> Option<f64> {
        let tx = self.first_tx()?;
        let rx = self.t_rx.first()?;
        Some((rx - tx).max(0.0))
    }

    pub fn ack_completion(&self) -> Option<f64> {
        let tx = self.first_tx()?;
        let ack = self.t_ack.first()?;
        Some(ack - tx)
    }
}

/// Flow counters of one source node, or of all flows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowCounters {
    pub all: u64,
    /// Flows with at least one transmission.
    pub tx: u64,
    pub tx_retry: u64,
    pub tx_error: u64,
    pub rx: u64,
    pub ack: u64,
    pub rate_rx: f64,
    pub rate_ack: f64,
    pub tx_dups: u64,
    pub rx_dups: u64,
    pub ack_dups: u64,
    pub drop_request: u64,
    pub drop_reply: u64,
    pub drop_nc_request: u64,
    pub drop_nc_reply: u64,
}

impl FlowCounters {
    fn count(&mut self, flow: &Flow) {
        self.all += 1;
        self.tx_retry += flow.t_tx_retry.len() as u64;
        self.tx_error += flow.t_tx_error.len() as u64;
        for (times, seen, dups) in [
            (&flow.t_tx, &mut self.tx, &mut self.tx_dups),
            (&flow.t_rx, &mut self.rx, &mut self.rx_dups),
            (&flow.t_ack, &mut self.ack, &mut self.ack_dups),
        ] {
            if !times.is_empty() {
                *seen += 1;
                *dups += times.len() as u64 - 1;
            }
        }
    }

    fn update_rates(&mut self) {
        if self.tx > 0 {
            self.rate_rx = self.rx as f64 / self.tx as f64;
            self.rate_ack = self.ack as f64 / self.tx as f64;
        } else {
            self.rate_rx = 0.0;
            self.rate_ack = 0.0;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub time: Timestamp,
    pub node: NodeId,
    pub tag: MarkerTag,
    pub seq: Option<SeqDesc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveUpdate {
    pub time: Timestamp,
    pub node: NodeId,
    pub value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Latency {
    pub latency_min: f64,
    pub latency_avg: f64,
    pub latency_max: f64,
}

impl Latency {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        Some(Self {
            latency_min: samples.iter().copied().fold(f64::INFINITY, f64::min),
            latency_avg: samples.iter().sum::<f64>() / samples.len() as f64,
            latency_max: samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

/// Time-to-completion samples (seconds) of RX and ACK.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionTimes {
    pub rx: Vec<f64>,
    pub ack: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowReconstructor {
    policy: KeyPolicy,
    flows: Vec<Flow>,
    /// Base key to the flow of its current generation.
    index: BTreeMap<FlowKey, usize>,
    generations: BTreeMap<FlowKey, u32>,
    conflicts: Vec<RoleConflict>,
    markers: Vec<MarkerRecord>,
    counts: EventCounts,
    objective: Vec<ObjectiveUpdate>,
    last_link_tx: BTreeMap<NodeId, Timestamp>,
    app_span: Option<(Timestamp, Timestamp)>,
    counters: BTreeMap<NodeId, FlowCounters>,
    total: FlowCounters,
    broken: u64,
}

impl FlowReconstructor {
    pub fn new(nodes: &[NodeId], policy: KeyPolicy) -> Self {
        Self {
            policy,
            flows: Vec::new(),
            index: BTreeMap::new(),
            generations: BTreeMap::new(),
            conflicts: Vec::new(),
            markers: Vec::new(),
            counts: EventCounts::new(nodes),
            objective: Vec::new(),
            last_link_tx: nodes.iter().map(|n| (n.clone(), 0.0)).collect(),
            app_span: None,
            counters: nodes.iter().map(|n| (n.clone(), FlowCounters::default())).collect(),
            total: FlowCounters::default(),
            broken: 0,
        }
    }

    /// Feed one `~TAG[:info]` marker.
    pub fn marker(
        &mut self,
        time: Timestamp,
        node: &NodeId,
        tag: &MarkerTag,
        seq: Option<SeqDesc>,
        payload: Option<i64>,
    ) {
        self.counts.add(node, tag, seq.as_ref());
        self.markers.push(MarkerRecord {
            time,
            node: node.clone(),
            tag: tag.clone(),
            seq,
        });

        if tag.is_application() {
            self.app_span = Some(match self.app_span {
                None => (time, time),
                Some((start, end)) => (start.min(time), end.max(time)),
            });
        }

        match tag {
            MarkerTag::NetifTx => {
                let last = self.last_link_tx.entry(node.clone()).or_insert(0.0);
                if time > *last {
                    *last = time;
                }
            }
            MarkerTag::ObjectiveFunction => {
                if let Some(value) = payload {
                    self.objective.push(ObjectiveUpdate { time, node: node.clone(), value });
                }
            }
            _ => {}
        }

        if let Some(desc) = seq {
            self.update_flow(time, node, tag, &desc);
        }
    }

    fn locate(&mut self, key: &FlowKey, time: Timestamp) -> usize {
        if let Some(&idx) = self.index.get(key) {
            let stale = match self.policy {
                KeyPolicy::Merge => false,
                KeyPolicy::SplitAfterIdle(idle) => time - self.flows[idx].last_seen > idle,
            };
            if !stale {
                return idx;
            }
        }

        let generation = self.generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        if *generation > 1 {
            log::debug!("flow {}: opening generation {}", key, generation);
        }
        self.flows.push(Flow::new(key.generation(*generation), time));
        let idx = self.flows.len() - 1;
        self.index.insert(key.clone(), idx);
        idx
    }

    fn update_flow(&mut self, time: Timestamp, node: &NodeId, tag: &MarkerTag, desc: &SeqDesc) {
        let idx = self.locate(&desc.flow_key(), time);
        let flow = &mut self.flows[idx];
        let conflicts = &mut self.conflicts;

        if flow.path.last() != Some(node) {
            flow.path.push(node.clone());
        }
        flow.last_seen = flow.last_seen.max(time);

        let dropped = || DropRecord { node: node.clone(), time };
        match tag {
            MarkerTag::AppTx => {
                bind(&mut flow.src, Role::Source, &flow.key, node, time, conflicts);
                flow.t_tx.push(time);
            }
            MarkerTag::AppTxError => {
                bind(&mut flow.src, Role::Source, &flow.key, node, time, conflicts);
                flow.t_tx_error.push(time);
            }
            MarkerTag::AppTxRetry => flow.t_tx_retry.push(time),
            MarkerTag::AppRx => {
                bind(&mut flow.dst, Role::Destination, &flow.key, node, time, conflicts);
                flow.t_rx.push(time);
            }
            MarkerTag::AppAck => {
                bind(&mut flow.ack, Role::Acknowledger, &flow.key, node, time, conflicts);
                flow.t_ack.push(time);
            }
            MarkerTag::IpDrop => match desc.direction {
                Direction::Request => flow.drop_request.push(dropped()),
                Direction::Reply => flow.drop_reply.push(dropped()),
            },
            MarkerTag::NetifTxNotConnected => match desc.direction {
                Direction::Request => flow.drop_nc_request.push(dropped()),
                Direction::Reply => flow.drop_nc_reply.push(dropped()),
            },
            _ => {}
        }
    }

    /// Narrow the window to application activity and derive the counters.
    pub fn finish(&mut self, window: &mut TimeWindow) {
        if self.markers.is_empty() {
            return;
        }
        if let Some((start, end)) = self.app_span {
            window.narrow_to(start, end);
        }

        for counters in self.counters.values_mut() {
            *counters = FlowCounters::default();
        }
        self.total = FlowCounters::default();
        self.broken = 0;

        for flow in &self.flows {
            let Some(src) = &flow.src else {
                log::warn!("flow {} is broken: no source node (path {:?})", flow.key, path_names(flow));
                self.broken += 1;
                continue;
            };
            if flow.t_tx.len() > 1 {
                log::debug!("flow {} transmitted {} times", flow.key, flow.t_tx.len());
            }

            self.total.count(flow);
            self.counters.entry(src.clone()).or_default().count(flow);

            for (drops, field) in [
                (&flow.drop_request, DropField::Request),
                (&flow.drop_reply, DropField::Reply),
                (&flow.drop_nc_request, DropField::NcRequest),
                (&flow.drop_nc_reply, DropField::NcReply),
            ] {
                if let Some(first) = drops.first() {
                    *field.slot(&mut self.total) += 1;
                    *field.slot(self.counters.entry(first.node.clone()).or_default()) += 1;
                }
            }
        }

        self.total.update_rates();
        for counters in self.counters.values_mut() {
            counters.update_rates();
        }
        log::info!(
            "flows: {} reconstructed, {} broken, {} role conflicts",
            self.flows.len(),
            self.broken,
            self.conflicts.len()
        );
    }

    /// Completion times of flows whose source passes `keep`.
    pub fn completion_times(&self, keep: impl Fn(&NodeId) -> bool) -> CompletionTimes {
        let mut times = CompletionTimes::default();
        for flow in &self.flows {
            let Some(src) = &flow.src else { continue };
            if !keep(src) {
                continue;
            }
            times.rx.extend(flow.rx_completion());
            times.ack.extend(flow.ack_completion());
        }
        times
    }

    /// Round trip latency over every acknowledged flow.
    pub fn latency(&self) -> Option<Latency> {
        Latency::from_samples(&self.completion_times(|_| true).ack)
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    /// Flow by its full key (including a `#<generation>` suffix).
    pub fn flow(&self, key: &str) -> Option<&Flow> {
        self.flows.iter().find(|f| f.key.as_str() == key)
    }

    pub fn conflicts(&self) -> &[RoleConflict] {
        &self.conflicts
    }

    pub fn markers(&self) -> &[MarkerRecord] {
        &self.markers
    }

    pub fn counts(&self) -> &EventCounts {
        &self.counts
    }

    pub fn objective_updates(&self) -> &[ObjectiveUpdate] {
        &self.objective
    }

    pub fn last_link_tx(&self) -> &BTreeMap<NodeId, Timestamp> {
        &self.last_link_tx
    }

    pub fn counters(&self) -> &BTreeMap<NodeId, FlowCounters> {
        &self.counters
    }

    pub fn total(&self) -> &FlowCounters {
        &self.total
    }

    pub fn broken(&self) -> u64 {
        self.broken
    }

    pub fn incomplete(&self) -> usize {
        self.flows.iter().filter(|f| !f.is_complete()).count()
    }

    pub fn unacked(&self) -> usize {
        self.flows.iter().filter(|f| !f.is_acked()).count()
    }
}

#[derive(Clone, Copy)]
enum DropField {
    Request,
    Reply,
    NcRequest,
    NcReply,
}

impl DropField {
    fn slot(self, counters: &mut FlowCounters) -> &mut u64 {
        match self {
            DropField::Request => &mut counters.drop_request,
            DropField::Reply => &mut counters.drop_reply,
            DropField::NcRequest => &mut counters.drop_nc_request,
            DropField::NcReply => &mut counters.drop_nc_reply,
        }
    }
}

fn bind(
    slot: &mut Option<NodeId>,
    role: Role,
    key: &FlowKey,
    node: &NodeId,
    time: Timestamp,
    conflicts: &mut Vec<RoleConflict>,
) {
    match slot {
        None => *slot = Some(node.clone()),
        Some(bound) if bound != node => {
            log::warn!("flow {}: duplicate {} node {} (bound to {})", key, role, node, bound);
            conflicts.push(RoleConflict {
                key: key.clone(),
                role,
                bound: bound.clone(),
                observed: node.clone(),
                time,
            });
        }
        Some(_) => {}
    }
}

fn path_names(flow: &Flow) -> Vec<&str> {
    flow.path.iter().map(NodeId::as_str).collect()
}
