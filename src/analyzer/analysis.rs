//! One analysis run: header, single pass over the body, finishing passes.
//!
//! [`Analysis`] owns every tracker. Each body line is classified once and
//! the resulting event is routed to the trackers interested in it; no
//! tracker sees another's state during ingestion. [`Analysis::finish`] must
//! run after the last line and before any summary or view is taken.

use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;

use super::channel_stats::LinkStatsTracker;
use super::conn_interval::ConnIntervalTracker;
use super::conservation::{ConservationRule, Verdict, evaluate};
use super::credits::CreditTracker;
use super::event_counts::Column;
use super::flows::{FlowReconstructor, Latency};
use super::iface::IfaceValidator;
use super::liveness::LivenessTracker;
use super::log_loader::LogLoader;
use super::log_parser::{classify_output, parse_log_line};
use super::mesh_topology::MeshTopologyTracker;
use super::topology::{TopologyTracker, TopologyVocabulary};
use super::types::{Event, EventKind, LinkForm, LinkNotice, MarkerTag, NodeId, TimeWindow, Timestamp};
use crate::common::{AnalysisConfig, AnalysisResult, BufferPool, ExperimentMeta, NodeDirectory};

/// Line accounting of the body pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStats {
    /// Lines carrying a `<time>;<node>;` prefix.
    pub body: u64,
    pub classified: u64,
    /// Body lines of nodes outside the header's node list.
    pub foreign_nodes: u64,
    /// Connection events whose peer address is not in the directory.
    pub unresolved_peers: u64,
}

/// Short machine-readable result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub name: String,
    /// Application acknowledgement rate in percent.
    pub pdr_app: f64,
    /// Link-layer delivery rate in percent.
    pub pdr_ll: f64,
    pub reconns: usize,
    pub latency: Option<Latency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    meta: ExperimentMeta,
    directory: NodeDirectory,
    rules: Vec<ConservationRule>,
    buffer_pool: BufferPool,
    window: TimeWindow,
    lines: LineStats,
    liveness: LivenessTracker,
    links: LinkStatsTracker,
    credits: CreditTracker,
    topology: TopologyTracker,
    mesh: MeshTopologyTracker,
    flows: FlowReconstructor,
    iface: IfaceValidator,
    conn_intervals: ConnIntervalTracker,
    finished: bool,
}

impl Analysis {
    /// Build every tracker over the node set of the header.
    pub fn new(meta: ExperimentMeta, config: &AnalysisConfig) -> Self {
        let nodes = meta.nodes.clone();
        let vocabulary = config
            .topology_vocabulary
            .clone()
            .unwrap_or_else(|| TopologyVocabulary::for_experiment(&meta.name));

        Self {
            directory: NodeDirectory::from_addresses(&config.nodes),
            rules: config.conservation_rules.clone(),
            buffer_pool: config.buffer_pool,
            window: TimeWindow::default(),
            lines: LineStats::default(),
            liveness: LivenessTracker::new(&nodes, config.liveness_threshold),
            links: LinkStatsTracker::new(&nodes),
            credits: CreditTracker::new(&nodes),
            topology: TopologyTracker::new(&nodes, vocabulary),
            mesh: MeshTopologyTracker::new(&nodes),
            flows: FlowReconstructor::new(&nodes, config.flow_key_policy),
            iface: IfaceValidator::new(&nodes, config.watched_threads.clone()),
            conn_intervals: ConnIntervalTracker::new(&nodes),
            finished: false,
            meta,
        }
    }

    /// Analyze a complete log file.
    ///
    /// The only fatal conditions are an unreadable file and an unusable
    /// header; everything inside the body is tolerated.
    pub fn from_log_file(path: &Path, config: &AnalysisConfig) -> AnalysisResult<Self> {
        log::info!("Analyzing {}", path.display());
        let loader = LogLoader::open(path)?;
        Self::from_loader(loader, config)
    }

    pub fn from_loader<R: BufRead>(mut loader: LogLoader<R>, config: &AnalysisConfig) -> AnalysisResult<Self> {
        let meta = loader.read_header()?;
        log::info!("Experiment '{}' with {} nodes", meta.name, meta.nodes.len());

        let mut analysis = Self::new(meta, config);
        while let Some(line) = loader.next_line()? {
            analysis.ingest_line(&line);
        }
        analysis.finish();
        Ok(analysis)
    }

    /// Feed one raw body line. Lines without body prefix are ignored.
    pub fn ingest_line(&mut self, line: &str) {
        let Some((time, node, output)) = parse_log_line(line) else {
            return;
        };

        self.window.observe(time, self.lines.body == 0);
        self.lines.body += 1;
        if self.meta.nodes.binary_search(&node).is_err() {
            self.lines.foreign_nodes += 1;
        }

        if let Some(kind) = classify_output(output) {
            self.lines.classified += 1;
            self.ingest(Event { time, node, kind });
        }
    }

    /// Route one classified event to the trackers consuming it.
    pub fn ingest(&mut self, event: Event) {
        let Event { time, node, kind } = event;
        match kind {
            EventKind::Heartbeat { seq } => self.liveness.heartbeat(&node, seq),
            EventKind::OwnAddress { mac, l2addr } => {
                self.directory.observe_own_address(&node, &mac, &l2addr);
            }
            EventKind::Link(notice) => self.link(time, &node, &notice),
            EventKind::ChannelDigest(sample) => self.links.record_digest(time, &node, &sample),
            EventKind::LinkSummary(sample) => self.links.record_phy(time, &node, &sample),
            EventKind::BufferFree { free } => self.links.record_buffer(time, &node, free),
            EventKind::Credit(notice) => {
                self.flows.marker(time, &node, &notice.tag, None, None);
                self.credits.record(&node, &notice);
            }
            EventKind::Marker { tag, seq, payload } => self.flows.marker(time, &node, &tag, seq, payload),
            EventKind::IfaceCall => self.iface.call(time, &node),
            EventKind::IfaceHwAddr { addr } => self.iface.hw_addr(&node, &addr),
            EventKind::IfaceIpAddr { addr } => self.iface.ip_addr(&node, &addr),
            EventKind::ThreadState { pid, name, state } => self.iface.thread_state(time, &node, pid, &name, &state),
            EventKind::ConnParams(params) => {
                let peer = self.directory.resolve_mac(&params.peer_addr).cloned();
                if peer.is_none() {
                    log::debug!("{}: connection {} to unknown addr {}", node, params.handle, params.peer_addr);
                }
                self.conn_intervals.listed(&node, &params, peer);
            }
            EventKind::ConnUnused { handle } => self.conn_intervals.unused(&node, handle),
        }
    }

    fn link(&mut self, time: Timestamp, node: &NodeId, notice: &LinkNotice) {
        let Some(peer) = self.directory.resolve_mac(&notice.peer_addr).cloned() else {
            log::warn!("{}: unable to find node with addr {} ({})", node, notice.peer_addr, notice.action);
            self.lines.unresolved_peers += 1;
            return;
        };

        self.topology.apply(time, &notice.action, node, &peer, notice.handle);
        if notice.form == LinkForm::Mesh {
            self.mesh.apply(time, &notice.action, node, &peer, notice.handle);
        }
    }

    /// Derive everything that needs the complete stream. Runs once.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.flows.finish(&mut self.window);
        self.topology.compute_hops();
        self.liveness.finish();
        self.finished = true;
        log::info!(
            "Finished: {} body lines, {} classified, {:.1}s of activity",
            self.lines.body,
            self.lines.classified,
            self.window.duration
        );
    }

    /// Conservation verdicts over the event count matrix.
    pub fn verdicts(&self) -> Vec<Verdict> {
        evaluate(&self.rules, self.flows.counts())
    }

    pub fn overview(&self, name: &str) -> Overview {
        Overview {
            name: name.to_string(),
            pdr_app: self.flows.total().rate_ack * 100.0,
            pdr_ll: self.links.overall_rate() * 100.0,
            reconns: self.reconnects(),
            latency: self.flows.latency(),
        }
    }

    /// Connection losses of the run: `reconn` events when the mesh
    /// vocabulary was used, generic uplink losses otherwise. A mesh downlink
    /// close shows up in both trackers, so the two are never added up.
    pub fn reconnects(&self) -> usize {
        if self.mesh.used() {
            self.mesh.reconnect_count()
        } else {
            self.topology.reconnects()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn meta(&self) -> &ExperimentMeta {
        &self.meta
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.meta.nodes
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    pub fn rules(&self) -> &[ConservationRule] {
        &self.rules
    }

    pub fn buffer_pool(&self) -> BufferPool {
        self.buffer_pool
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    pub fn lines(&self) -> &LineStats {
        &self.lines
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    pub fn links(&self) -> &LinkStatsTracker {
        &self.links
    }

    pub fn credits(&self) -> &CreditTracker {
        &self.credits
    }

    pub fn topology(&self) -> &TopologyTracker {
        &self.topology
    }

    pub fn mesh(&self) -> &MeshTopologyTracker {
        &self.mesh
    }

    pub fn flows(&self) -> &FlowReconstructor {
        &self.flows
    }

    pub fn iface(&self) -> &IfaceValidator {
        &self.iface
    }

    pub fn conn_intervals(&self) -> &ConnIntervalTracker {
        &self.conn_intervals
    }

    /// Whether any credit notice was seen; credit markers also land in the
    /// event counts.
    pub fn has_credits(&self) -> bool {
        !self.credits.is_empty()
            || self.flows.counts().total(&MarkerTag::CreditInit, Column::All) > 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::analyzer::log_loader::LogLoader;
    use proptest::prelude::*;
    use std::io::Cursor;

    pub(crate) const SAMPLE_LOG: &str = "\
exp: name: ble-statconn-udp
exp: site: saclay
exp: duration: 60
exp: used_nodes: ['nrf52dk-1', 'nrf52dk-2', 'nrf52dk-3']
exp: setup.consumer.node: ['nrf52dk-1']
exp: setup.producer.node: ['nrf52dk-2', 'nrf52dk-3']
----

1000.000;nrf52dk-1;Own Address: aa:aa:aa:aa:aa:01 -> [aa:01]
1000.010;nrf52dk-2;Own Address: aa:aa:aa:aa:aa:02 -> [aa:02]
1000.020;nrf52dk-3;Own Address: AA:AA:AA:AA:AA:03 -> [aa:03]
1001.000;nrf52dk-1;ble: conn_s (0|aa:aa:aa:aa:aa:02)
1001.500;nrf52dk-2;ble: conn_s (1|aa:aa:aa:aa:aa:03)
1002.000;nrf52dk-1;ALIVE-1
1002.000;nrf52dk-2;ALIVE-1
1002.000;nrf52dk-3;ALIVE-1
1003.000;nrf52dk-3;> ~A_TX:3>1
1003.010;nrf52dk-3;~N_TX:3>1
1003.020;nrf52dk-2;~N_RX:3>1
1003.030;nrf52dk-2;~N_TX:3>1
1003.040;nrf52dk-1;~N_RX:3>1
1003.050;nrf52dk-1;~A_RX:3>1
1003.060;nrf52dk-1;~N_TX:3<1
1003.070;nrf52dk-2;~N_RX:3<1
1003.080;nrf52dk-2;~N_TX:3<1
1003.090;nrf52dk-3;~N_RX:3<1
1003.100;nrf52dk-3;~A_ACK:3<1
1004.000;nrf52dk-2;~A_TX:2>1
1004.500;nrf52dk-2;~N_TX_NC:2>1
1005.000;nrf52dk-2;ll1,a9000000000000000000000000000000000000000000000000000000000000000000000000000000
1005.000;nrf52dk-2;ll,1000000,10,500,12,600,38,9,12
1005.500;nrf52dk-2;buf30
1006.000;nrf52dk-2;~H_CI:0x20003A4C;0;10;10;0
1006.100;nrf52dk-2;~H_CS:0x20003a4c;0;9;10;1
1006.200;nrf52dk-2;~OF:256
1007.000;nrf52dk-1;ifconfig
1007.010;nrf52dk-1;Iface  6  HWaddr: AA:AA:AA:AA:AA:01
1007.020;nrf52dk-1;          inet6 addr: 2001:affe::1  scope: global  VAL
1007.100;nrf52dk-1;\t  4 | nimble_netif         | bl anyfl _ |   5 |
1008.000;nrf52dk-1;ble: close_s (0|aa:aa:aa:aa:aa:02)
1008.500;nrf52dk-1;ble: conn_s (0|ff:ff:ff:ff:ff:ff)
1009.000;nrf52dk-9;ALIVE-1
garbage line
1010.000;nrf52dk-2;something unrelated
";

    pub(crate) fn sample() -> Analysis {
        let loader = LogLoader::from_reader(Cursor::new(SAMPLE_LOG), "sample.dump");
        Analysis::from_loader(loader, &AnalysisConfig::default()).unwrap()
    }

    #[test]
    fn routes_every_event_kind() {
        let ana = sample();
        let n1 = NodeId::new("nrf52dk-1");
        let n2 = NodeId::new("nrf52dk-2");
        let n3 = NodeId::new("nrf52dk-3");

        assert!(ana.is_finished());
        assert_eq!(ana.lines().foreign_nodes, 1);
        assert_eq!(ana.lines().unresolved_peers, 1);
        assert_eq!(ana.directory().resolve_mac("aa:aa:aa:aa:aa:03"), Some(&n3));

        assert_eq!(ana.liveness().record(&n1).unwrap().count, 1);
        // nrf52dk-9 is not in the header but still gets a record
        assert_eq!(ana.liveness().broken_nodes().len(), 4);

        let flows = ana.flows();
        assert_eq!(flows.flows().len(), 2);
        let done = flows.flow("3-1").unwrap();
        assert_eq!(done.src, Some(n3.clone()));
        assert_eq!(done.dst, Some(n1.clone()));
        assert_eq!(done.ack, Some(n3.clone()));
        assert_eq!(done.path, vec![n3.clone(), n2.clone(), n1.clone(), n2.clone(), n3.clone()]);
        assert_eq!(flows.total().tx, 2);
        assert_eq!(flows.total().ack, 1);
        assert_eq!(flows.total().drop_nc_request, 1);
        assert_eq!(flows.objective_updates().len(), 1);

        assert_eq!(ana.window().start, 1003.0);
        assert_eq!(ana.window().end, 1004.0);
        assert_eq!(ana.window().prep, 1000.0);
        assert_eq!(ana.window().finish, 1010.0);

        let counters = ana.links().node_counters(&n2).unwrap();
        assert_eq!((counters.attempted[0], counters.acked[0]), (10, 9));
        assert_eq!(ana.links().buffer_summary()[&n2].min, 30);
        assert_eq!(ana.credits().instances(&n2, "0x20003a4c").len(), 1);
        assert!(ana.has_credits());

        assert_eq!(ana.topology().hop(&n1), None);
        assert_eq!(ana.topology().node(&n2).unwrap().lost, vec![1008.0]);
        assert_eq!(ana.topology().hop(&n3), None);
        assert!(!ana.mesh().used());

        let call = &ana.iface().calls()[&n1][0];
        assert_eq!(call.ip_addr.as_deref(), Some("2001:affe::1"));
        assert_eq!(ana.iface().bad_threads().len(), 1);
    }

    #[test]
    fn verdicts_and_overview() {
        let ana = sample();
        let verdicts = ana.verdicts();
        let link = verdicts.iter().find(|v| v.rule == "link layer packets").unwrap();
        assert!(link.ok);

        let requests = verdicts.iter().find(|v| v.rule == "app requests").unwrap();
        assert_eq!(requests.actual, 1);
        assert_eq!(requests.expected, 1);
        assert!(requests.ok);

        let overview = ana.overview("run");
        assert_eq!(overview.pdr_app, 50.0);
        assert_eq!(overview.pdr_ll, 90.0);
        assert_eq!(overview.reconns, 1);
        let latency = overview.latency.unwrap();
        assert!((latency.latency_avg - 0.1).abs() < 1e-9);
    }

    #[test]
    fn mesh_losses_are_not_counted_twice() {
        let log = "\
exp: name: ble-meshconn-udp
exp: used_nodes: ['n-1', 'n-2']
----
1.0;n-1;Own Address: aa:aa:aa:aa:aa:01 -> [aa:01]
1.0;n-2;Own Address: aa:aa:aa:aa:aa:02 -> [aa:02]
2.0;n-1;ble:conn_downlink aa:aa:aa:aa:aa:02 0
2.0;n-2;ble:conn_uplink aa:aa:aa:aa:aa:01 0
3.0;n-1;ble:close_downlink aa:aa:aa:aa:aa:02 0
3.0;n-2;ble:reconn aa:aa:aa:aa:aa:01 0
";
        let loader = LogLoader::from_reader(Cursor::new(log), "mesh.dump");
        let ana = Analysis::from_loader(loader, &AnalysisConfig::default()).unwrap();
        assert_eq!(ana.topology().reconnects(), 1);
        assert_eq!(ana.mesh().reconnect_count(), 1);
        assert_eq!(ana.reconnects(), 1);
        assert_eq!(ana.overview("mesh").reconns, 1);
    }

    #[test]
    fn connection_listing_is_tracked() {
        let log = "\
exp: name: ble-statconn-udp
exp: used_nodes: ['n-1', 'n-2', 'n-3']
----
1.0;n-2;Own Address: aa:aa:aa:aa:aa:02 -> [aa:02]
2.0;n-1;[ 0] AA:AA:AA:AA:AA:02 [aa:02] (M,75ms,2500ms,0)
2.0;n-1;[ 1] aa:aa:aa:aa:aa:03 [aa:03] (M,100ms,2500ms,0)
3.0;n-1;[ 2] bb:bb:bb:bb:bb:bb [bb:bb] (S,90ms,2500ms,0)
4.0;n-1;[ 2] state: 0x8000 - unused
";
        let loader = LogLoader::from_reader(Cursor::new(log), "itvl.dump");
        let ana = Analysis::from_loader(loader, &AnalysisConfig::default()).unwrap();
        let (n1, n2) = (NodeId::new("n-1"), NodeId::new("n-2"));

        let itvls = ana.conn_intervals();
        assert!(itvls.used());
        assert_eq!(itvls.intervals(&n1), vec![75, 100]);
        assert_eq!(itvls.min_spacing(&n1), Some(25));
        let slots = itvls.slots(&n1).unwrap();
        assert_eq!(slots[&0].peer, Some(n2.clone()));
        assert_eq!(slots[&1].peer, None);
        assert_eq!(itvls.min_spacing(&n2), None);
        // listing rows never count as unresolved topology peers
        assert_eq!(ana.lines().unresolved_peers, 0);
    }

    #[test]
    fn huge_node_suffix_is_ordered() {
        let big = format!("n-{}", u64::MAX);
        let log = format!(
            "exp: name: big\nexp: used_nodes: ['{big}', 'n-1']\n----\n1.0;{big};ALIVE-1\n2.0;{big};ALIVE-2\n2.5;n-1;ALIVE-1\n"
        );
        let loader = LogLoader::from_reader(Cursor::new(log), "big.dump");
        let ana = Analysis::from_loader(loader, &AnalysisConfig::default()).unwrap();

        assert_eq!(ana.nodes(), &[NodeId::new("n-1"), NodeId::new(big.clone())]);
        assert_eq!(ana.lines().foreign_nodes, 0);
        assert_eq!(ana.liveness().record(&NodeId::new(big)).unwrap().count, 2);
    }

    #[test]
    fn finish_runs_once() {
        let mut ana = sample();
        let window = *ana.window();
        ana.finish();
        assert_eq!(*ana.window(), window);
    }

    #[test]
    fn meshconn_vocabulary_feeds_both_trackers() {
        let log = "\
exp: name: ble-meshconn-udp
exp: used_nodes: ['n-1', 'n-2']
----
1.0;n-1;Own Address: aa:aa:aa:aa:aa:01 -> [aa:01]
1.0;n-2;Own Address: aa:aa:aa:aa:aa:02 -> [aa:02]
2.0;n-1;ble:conn_downlink aa:aa:aa:aa:aa:02 0
2.0;n-2;ble:conn_uplink aa:aa:aa:aa:aa:01 0
3.0;n-2;ble:reconn aa:aa:aa:aa:aa:01 0
";
        let loader = LogLoader::from_reader(Cursor::new(log), "mesh.dump");
        let ana = Analysis::from_loader(loader, &AnalysisConfig::default()).unwrap();
        let n1 = NodeId::new("n-1");
        let n2 = NodeId::new("n-2");
        assert_eq!(ana.topology().hop(&n1), Some(0));
        assert_eq!(ana.topology().hop(&n2), Some(1));
        assert_eq!(ana.mesh().hop(&n2), 1);
        assert_eq!(ana.mesh().reconnect_count(), 1);
        assert_eq!(ana.overview("mesh").reconns, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_replay_is_deterministic(cut in 0usize..40, shuffle_seed in 0u64..1000) {
            let body: Vec<&str> = SAMPLE_LOG.lines().skip_while(|l| *l != "----").skip(1).collect();
            let mut lines: Vec<&str> = body[..cut.min(body.len())].to_vec();
            let len = lines.len();
            if len > 1 {
                lines.swap((shuffle_seed as usize) % len, (shuffle_seed as usize / 7) % len);
            }
            let header = "exp: name: prop\nexp: used_nodes: ['nrf52dk-1', 'nrf52dk-2', 'nrf52dk-3']\n----\n";
            let text = format!("{}{}\n", header, lines.join("\n"));

            let run = || {
                let loader = LogLoader::from_reader(Cursor::new(text.clone()), "prop.dump");
                Analysis::from_loader(loader, &AnalysisConfig::default()).unwrap()
            };
            let first = run();
            let second = run();
            prop_assert_eq!(first.flows().total(), second.flows().total());
            prop_assert_eq!(first.flows().counts(), second.flows().counts());
            prop_assert_eq!(first.verdicts(), second.verdicts());
        }
    }
}
