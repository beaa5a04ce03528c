//! Parse individual log lines and classify them into typed `Event`s.
//!
//! A body line has the shape `<seconds>.<fraction>;<node>;<output>`. The
//! output part is matched against an ordered table of line shapes; the first
//! matching entry builds the event and lines matching nothing are dropped.
//!
//! ```text
//! 1581426373.812;nrf52dk-3;ALIVE-12
//! 1581426373.903;nrf52dk-3;> ~A_TX:1>17
//! 1581426374.001;nrf52dk-3;ble: conn_s (0|c2:a1:5d:89:54:03)
//! 1581426374.120;nrf52dk-3;ll1,0011002200000000...
//! 1581426374.120;nrf52dk-3;ll,1000000,23,4500,20,3900,38,0,0
//! 1581426375.340;nrf52dk-3;~H_CS:0x20003a4c;0;10;9;1
//! ```
//!
//! Classification never mutates tracker state.

use regex::{Captures, Regex};
use std::sync::LazyLock;

use super::channel_stats::{DIGEST_LEN, decode_digest};
use super::types::{
    ConnParams, ConnRole, CreditNotice, Event, EventKind, LinkForm, LinkNotice, MarkerTag, NodeId, PhySample, SeqDesc,
    Timestamp,
};

/// One row of the classification table.
struct LineShape {
    name: &'static str,
    pattern: Regex,
    build: fn(&Captures) -> Option<EventKind>,
}

impl LineShape {
    fn new(name: &'static str, pattern: &str, build: fn(&Captures) -> Option<EventKind>) -> Self {
        let pattern = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => panic!("line shape '{}' has an invalid pattern: {}", name, e),
        };
        Self { name, pattern, build }
    }
}

/// Ordered, first-match-wins line shape table. Adding an event type means
/// adding a row here.
static LINE_SHAPES: LazyLock<Vec<LineShape>> = LazyLock::new(|| {
    vec![
        LineShape::new("heartbeat", r"ALIVE-(?P<seq>[0-9]+)", build_heartbeat),
        LineShape::new(
            "own_address",
            r"Own Address: (?P<mac>[:a-zA-Z0-9]+) -> \[(?P<l2addr>[:a-zA-Z0-9]+)\]",
            build_own_address,
        ),
        LineShape::new(
            "link_generic",
            r"ble: (?P<evt>[_a-z]+) \((?P<handle>\d+)\|(?P<addr>[0-9a-zA-Z:]+)\)",
            build_link_generic,
        ),
        LineShape::new("link_mesh", r"ble:(?P<evt>[_a-z]+) (?P<addr>[0-9a-zA-Z:]+) (?P<handle>\d+)", build_link_mesh),
        LineShape::new("channel_digest", r"^>? *ll(?P<conn>\d+),(?P<stats>[0-9a-zA-Z]+)\s*$", build_channel_digest),
        LineShape::new(
            "link_summary",
            r"^>? *ll,(?P<dur>\d+),(?P<rx_cnt>\d+),(?P<rx>\d+),(?P<tx_cnt>\d+),(?P<tx>\d+),(?P<free>\d+)(,(?P<rx_off>\d+),(?P<tx_off>\d+))?",
            build_link_summary,
        ),
        LineShape::new("buffer_free", r"^>? *buf(?P<free>\d+)", build_buffer_free),
        LineShape::new(
            "credit",
            r"^>? *~(?P<tag>H_C[A-Z]*):(?P<chan>0x[0-9a-fA-F]+);(?P<handle>\d+);(?P<rx>-?\d+);(?P<tx>-?\d+);(?P<change>-?\d+)",
            build_credit,
        ),
        LineShape::new("marker", r"^>? *~(?P<tag>[A-Z]+(_[A-Z_]+)*)(:(?P<info>.+))?", build_marker),
        LineShape::new("iface_call", r"^>? *ifconfig$", |_| Some(EventKind::IfaceCall)),
        LineShape::new("iface_hwaddr", r"Iface +\d+ +HWaddr: +(?P<addr>[a-fA-F0-9:]+)", |caps| {
            Some(EventKind::IfaceHwAddr { addr: caps["addr"].to_string() })
        }),
        LineShape::new("iface_ipaddr", r" +inet6 addr: (?P<addr>[a-fA-F0-9:]+) +scope: global", |caps| {
            Some(EventKind::IfaceIpAddr { addr: caps["addr"].to_string() })
        }),
        LineShape::new(
            "thread_state",
            r"^\s*>?\s*(?P<pid>\d+)\s+\|\s*(?P<name>[^|]+?)\s*\|\s*(?P<state>[^|]+?)\s+_\s*\|\s*(?P<prio>\d+)",
            build_thread_state,
        ),
        LineShape::new(
            "conn_params",
            r"\[ ?(?P<handle>\d+)\] (?P<peer>[0-9a-zA-Z:]+) \[(?P<l2addr>[0-9a-zA-Z:]+)\] \((?P<role>[MS]),(?P<itvl>\d+)ms,(?P<super>\d+)ms,(?P<slat>\d+)\)",
            build_conn_params,
        ),
        LineShape::new("conn_unused", r"\[ ?(?P<handle>\d+)\] state: 0x[0-9a-fA-F]+ - unused", |caps| {
            Some(EventKind::ConnUnused { handle: caps["handle"].parse().ok()? })
        }),
    ]
});

/// Split a body line into timestamp, node and console output.
///
/// Returns `None` for header lines, blank lines and anything not carrying a
/// `<seconds>.<fraction>;<node>;` prefix.
pub fn parse_log_line(line: &str) -> Option<(Timestamp, NodeId, &str)> {
    let mut parts = line.splitn(3, ';');
    let time_str = parts.next()?;
    let node_str = parts.next()?;
    let output = parts.next()?;

    let (secs, frac) = time_str.split_once('.')?;
    if secs.is_empty() || frac.is_empty() || !secs.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    if node_str.is_empty() || !node_str.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return None;
    }

    let time: Timestamp = time_str.parse().ok()?;
    Some((time, NodeId::new(node_str), output.trim_end_matches(['\r', '\n'])))
}

/// Classify the console output of one node into at most one event kind.
pub fn classify_output(output: &str) -> Option<EventKind> {
    for shape in LINE_SHAPES.iter() {
        if let Some(caps) = shape.pattern.captures(output) {
            let kind = (shape.build)(&caps);
            if kind.is_none() {
                log::debug!("line matched '{}' but carried unusable fields: {}", shape.name, output);
            }
            return kind;
        }
    }
    None
}

/// Parse and classify a complete body line.
pub fn classify_line(line: &str) -> Option<Event> {
    let (time, node, output) = parse_log_line(line)?;
    let kind = classify_output(output)?;
    Some(Event { time, node, kind })
}

fn build_heartbeat(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::Heartbeat { seq: caps["seq"].parse().ok()? })
}

fn build_own_address(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::OwnAddress {
        mac: caps["mac"].to_lowercase(),
        l2addr: caps["l2addr"].to_lowercase(),
    })
}

fn build_link(caps: &Captures, form: LinkForm) -> Option<EventKind> {
    Some(EventKind::Link(LinkNotice {
        form,
        action: caps["evt"].to_string(),
        handle: caps["handle"].parse().ok()?,
        peer_addr: caps["addr"].to_lowercase(),
    }))
}

fn build_link_generic(caps: &Captures) -> Option<EventKind> {
    build_link(caps, LinkForm::Generic)
}

fn build_link_mesh(caps: &Captures) -> Option<EventKind> {
    build_link(caps, LinkForm::Mesh)
}

fn build_channel_digest(caps: &Captures) -> Option<EventKind> {
    let conn = caps["conn"].parse().ok()?;
    if caps["stats"].len() != DIGEST_LEN {
        log::warn!("ll{}: digest has {} characters, expected {}", conn, caps["stats"].len(), DIGEST_LEN);
        return None;
    }
    decode_digest(conn, &caps["stats"]).map(EventKind::ChannelDigest)
}

fn build_link_summary(caps: &Captures) -> Option<EventKind> {
    let field = |name: &str| -> Option<u64> { caps.name(name).map_or(Some(0), |m| m.as_str().parse().ok()) };
    Some(EventKind::LinkSummary(PhySample {
        duration: field("dur")?,
        rx_count: field("rx_cnt")?,
        rx_time: field("rx")?,
        tx_count: field("tx_cnt")?,
        tx_time: field("tx")?,
        free_buffers: caps["free"].parse().ok()?,
        rx_count_off: field("rx_off")?,
        tx_count_off: field("tx_off")?,
    }))
}

fn build_buffer_free(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::BufferFree { free: caps["free"].parse().ok()? })
}

fn build_credit(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::Credit(CreditNotice {
        tag: MarkerTag::parse(&caps["tag"]),
        channel: caps["chan"].to_lowercase(),
        handle: caps["handle"].parse().ok()?,
        rx_credits: caps["rx"].parse().ok()?,
        tx_credits: caps["tx"].parse().ok()?,
        change: caps["change"].parse().ok()?,
    }))
}

fn build_marker(caps: &Captures) -> Option<EventKind> {
    let tag = MarkerTag::parse(&caps["tag"]);
    let info = caps.name("info").map(|m| m.as_str().trim());

    let (seq, payload) = match info {
        Some(info) if info.contains('>') || info.contains('<') => match SeqDesc::parse(info) {
            Some(seq) => (Some(seq), None),
            None => {
                log::debug!("~{}: unusable sequence descriptor '{}'", tag, info);
                (None, None)
            }
        },
        Some(info) => (None, info.parse::<i64>().ok()),
        None => (None, None),
    };

    Some(EventKind::Marker { tag, seq, payload })
}

fn build_conn_params(caps: &Captures) -> Option<EventKind> {
    let role = match &caps["role"] {
        "M" => ConnRole::Master,
        _ => ConnRole::Slave,
    };
    Some(EventKind::ConnParams(ConnParams {
        handle: caps["handle"].parse().ok()?,
        peer_addr: caps["peer"].to_lowercase(),
        role,
        interval_ms: caps["itvl"].parse().ok()?,
        supervision_ms: caps["super"].parse().ok()?,
        slave_latency: caps["slat"].parse().ok()?,
    }))
}

fn build_thread_state(caps: &Captures) -> Option<EventKind> {
    Some(EventKind::ThreadState {
        pid: caps["pid"].parse().ok()?,
        name: caps["name"].trim().to_string(),
        state: caps["state"].trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::types::Direction;

    #[test]
    fn test_parse_body_line() {
        let (time, node, output) = parse_log_line("1581426373.812;nrf52dk-3;ALIVE-12\n").unwrap();
        assert_eq!(time, 1581426373.812);
        assert_eq!(node.as_str(), "nrf52dk-3");
        assert_eq!(output, "ALIVE-12");
    }

    #[test]
    fn test_header_lines_are_not_body_lines() {
        assert!(parse_log_line("exp: name: em2_rpble_1s").is_none());
        assert!(parse_log_line("----").is_none());
        assert!(parse_log_line("12;nrf52dk-1;ALIVE-1").is_none());
        assert!(parse_log_line("1.5;bad node;ALIVE-1").is_none());
    }

    #[test]
    fn test_heartbeat() {
        let event = classify_line("10.0;nrf52dk-1;ALIVE-42 c2:a1:5d:89:54:03").unwrap();
        assert_eq!(event.kind, EventKind::Heartbeat { seq: 42 });
    }

    #[test]
    fn test_link_generic_and_mesh() {
        let event = classify_line("10.0;nrf52dk-1;ble: conn_s (1|C2:A1:5D:89:54:03)").unwrap();
        match event.kind {
            EventKind::Link(notice) => {
                assert_eq!(notice.form, LinkForm::Generic);
                assert_eq!(notice.action, "conn_s");
                assert_eq!(notice.handle, 1);
                assert_eq!(notice.peer_addr, "c2:a1:5d:89:54:03");
            }
            other => panic!("Expected link notice, got {:?}", other),
        }

        let event = classify_line("10.0;nrf52dk-1;ble:conn_uplink c2:a1:5d:89:54:03 0").unwrap();
        match event.kind {
            EventKind::Link(notice) => {
                assert_eq!(notice.form, LinkForm::Mesh);
                assert_eq!(notice.action, "conn_uplink");
            }
            other => panic!("Expected link notice, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_digest() {
        let digest = format!("ll2,{}{}", "a1", "0".repeat(78));
        let event = classify_line(&format!("1.0;nrf52dk-1;{}", digest)).unwrap();
        match event.kind {
            EventKind::ChannelDigest(sample) => {
                assert_eq!(sample.conn, 2);
                assert_eq!(sample.attempted[0], 10);
                assert_eq!(sample.acked[0], 1);
                assert_eq!(sample.sum_attempted(), 10);
            }
            other => panic!("Expected channel digest, got {:?}", other),
        }
    }

    #[test]
    fn test_short_digest_is_dropped() {
        assert!(classify_line("1.0;nrf52dk-1;ll2,0000").is_none());
    }

    #[test]
    fn test_long_digest_is_dropped() {
        let digest = "0".repeat(82);
        assert!(classify_line(&format!("1.0;nrf52dk-1;ll2,{}", digest)).is_none());
        let digest = "0".repeat(80);
        assert!(classify_line(&format!("1.0;nrf52dk-1;ll2,{}  ", digest)).is_some());
    }

    #[test]
    fn test_connection_listing() {
        let event = classify_line("1.0;nrf52dk-1;[ 1] C2:A1:5D:89:54:03 [c2:a1] (M,75ms,2500ms,0)").unwrap();
        assert_eq!(
            event.kind,
            EventKind::ConnParams(ConnParams {
                handle: 1,
                peer_addr: "c2:a1:5d:89:54:03".to_string(),
                role: ConnRole::Master,
                interval_ms: 75,
                supervision_ms: 2500,
                slave_latency: 0,
            })
        );

        let event = classify_line("1.0;nrf52dk-1;[12] state: 0x8000 - unused").unwrap();
        assert_eq!(event.kind, EventKind::ConnUnused { handle: 12 });
    }

    #[test]
    fn test_link_summary_with_and_without_off_counters() {
        let event = classify_line("1.0;nrf52dk-1;ll,1000,5,400,6,500,38").unwrap();
        match event.kind {
            EventKind::LinkSummary(phy) => {
                assert_eq!(phy.free_buffers, 38);
                assert_eq!(phy.rx_count_off, 0);
            }
            other => panic!("Expected link summary, got {:?}", other),
        }

        let event = classify_line("1.0;nrf52dk-1;> ll,1000,5,400,6,500,38,4,6").unwrap();
        match event.kind {
            EventKind::LinkSummary(phy) => {
                assert_eq!(phy.rx_count_off, 4);
                assert_eq!(phy.tx_count_off, 6);
            }
            other => panic!("Expected link summary, got {:?}", other),
        }
    }

    #[test]
    fn test_credit_precedes_generic_marker() {
        let event = classify_line("1.0;nrf52dk-1;~H_CS:0x20003A4C;0;10;9;1").unwrap();
        match event.kind {
            EventKind::Credit(notice) => {
                assert_eq!(notice.tag, MarkerTag::CreditSignal);
                assert_eq!(notice.channel, "0x20003a4c");
                assert_eq!((notice.rx_credits, notice.tx_credits, notice.change), (10, 9, 1));
            }
            other => panic!("Expected credit notice, got {:?}", other),
        }
    }

    #[test]
    fn test_markers() {
        let event = classify_line("1.0;nrf52dk-1;> ~A_TX:1>17").unwrap();
        assert_eq!(
            event.kind,
            EventKind::Marker {
                tag: MarkerTag::AppTx,
                seq: Some(SeqDesc { id: 1, direction: Direction::Request, seq: 17 }),
                payload: None,
            }
        );

        let event = classify_line("1.0;nrf52dk-1;~N_RX").unwrap();
        assert_eq!(event.kind, EventKind::Marker { tag: MarkerTag::NetifRx, seq: None, payload: None });

        let event = classify_line("1.0;nrf52dk-1;~OF:512").unwrap();
        assert_eq!(event.kind, EventKind::Marker { tag: MarkerTag::ObjectiveFunction, seq: None, payload: Some(512) });

        let event = classify_line("1.0;nrf52dk-1;~N_TX:x>y").unwrap();
        assert_eq!(event.kind, EventKind::Marker { tag: MarkerTag::NetifTx, seq: None, payload: None });
    }

    #[test]
    fn test_iface_and_thread_lines() {
        assert_eq!(classify_line("1.0;nrf52dk-1;> ifconfig").unwrap().kind, EventKind::IfaceCall);
        assert_eq!(
            classify_line("1.0;nrf52dk-1;Iface  6  HWaddr: C2:A1:5D:89:54:03").unwrap().kind,
            EventKind::IfaceHwAddr { addr: "C2:A1:5D:89:54:03".to_string() }
        );
        assert_eq!(
            classify_line("1.0;nrf52dk-1;          inet6 addr: 2001:affe::1  scope: global  VAL").unwrap().kind,
            EventKind::IfaceIpAddr { addr: "2001:affe::1".to_string() }
        );
        assert_eq!(
            classify_line("1.0;nrf52dk-1;\t  4 | nimble_host          | bl rx    _ |   5 |").unwrap().kind,
            EventKind::ThreadState { pid: 4, name: "nimble_host".to_string(), state: "bl rx".to_string() }
        );
    }

    #[test]
    fn test_unparseable_output() {
        assert!(classify_line("1.0;nrf52dk-1;main(): This is RIOT!").is_none());
        assert!(classify_line("This is not a valid log line").is_none());
    }
}
