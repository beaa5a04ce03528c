//! Validation of `ifconfig` output and thread states printed by `ps`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{NodeId, TimeWindow, Timestamp};
use crate::common::NodeDirectory;

/// Expected idle states of the BLE stack threads.
pub fn default_watched_threads() -> BTreeMap<String, String> {
    [
        ("nimble_host", "bl anyfl"),
        ("nimble_ctrl", "bl anyfl"),
        ("nimble_netif", "bl rx"),
    ]
    .into_iter()
    .map(|(name, state)| (name.to_string(), state.to_string()))
    .collect()
}

/// One `ifconfig` invocation and the addresses it printed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfaceCall {
    pub time: Timestamp,
    pub l2_addr: Option<String>,
    pub ip_addr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadThread {
    pub node: NodeId,
    pub time: Timestamp,
    pub pid: u32,
    pub thread: String,
    pub state: String,
    pub expected: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IfaceIssue {
    /// An `ifconfig` call that never printed a hardware address.
    Stuck { node: NodeId, time: Timestamp },
    WrongAddress { node: NodeId, time: Timestamp, reported: String, configured: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfaceValidator {
    watched: BTreeMap<String, String>,
    calls: BTreeMap<NodeId, Vec<IfaceCall>>,
    bad_threads: Vec<BadThread>,
    orphan_output: u32,
}

impl IfaceValidator {
    pub fn new(nodes: &[NodeId], watched: BTreeMap<String, String>) -> Self {
        Self {
            watched,
            calls: nodes.iter().map(|n| (n.clone(), Vec::new())).collect(),
            bad_threads: Vec::new(),
            orphan_output: 0,
        }
    }

    pub fn call(&mut self, time: Timestamp, node: &NodeId) {
        self.calls.entry(node.clone()).or_default().push(IfaceCall {
            time,
            l2_addr: None,
            ip_addr: None,
        });
    }

    pub fn hw_addr(&mut self, node: &NodeId, addr: &str) {
        match self.open_call(node, |c| c.l2_addr.is_none()) {
            Some(call) => call.l2_addr = Some(addr.to_lowercase()),
            None => {
                log::warn!("ifconfig: node {} has output without call", node);
                self.orphan_output += 1;
            }
        }
    }

    pub fn ip_addr(&mut self, node: &NodeId, addr: &str) {
        match self.open_call(node, |c| c.ip_addr.is_none()) {
            Some(call) => call.ip_addr = Some(addr.to_lowercase()),
            None => {
                log::warn!("ifconfig: node {} has IP output without ifconfig call", node);
                self.orphan_output += 1;
            }
        }
    }

    fn open_call(&mut self, node: &NodeId, open: impl Fn(&IfaceCall) -> bool) -> Option<&mut IfaceCall> {
        self.calls.get_mut(node)?.last_mut().filter(|c| open(c))
    }

    pub fn thread_state(&mut self, time: Timestamp, node: &NodeId, pid: u32, name: &str, state: &str) {
        let Some(expected) = self.watched.get(name) else {
            return;
        };
        if state != expected {
            log::warn!("ps: node {} has broken thread {} (pid {}): '{}' should be '{}'", node, name, pid, state, expected);
            self.bad_threads.push(BadThread {
                node: node.clone(),
                time,
                pid,
                thread: name.to_string(),
                state: state.to_string(),
                expected: expected.clone(),
            });
        }
    }

    pub fn calls(&self) -> &BTreeMap<NodeId, Vec<IfaceCall>> {
        &self.calls
    }

    pub fn bad_threads(&self) -> &[BadThread] {
        &self.bad_threads
    }

    pub fn orphan_output(&self) -> u32 {
        self.orphan_output
    }

    /// Stuck calls and hardware addresses deviating from the directory.
    pub fn issues(&self, directory: &NodeDirectory) -> Vec<IfaceIssue> {
        let mut issues = Vec::new();
        for (node, calls) in &self.calls {
            for call in calls {
                match &call.l2_addr {
                    None => issues.push(IfaceIssue::Stuck { node: node.clone(), time: call.time }),
                    Some(reported) => {
                        if let Some(configured) = directory.mac_of(node) {
                            if configured != reported {
                                issues.push(IfaceIssue::WrongAddress {
                                    node: node.clone(),
                                    time: call.time,
                                    reported: reported.clone(),
                                    configured: configured.to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }
        issues
    }

    /// Report lines for the summary, relative to the experiment start.
    pub fn describe(issue: &IfaceIssue, window: &TimeWindow) -> String {
        match issue {
            IfaceIssue::Stuck { node, time } => {
                format!("Ifconfig: node {} is stuck at {:.2} ({})", node, window.rel(*time), time)
            }
            IfaceIssue::WrongAddress { node, time, reported, configured } => format!(
                "Ifconfig: node {} has bad L2 addr (is:{} should:{}) @ {:.2} ({})",
                node,
                reported,
                configured,
                window.rel(*time),
                time
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> NodeDirectory {
        let mut dir = NodeDirectory::default();
        dir.insert(NodeId::new("n-1"), "c2:a1:5d:89:54:03", None);
        dir
    }

    #[test]
    fn call_collects_addresses() {
        let n = NodeId::new("n-1");
        let mut val = IfaceValidator::new(&[n.clone()], default_watched_threads());
        val.call(1.0, &n);
        val.hw_addr(&n, "C2:A1:5D:89:54:03");
        val.ip_addr(&n, "2001:affe::1");

        let call = &val.calls()[&n][0];
        assert_eq!(call.l2_addr.as_deref(), Some("c2:a1:5d:89:54:03"));
        assert_eq!(call.ip_addr.as_deref(), Some("2001:affe::1"));
        assert!(val.issues(&directory()).is_empty());
    }

    #[test]
    fn output_without_call_and_stuck_calls() {
        let n = NodeId::new("n-1");
        let mut val = IfaceValidator::new(&[n.clone()], default_watched_threads());
        val.hw_addr(&n, "c2:a1:5d:89:54:03");
        assert_eq!(val.orphan_output(), 1);

        val.call(2.0, &n);
        val.call(3.0, &n);
        val.hw_addr(&n, "aa:bb:cc:dd:ee:ff");
        val.hw_addr(&n, "aa:bb:cc:dd:ee:ff");
        assert_eq!(val.orphan_output(), 2);

        let issues = val.issues(&directory());
        assert_eq!(issues.len(), 2);
        assert!(matches!(issues[0], IfaceIssue::Stuck { time, .. } if time == 2.0));
        assert!(matches!(&issues[1], IfaceIssue::WrongAddress { reported, .. } if reported == "aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn thread_states() {
        let n = NodeId::new("n-1");
        let mut val = IfaceValidator::new(&[n.clone()], default_watched_threads());
        val.thread_state(1.0, &n, 4, "nimble_host", "bl anyfl");
        val.thread_state(1.0, &n, 5, "nimble_netif", "bl anyfl");
        val.thread_state(1.0, &n, 6, "main", "running");
        assert_eq!(val.bad_threads().len(), 1);
        assert_eq!(val.bad_threads()[0].expected, "bl rx");
    }
}
