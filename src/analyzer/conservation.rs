//! Cross-layer packet conservation checks over the event count matrix.
//!
//! A rule states that one count equals a signed sum of other counts. Rules
//! are plain data so that a protocol under test can bring its own set; the
//! defaults describe the BLE/IPv6 request/reply experiments. A failing
//! rule is a diagnostic about the experiment, never an analysis error.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::event_counts::{Column, EventCounts};
use super::types::{MarkerTag, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub tag: MarkerTag,
    #[serde(default)]
    pub column: Column,
}

impl Term {
    pub fn new(tag: MarkerTag, column: Column) -> Self {
        Self { tag, column }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.tag, self.column.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTerm {
    pub tag: MarkerTag,
    #[serde(default)]
    pub column: Column,
    #[serde(default)]
    pub negate: bool,
}

impl SignedTerm {
    pub fn plus(tag: MarkerTag, column: Column) -> Self {
        Self { tag, column, negate: false }
    }

    pub fn minus(tag: MarkerTag, column: Column) -> Self {
        Self { tag, column, negate: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    PerNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConservationRule {
    pub name: String,
    pub scope: Scope,
    pub lhs: Term,
    pub rhs: Vec<SignedTerm>,
}

impl ConservationRule {
    /// `LHS == a + b - c` rendering used in reports.
    pub fn formula(&self) -> String {
        let mut out = format!("{} ==", self.lhs);
        for (i, term) in self.rhs.iter().enumerate() {
            let op = match (i, term.negate) {
                (0, false) => "",
                (0, true) => " -",
                (_, false) => " +",
                (_, true) => " -",
            };
            out.push_str(&format!("{} {}[{}]", op, term.tag, term.column.name()));
        }
        out
    }
}

/// Outcome of one rule at one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub rule: String,
    /// `None` for global rules.
    pub node: Option<NodeId>,
    /// Value of the right-hand side.
    pub expected: i64,
    /// Value of the left-hand side.
    pub actual: i64,
    /// Right-hand side term values, in rule order and unsigned.
    pub terms: Vec<i64>,
    pub ok: bool,
}

/// Rules matching the request/reply flows of the BLE experiments.
pub fn default_rules() -> Vec<ConservationRule> {
    use Column::{All, Data, Reply, Request};
    use MarkerTag::*;

    vec![
        ConservationRule {
            name: "link layer packets".into(),
            scope: Scope::Global,
            lhs: Term::new(NetifRx, Data),
            rhs: vec![SignedTerm::plus(NetifTx, Data)],
        },
        ConservationRule {
            name: "app requests".into(),
            scope: Scope::Global,
            lhs: Term::new(AppRx, Data),
            rhs: vec![
                SignedTerm::plus(AppTx, Data),
                SignedTerm::plus(AppTxRetry, Data),
                SignedTerm::minus(AppTxError, Data),
                SignedTerm::minus(IpDrop, Request),
                SignedTerm::minus(NetifTxNotConnected, Request),
            ],
        },
        ConservationRule {
            name: "app replies".into(),
            scope: Scope::Global,
            lhs: Term::new(AppAck, Data),
            rhs: vec![
                SignedTerm::plus(AppRx, Data),
                SignedTerm::minus(IpDrop, Reply),
                SignedTerm::minus(NetifTxNotConnected, Reply),
            ],
        },
        ConservationRule {
            name: "link layer packets per node".into(),
            scope: Scope::PerNode,
            lhs: Term::new(NetifTx, Data),
            rhs: vec![
                SignedTerm::plus(NetifRx, Data),
                SignedTerm::plus(AppTx, Data),
                SignedTerm::plus(AppTxRetry, Data),
                SignedTerm::minus(AppTxError, Data),
                SignedTerm::minus(AppAck, Data),
                SignedTerm::minus(IpDrop, Data),
                SignedTerm::minus(NetifTxNotConnected, Data),
                SignedTerm::minus(NetifRxNoPktBuf, All),
            ],
        },
    ]
}

fn check(rule: &ConservationRule, node: Option<&NodeId>, lookup: impl Fn(&MarkerTag, Column) -> u64) -> Verdict {
    let actual = lookup(&rule.lhs.tag, rule.lhs.column) as i64;
    let terms: Vec<i64> = rule.rhs.iter().map(|t| lookup(&t.tag, t.column) as i64).collect();
    let expected = rule
        .rhs
        .iter()
        .zip(&terms)
        .map(|(t, &v)| if t.negate { -v } else { v })
        .sum();

    let ok = actual == expected;
    if !ok {
        match node {
            Some(n) => log::warn!("conservation '{}' fails at {}: {} != {}", rule.name, n, actual, expected),
            None => log::warn!("conservation '{}' fails: {} != {}", rule.name, actual, expected),
        }
    }
    Verdict {
        rule: rule.name.clone(),
        node: node.cloned(),
        expected,
        actual,
        terms,
        ok,
    }
}

/// One verdict per global rule and one per node for per-node rules.
pub fn evaluate(rules: &[ConservationRule], counts: &EventCounts) -> Vec<Verdict> {
    let mut verdicts = Vec::new();
    for rule in rules {
        match rule.scope {
            Scope::Global => verdicts.push(check(rule, None, |tag, col| counts.total(tag, col))),
            Scope::PerNode => {
                for node in counts.nodes() {
                    verdicts.push(check(rule, Some(node), |tag, col| counts.node(node, tag, col)));
                }
            }
        }
    }
    verdicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::types::SeqDesc;

    fn add(counts: &mut EventCounts, node: &str, tag: &str, info: &str) {
        counts.add(&NodeId::new(node), &MarkerTag::parse(tag), SeqDesc::parse(info).as_ref());
    }

    #[test]
    fn clean_exchange_passes_every_rule() {
        let a = NodeId::new("n-1");
        let b = NodeId::new("n-2");
        let mut counts = EventCounts::new(&[a, b]);
        add(&mut counts, "n-1", "A_TX", "1>1");
        add(&mut counts, "n-1", "N_TX", "1>1");
        add(&mut counts, "n-2", "N_RX", "1>1");
        add(&mut counts, "n-2", "A_RX", "1>1");
        add(&mut counts, "n-2", "N_TX", "1<1");
        add(&mut counts, "n-1", "N_RX", "1<1");
        add(&mut counts, "n-1", "A_ACK", "1<1");

        let verdicts = evaluate(&default_rules(), &counts);
        assert_eq!(verdicts.len(), 3 + 2);
        assert!(verdicts.iter().all(|v| v.ok), "{:?}", verdicts);
    }

    #[test]
    fn lost_link_packet_is_reported() {
        let mut counts = EventCounts::new(&[NodeId::new("n-1")]);
        add(&mut counts, "n-1", "N_TX", "1>1");

        let verdicts = evaluate(&default_rules(), &counts);
        let link = &verdicts[0];
        assert!(!link.ok);
        assert_eq!((link.actual, link.expected), (0, 1));
    }

    #[test]
    fn rules_load_from_toml() {
        let text = r#"
            name = "custom"
            scope = "per_node"
            lhs = { tag = "N_TX" }
            rhs = [ { tag = "N_RX", column = "all" }, { tag = "I_D", negate = true } ]
        "#;
        let rule: ConservationRule = toml::from_str(text).unwrap();
        assert_eq!(rule.lhs.column, Column::Data);
        assert!(rule.rhs[1].negate);
        assert_eq!(rule.formula(), "N_TX[data] == N_RX[all] - I_D[data]");
    }
}
