//! Human-readable summary of a finished analysis.
//!
//! The text depends only on serialized tracker state, so a summary rendered
//! from a loaded snapshot is identical to the one of the original run.

use chrono::{DateTime, Utc};
use std::fmt::{self, Write};

use super::analysis::Analysis;
use super::channel_stats::CHANNEL_COUNT;
use super::conservation::Verdict;
use super::event_counts::{Column, TagCount};
use super::flows::FlowCounters;
use super::iface::IfaceValidator;
use super::topology::TopologyAction;
use super::types::{MarkerTag, Timestamp};

/// Columns of the per-node data traffic table.
const DATA_COLUMNS: &[(MarkerTag, Column)] = &[
    (MarkerTag::AppTx, Column::Data),
    (MarkerTag::AppTxRetry, Column::Data),
    (MarkerTag::AppTxError, Column::Data),
    (MarkerTag::AppRx, Column::Data),
    (MarkerTag::AppAck, Column::Data),
    (MarkerTag::NetifTx, Column::Data),
    (MarkerTag::NetifTxNotConnected, Column::Data),
    (MarkerTag::NetifTxAbort, Column::Data),
    (MarkerTag::NetifRx, Column::Data),
    (MarkerTag::NetifRxNoPktBuf, Column::Control),
    (MarkerTag::IpDrop, Column::Data),
];

/// Columns of the per-node all traffic table.
const ALL_COLUMNS: &[MarkerTag] = &[
    MarkerTag::AppRx,
    MarkerTag::AppTx,
    MarkerTag::AppTxRetry,
    MarkerTag::NetifRx,
    MarkerTag::NetifTx,
    MarkerTag::AppTxError,
    MarkerTag::NetifTxNotConnected,
    MarkerTag::IpDrop,
    MarkerTag::CtrlRxError,
];

/// Render the complete summary text.
pub fn render_summary(ana: &Analysis) -> String {
    let mut out = String::new();
    if let Err(e) = write_summary(&mut out, ana) {
        log::error!("failed to render summary: {}", e);
    }
    out
}

fn write_summary(out: &mut String, ana: &Analysis) -> fmt::Result {
    write_header(out, ana)?;
    write_liveness(out, ana)?;
    write_conn_intervals(out, ana)?;
    write_events(out, ana)?;
    write_verification(out, ana)?;
    write_credits(out, ana)?;
    write_flows(out, ana)?;
    write_link_layer(out, ana)?;
    write_topology(out, ana)?;
    write_iface(out, ana)
}

/// Absolute UTC rendering of a log timestamp.
fn absolute(time: Timestamp) -> String {
    let secs = time.floor();
    let nanos = (((time - secs) * 1e9).round() as u32).min(999_999_999);
    DateTime::<Utc>::from_timestamp(secs as i64, nanos)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| format!("{:.3}", time))
}

fn join<T: fmt::Display>(values: &[T]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

fn opt<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn write_header(out: &mut String, ana: &Analysis) -> fmt::Result {
    let meta = ana.meta();
    let window = ana.window();
    let lines = ana.lines();

    writeln!(out, "Experiment: {}", meta.name)?;
    writeln!(out, "Site:       {}", meta.site.as_deref().unwrap_or("-"))?;
    writeln!(out, "Nodes:      {}", meta.nodes.len())?;
    writeln!(out, "Start:      {} ({:.3})", absolute(window.start), window.start)?;
    writeln!(
        out,
        "Timestamps: prep {:.3} start {:.3} end {:.3} finish {:.3}",
        window.rel(window.prep),
        window.rel(window.start),
        window.rel(window.end),
        window.rel(window.finish)
    )?;
    writeln!(out, "Duration:   {:.3}s", window.duration)?;
    writeln!(
        out,
        "Lines:      {} body, {} classified, {} from unknown nodes, {} unresolved peers",
        lines.body, lines.classified, lines.foreign_nodes, lines.unresolved_peers
    )
}

fn write_liveness(out: &mut String, ana: &Analysis) -> fmt::Result {
    let liveness = ana.liveness();
    writeln!(out)?;
    if !liveness.used() {
        return writeln!(out, "ALIVE: skipped");
    }

    writeln!(out, "ALIVE signal summary:")?;
    for (node, rec) in liveness.records() {
        writeln!(
            out,
            "{:>15}: max:{:>5} cnt:{:>5} dups:{} lost:{} late:{}",
            node,
            opt(rec.max),
            rec.count,
            join(&rec.duplicates),
            join(&rec.gaps),
            join(&rec.reordered)
        )?;
    }
    let broken = liveness.broken_nodes();
    if !broken.is_empty() {
        writeln!(out, "ALIVE: broken nodes: {}", join(&broken))?;
    }
    Ok(())
}

fn write_conn_intervals(out: &mut String, ana: &Analysis) -> fmt::Result {
    let itvls = ana.conn_intervals();
    writeln!(out, "\nConnection Interval Summary:")?;
    for node in itvls.nodes() {
        writeln!(
            out,
            "{:>15} min spacing:{:>3} itvls:{}",
            node,
            opt(itvls.min_spacing(node)),
            join(&itvls.intervals(node))
        )?;
    }
    Ok(())
}

fn write_events(out: &mut String, ana: &Analysis) -> fmt::Result {
    let window = ana.window();
    let flows = ana.flows();
    let counts = flows.counts();

    writeln!(out, "\nExpstats: Summary of last link layer packet sent per node:")?;
    for (node, last) in flows.last_link_tx() {
        writeln!(out, "{:>13}  n_tx:{:.3} ({:.3})", node, window.rel(*last), last)?;
    }

    writeln!(out, "\nExpstats: Summary of events:")?;
    let mut totals: Vec<(&MarkerTag, &TagCount)> = counts.totals().iter().collect();
    totals.sort_by(|a, b| a.0.name().cmp(b.0.name()));
    for (tag, count) in totals {
        writeln!(out, "{:<15}: {:>6}   (data:{:>6}, ctrl:{:>6})", tag, count.all, count.data, count.control)?;
    }

    writeln!(out, "\nExpstats: Count of selected events per node, DATA TRAFFIC only")?;
    write!(out, "{:<15}:", "node")?;
    for (tag, _) in DATA_COLUMNS {
        write!(out, " {:>8}", tag)?;
    }
    writeln!(out)?;
    for node in counts.nodes() {
        write!(out, "{:<15}:", node)?;
        for (tag, col) in DATA_COLUMNS {
            write!(out, " {:>8}", counts.node(node, tag, *col))?;
        }
        writeln!(out)?;
    }
    write!(out, "{:<15}:", "sum")?;
    for (tag, col) in DATA_COLUMNS {
        write!(out, " {:>8}", counts.total(tag, *col))?;
    }
    writeln!(out)?;

    writeln!(out, "\nExpstats: Count of selected events per node, ALL TRAFFIC")?;
    write!(out, "{:<15}:", "node")?;
    for tag in ALL_COLUMNS {
        write!(out, " {:>8}", tag)?;
    }
    writeln!(out)?;
    for node in counts.nodes() {
        write!(out, "{:<15}:", node)?;
        for tag in ALL_COLUMNS {
            write!(out, " {:>8}", counts.node(node, tag, Column::All))?;
        }
        writeln!(out)?;
    }
    write!(out, "{:<15}:", "sum")?;
    for tag in ALL_COLUMNS {
        write!(out, " {:>8}", counts.total(tag, Column::All))?;
    }
    writeln!(out)
}

fn signed_terms(verdict: &Verdict, negate: impl Fn(usize) -> bool) -> String {
    let mut text = String::new();
    for (i, value) in verdict.terms.iter().enumerate() {
        match (i, negate(i)) {
            (0, false) => text.push_str(&value.to_string()),
            (0, true) => text.push_str(&format!("-{}", value)),
            (_, false) => text.push_str(&format!(" + {}", value)),
            (_, true) => text.push_str(&format!(" - {}", value)),
        }
    }
    text
}

fn write_verification(out: &mut String, ana: &Analysis) -> fmt::Result {
    writeln!(out, "\n#### Data traffic packet count verification ####")?;
    let verdicts = ana.verdicts();
    for rule in ana.rules() {
        writeln!(out, "---- {} -> {}", rule.name, rule.formula())?;
        for verdict in verdicts.iter().filter(|v| v.rule == rule.name) {
            let state = if verdict.ok { "OK" } else { "ER" };
            let terms = signed_terms(verdict, |i| rule.rhs.get(i).is_some_and(|t| t.negate));
            match &verdict.node {
                Some(node) => writeln!(
                    out,
                    "[{}] {:<15}: {} == {} ({})",
                    state, node, verdict.actual, verdict.expected, terms
                )?,
                None => writeln!(
                    out,
                    "[{}] {} == {} ({}) --> DIFF: {}",
                    state,
                    verdict.actual,
                    verdict.expected,
                    terms,
                    verdict.expected - verdict.actual
                )?,
            }
        }
    }
    Ok(())
}

fn write_credits(out: &mut String, ana: &Analysis) -> fmt::Result {
    if !ana.has_credits() {
        return Ok(());
    }
    let credits = ana.credits();
    writeln!(out, "\nCredits:")?;
    writeln!(
        out,
        "{:<15} {:10} {:>3} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "node", "chan", "h", "init-rx", "init-tx", "min-rx", "max-rx", "min-tx", "max-tx", "sig", "upd"
    )?;
    for (node, channels) in credits.records() {
        if channels.is_empty() {
            continue;
        }
        for (chan, instances) in channels {
            for rec in instances {
                writeln!(
                    out,
                    "{:<15} {:10} {:>3} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
                    node,
                    chan,
                    rec.handle,
                    opt(rec.init_rx),
                    opt(rec.init_tx),
                    opt(rec.rx.min),
                    opt(rec.rx.max),
                    opt(rec.tx.min),
                    opt(rec.tx.max),
                    rec.signal_count,
                    rec.update_count
                )?;
            }
        }
        let (sig, upd) = credits.node_totals(node);
        writeln!(
            out,
            "{:<15} {:10} {:>3} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
            node, "sum", "-", "-", "-", "-", "-", "-", "-", sig, upd
        )?;
    }
    Ok(())
}

fn flow_row(out: &mut String, name: &dyn fmt::Display, c: &FlowCounters) -> fmt::Result {
    writeln!(
        out,
        "{:>13}: {:>6} {:>6} {:>6} {:>6} {:>6} ({:>7.3}%/{:>7.3}%) {:>6} {:>6} {:>6} {:>7} {:>8} {:>10} {:>11}",
        name.to_string(),
        c.tx,
        c.tx_retry,
        c.tx_error,
        c.rx,
        c.ack,
        c.rate_rx * 100.0,
        c.rate_ack * 100.0,
        c.tx_dups,
        c.rx_dups,
        c.ack_dups,
        c.drop_request,
        c.drop_reply,
        c.drop_nc_request,
        c.drop_nc_reply
    )
}

fn write_flows(out: &mut String, ana: &Analysis) -> fmt::Result {
    let flows = ana.flows();
    writeln!(out, "\nExpstats summary of flows:")?;
    writeln!(
        out,
        "flows: {} total, {} broken, {} incomplete, {} unacked, {} role conflicts",
        flows.flows().len(),
        flows.broken(),
        flows.incomplete(),
        flows.unacked(),
        flows.conflicts().len()
    )?;
    for conflict in flows.conflicts() {
        writeln!(
            out,
            "  conflict {}: {} bound to {}, also claimed by {} @ {:.3}",
            conflict.key,
            conflict.role,
            conflict.bound,
            conflict.observed,
            ana.window().rel(conflict.time)
        )?;
    }

    writeln!(
        out,
        "{:>13}  {:>6} {:>6} {:>6} {:>6} {:>6}  {:>7}  {:>7}  {:>6} {:>6} {:>6} {:>7} {:>8} {:>10} {:>11}",
        "node",
        "tx",
        "tx_re",
        "tx_er",
        "rx",
        "ack",
        "rate_rx",
        "rate_ack",
        "tx_dup",
        "rx_dup",
        "ack_du",
        "drop_tx",
        "drop_ack",
        "drop_nc_tx",
        "drop_nc_ack"
    )?;
    for (node, counters) in flows.counters() {
        flow_row(out, node, counters)?;
    }
    flow_row(out, &"sum", flows.total())?;

    if let Some(latency) = flows.latency() {
        writeln!(
            out,
            "latency (ack): min {:.3}s avg {:.3}s max {:.3}s",
            latency.latency_min, latency.latency_avg, latency.latency_max
        )?;
    }
    if !flows.objective_updates().is_empty() {
        writeln!(out, "objective function updates: {}", flows.objective_updates().len())?;
    }
    Ok(())
}

fn write_link_layer(out: &mut String, ana: &Analysis) -> fmt::Result {
    let links = ana.links();
    if links.digests().is_empty() && links.buffer_summary().is_empty() {
        return writeln!(out, "\nllstats: skipped");
    }

    writeln!(out, "\nllstats: per channel counts")?;
    write!(out, "{:>15} {:>4}", "NODE", "type")?;
    for chan in 0..CHANNEL_COUNT {
        write!(out, " {:>5}", format!("CH{}", chan))?;
    }
    writeln!(out)?;

    let aggregate = links.aggregate();
    let rows = links.counters().iter().map(|(n, c)| (n.to_string(), c)).chain([("sum".to_string(), &aggregate)]);
    for (name, counters) in rows {
        write!(out, "{:>15} {:>4}", name, "tx")?;
        for value in &counters.attempted {
            write!(out, " {:>5}", value)?;
        }
        write!(out, "\n{:>15} {:>4}", name, "ok")?;
        for value in &counters.acked {
            write!(out, " {:>5}", value)?;
        }
        write!(out, "\n{:>15} {:>4}", name, "rate")?;
        for rate in counters.rates() {
            write!(out, " {:>4}%", (rate * 100.0) as i64)?;
        }
        writeln!(out)?;
    }

    writeln!(out, "llstats: Buffer state (free buffers in pool)")?;
    writeln!(out, "{:>15}  min/avg/max", "node")?;
    for (node, summary) in links.buffer_summary() {
        writeln!(out, "{:>15} {:>3}/{:>3}/{:>3}", node, summary.min, summary.avg, summary.max)?;
    }
    let pool = ana.buffer_pool();
    let window = ana.window();
    if let Some(usage) = links.buffer_usage(window.start, window.end, pool.count, pool.size) {
        writeln!(
            out,
            "Buffer usage (bytes of {:.0}): min {:.0} max {:.0} avg {:.1} median {:.1}",
            usage.size, usage.min, usage.max, usage.avg, usage.median
        )?;
    }

    writeln!(out, "\nMaster TX counts per node")?;
    writeln!(out, "{:>15} {:>8} {:>8} {:>8}", "node", "TX sent", "TX OK", "TX rate")?;
    for (node, counters) in links.counters() {
        let sent = counters.total_attempted();
        let ok = counters.total_acked();
        let rate = if sent == 0 { 0.0 } else { ok as f64 / sent as f64 };
        writeln!(out, "{:>15} {:>8} {:>8} {:>7.2}%", node, sent, ok, rate * 100.0)?;
    }

    if !links.has_phy() {
        return Ok(());
    }
    writeln!(out, "\nPHY stats - RX/TX on/off counts")?;
    writeln!(
        out,
        "{:>15} {:>8} {:>8} {:>8} |{:>8} {:>8} {:>8} |{:>8} {:>8} {:>8}",
        " ", "rx_on", "rx_off", "rx_diff", "tx_on", "tx_off", "tx_diff", "sum_on", "sum_off", "sum_diff"
    )?;
    for (node, t) in links.phy_totals() {
        let on = t.rx_on + t.tx_on;
        let off = t.rx_off + t.tx_off;
        writeln!(
            out,
            "{:>15} {:>8} {:>8} {:>8} |{:>8} {:>8} {:>8} |{:>8} {:>8} {:>8}",
            node,
            t.rx_on,
            t.rx_off,
            t.rx_on as i64 - t.rx_off as i64,
            t.tx_on,
            t.tx_off,
            t.tx_on as i64 - t.tx_off as i64,
            on,
            off,
            on as i64 - off as i64
        )?;
    }
    Ok(())
}

fn write_topology(out: &mut String, ana: &Analysis) -> fmt::Result {
    let topology = ana.topology();
    let mesh = ana.mesh();
    let window = ana.window();

    writeln!(out, "\nTOPO:")?;
    writeln!(out, "Topology effecting events:")?;
    for evt in topology.events() {
        let name = match evt.action {
            TopologyAction::Connect => &topology.vocabulary().connect,
            TopologyAction::Close => &topology.vocabulary().close,
        };
        writeln!(out, "{:>9.2} {:>15} -> {:>15} : {}", window.rel(evt.time), evt.node, evt.peer, name)?;
    }

    writeln!(out, "Topology at the end of experiment:")?;
    for line in topology.render_tree(window) {
        writeln!(out, "{}", line)?;
    }

    match topology.hop_stats() {
        Some(stats) => {
            writeln!(out, "\nHopcnt max    {:>7}", stats.max)?;
            writeln!(out, "Hopcnt mean   {:>7.3}", stats.mean)?;
            writeln!(out, "Hopcnt median {:>7.3}", stats.median)?;
        }
        None => writeln!(out, "\nHopcnt: no connected nodes")?,
    }
    writeln!(out, "Uplink losses: {}", topology.reconnects())?;

    if mesh.used() {
        writeln!(out, "\nMesh uplinks:")?;
        for (node, hop) in mesh.hops() {
            let reconns = mesh.reconnects().get(node).copied().unwrap_or(0);
            writeln!(out, "{:>15}: hops:{:>3} reconn:{:>4}", node, hop, reconns)?;
        }
        writeln!(out, "Mesh reconnects: {}", mesh.reconnect_count())?;
    }
    Ok(())
}

fn write_iface(out: &mut String, ana: &Analysis) -> fmt::Result {
    let iface = ana.iface();
    let window = ana.window();

    writeln!(out, "\nThread State Validation:")?;
    for bad in iface.bad_threads() {
        writeln!(
            out,
            "PS: node {} has broken thread {} (pid:{}) is:'{}' should:'{}' @ {:.2} ({})",
            bad.node,
            bad.thread,
            bad.pid,
            bad.state,
            bad.expected,
            window.rel(bad.time),
            bad.time
        )?;
    }

    writeln!(out, "\nIfconfig call summary:")?;
    for issue in iface.issues(ana.directory()) {
        writeln!(out, "{}", IfaceValidator::describe(&issue, window))?;
    }
    if iface.orphan_output() > 0 {
        writeln!(out, "Ifconfig: {} address lines without a call", iface.orphan_output())?;
    }
    Ok(())
}
