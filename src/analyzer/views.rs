//! Read-only, time-normalized views for the plotting layer.
//!
//! A [`ViewWindow`] selects nodes, a bin size and a time span. It is
//! resolved against the experiment [`TimeWindow`]; every view then reports
//! times relative to the start of application activity.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::analysis::Analysis;
use super::channel_stats::delivery_rate;
use super::topology::HopSample;
use super::types::{MarkerTag, NodeId, TimeWindow, Timestamp};
use crate::common::{AnalysisError, AnalysisResult};

/// Candidate bin sizes (seconds) when none is given.
const AUTO_BIN_SIZES: &[f64] = &[1.0, 10.0, 30.0, 60.0, 300.0, 600.0, 3600.0, 36000.0];

/// Upper bound on the number of bins an automatic bin size may produce.
const MAX_AUTO_BINS: f64 = 150.0;

/// Upper bound on the number of bins of any view.
pub const MAX_VIEW_BINS: usize = 100_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSelection {
    #[default]
    All,
    Only(BTreeSet<NodeId>),
    Except(BTreeSet<NodeId>),
}

impl NodeSelection {
    pub fn accepts(&self, node: &NodeId) -> bool {
        match self {
            NodeSelection::All => true,
            NodeSelection::Only(nodes) => nodes.contains(node),
            NodeSelection::Except(nodes) => !nodes.contains(node),
        }
    }
}

/// Caller-supplied view configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewWindow {
    pub nodes: NodeSelection,
    /// Bin size in seconds, picked automatically when unset.
    pub bin: Option<f64>,
    /// Offsets relative to the experiment start. `None` covers the
    /// application activity; an open end extends to the first or last
    /// body line.
    pub span: Option<(Option<f64>, Option<f64>)>,
}

/// A [`ViewWindow`] resolved to absolute times.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedWindow {
    pub first: Timestamp,
    pub last: Timestamp,
    pub bin: f64,
    /// Experiment start, origin of relative times.
    pub origin: Timestamp,
}

impl ViewWindow {
    pub fn only(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            nodes: NodeSelection::Only(nodes.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_bin(mut self, bin: f64) -> Self {
        self.bin = Some(bin);
        self
    }

    pub fn with_span(mut self, from: Option<f64>, to: Option<f64>) -> Self {
        self.span = Some((from, to));
        self
    }

    /// Resolve against the experiment window. Fails when the bin size would
    /// split the span into more than [`MAX_VIEW_BINS`] bins.
    pub fn resolve(&self, window: &TimeWindow) -> AnalysisResult<ResolvedWindow> {
        let (mut first, last) = match self.span {
            None => (window.start, window.end),
            Some((from, to)) => (
                from.map_or(window.prep, |f| window.start + f),
                to.map_or(window.finish, |t| window.start + t),
            ),
        };

        let bin = match self.bin.filter(|b| b.is_finite() && *b > 0.0) {
            Some(bin) => bin,
            None => {
                let dur = last - first;
                AUTO_BIN_SIZES
                    .iter()
                    .copied()
                    .find(|size| dur / size <= MAX_AUTO_BINS)
                    .unwrap_or(AUTO_BIN_SIZES[AUTO_BIN_SIZES.len() - 1])
            }
        };

        // first point in time is a whole number of bins before the start
        if first < window.start {
            first = window.start - ((window.start - first) / bin).ceil() * bin;
        }

        let span = last - first;
        if !span.is_finite() || span / bin > MAX_VIEW_BINS as f64 {
            return Err(AnalysisError::TooManyBins {
                bin,
                span,
                max: MAX_VIEW_BINS,
            });
        }

        Ok(ResolvedWindow {
            first,
            last,
            bin,
            origin: window.start,
        })
    }
}

impl ResolvedWindow {
    pub fn bins(&self) -> usize {
        let span = self.last - self.first;
        if span <= 0.0 {
            return 1;
        }
        ((span / self.bin).ceil() as usize).clamp(1, MAX_VIEW_BINS)
    }

    pub fn contains(&self, time: Timestamp) -> bool {
        time >= self.first && time <= self.last
    }

    /// Bin of `time`; the end of the span falls into the last bin.
    pub fn bin_of(&self, time: Timestamp) -> Option<usize> {
        if !self.contains(time) {
            return None;
        }
        Some((((time - self.first) / self.bin) as usize).min(self.bins() - 1))
    }

    /// Start of bin `index` relative to the experiment start.
    pub fn bin_start(&self, index: usize) -> f64 {
        self.first + index as f64 * self.bin - self.origin
    }

    pub fn rel(&self, time: Timestamp) -> f64 {
        time - self.origin
    }
}

/// Marker counts per tag and bin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinnedCounts {
    /// Relative end time of every bin.
    pub ticks: Vec<f64>,
    pub counts: BTreeMap<MarkerTag, Vec<u64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatioPoint {
    /// Relative bin start.
    pub x: f64,
    pub rx: f64,
    pub ack: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatePoint {
    pub x: f64,
    pub rate: f64,
}

/// Cumulative share of transmitted flows completed within `x` seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionCdf {
    pub rx: Vec<(f64, f64)>,
    pub ack: Vec<(f64, f64)>,
}

/// Binned counts of the given marker tags.
pub fn event_bins(ana: &Analysis, view: &ViewWindow, tags: &[MarkerTag]) -> AnalysisResult<BinnedCounts> {
    let win = view.resolve(ana.window())?;
    let bins = win.bins();
    let mut counts: BTreeMap<MarkerTag, Vec<u64>> = tags.iter().map(|t| (t.clone(), vec![0; bins])).collect();

    for marker in ana.flows().markers() {
        if !view.nodes.accepts(&marker.node) {
            continue;
        }
        let (Some(slot), Some(bin)) = (counts.get_mut(&marker.tag), win.bin_of(marker.time)) else {
            continue;
        };
        slot[bin] += 1;
    }

    Ok(BinnedCounts {
        ticks: (0..bins).map(|i| win.bin_start(i + 1)).collect(),
        counts,
    })
}

/// Share of flows reaching RX and ACK, binned by first transmission.
pub fn flow_delivery_bins(ana: &Analysis, view: &ViewWindow) -> AnalysisResult<Vec<RatioPoint>> {
    let win = view.resolve(ana.window())?;
    let mut bins = vec![(0u64, 0u64, 0u64); win.bins()];

    for flow in ana.flows().flows() {
        let (Some(src), Some(first_tx)) = (&flow.src, flow.first_tx()) else {
            continue;
        };
        if !view.nodes.accepts(src) {
            continue;
        }
        let Some(bin) = win.bin_of(first_tx) else {
            continue;
        };
        let slot = &mut bins[bin];
        slot.0 += 1;
        slot.1 += u64::from(!flow.t_rx.is_empty());
        slot.2 += u64::from(!flow.t_ack.is_empty());
    }

    Ok(bins
        .iter()
        .enumerate()
        .filter(|(_, (sent, _, _))| *sent > 0)
        .map(|(i, &(sent, rx, ack))| RatioPoint {
            x: win.bin_start(i),
            rx: rx as f64 / sent as f64,
            ack: ack as f64 / sent as f64,
        })
        .collect())
}

/// Link-layer delivery rate per bin over the selected nodes.
pub fn link_delivery_bins(ana: &Analysis, view: &ViewWindow) -> AnalysisResult<Vec<RatePoint>> {
    let win = view.resolve(ana.window())?;
    let mut bins = vec![(0u64, 0u64, false); win.bins()];

    for digest in ana.links().digests() {
        if !view.nodes.accepts(&digest.node) {
            continue;
        }
        let Some(bin) = win.bin_of(digest.time) else {
            continue;
        };
        let slot = &mut bins[bin];
        slot.0 += digest.sample.sum_attempted();
        slot.1 += digest.sample.sum_acked();
        slot.2 = true;
    }

    Ok(bins
        .iter()
        .enumerate()
        .filter(|(_, (_, _, seen))| *seen)
        .map(|(i, &(attempted, acked, _))| RatePoint {
            x: win.bin_start(i),
            rate: delivery_rate(attempted, acked),
        })
        .collect())
}

/// RX and ACK completion-time CDF over flows from the selected sources.
///
/// The denominator is the number of transmitted flows, so the curves end
/// at the respective delivery ratio.
pub fn completion_cdf(ana: &Analysis, view: &ViewWindow) -> CompletionCdf {
    let flows = ana.flows();
    let sent = flows
        .flows()
        .iter()
        .filter(|f| f.first_tx().is_some() && f.src.as_ref().is_some_and(|s| view.nodes.accepts(s)))
        .count();
    if sent == 0 {
        return CompletionCdf::default();
    }

    let times = flows.completion_times(|src| view.nodes.accepts(src));
    let curve = |mut samples: Vec<f64>| {
        samples.sort_by(|a, b| a.total_cmp(b));
        let mut points = vec![(0.0, 0.0)];
        points.extend(
            samples
                .into_iter()
                .enumerate()
                .map(|(i, ttc)| (ttc, (i + 1) as f64 / sent as f64)),
        );
        points
    };

    CompletionCdf {
        rx: curve(times.rx),
        ack: curve(times.ack),
    }
}

/// Hop-count timeline of whichever topology vocabulary the run used, with
/// relative times.
pub fn hop_timeline(ana: &Analysis, view: &ViewWindow) -> AnalysisResult<Vec<HopSample>> {
    let win = view.resolve(ana.window())?;
    let samples = if ana.mesh().used() {
        ana.mesh().hop_timeline()
    } else {
        ana.topology().hop_timeline()
    };

    Ok(samples
        .into_iter()
        .filter(|s| win.contains(s.time))
        .map(|s| HopSample { time: win.rel(s.time), ..s })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analysis::tests::sample;

    fn window() -> TimeWindow {
        let mut w = TimeWindow::default();
        w.observe(0.0, true);
        w.observe(110.0, false);
        w.narrow_to(10.0, 100.0);
        w
    }

    #[test]
    fn resolve_spans() {
        let w = window();

        let exp = ViewWindow::default().with_bin(30.0).resolve(&w).unwrap();
        assert_eq!((exp.first, exp.last), (10.0, 100.0));
        assert_eq!(exp.bins(), 3);

        let full = ViewWindow::default().with_bin(30.0).with_span(None, None).resolve(&w).unwrap();
        assert_eq!((full.first, full.last), (-20.0, 110.0));
        assert_eq!(full.bin_start(1), 0.0);

        let part = ViewWindow::default().with_bin(5.0).with_span(Some(5.0), Some(20.0)).resolve(&w).unwrap();
        assert_eq!((part.first, part.last), (15.0, 30.0));
        assert_eq!(part.bin_of(30.0), Some(2));
        assert_eq!(part.bin_of(31.0), None);

        let auto = ViewWindow::default().resolve(&w).unwrap();
        assert_eq!(auto.bin, 1.0);
    }

    #[test]
    fn tiny_bin_is_rejected() {
        let w = window();
        let err = ViewWindow::default().with_bin(1e-15).resolve(&w).unwrap_err();
        assert!(matches!(err, AnalysisError::TooManyBins { max: MAX_VIEW_BINS, .. }));
        assert!(ViewWindow::default().with_span(Some(f64::NAN), None).resolve(&w).is_err());

        let ana = sample();
        let tiny = ViewWindow::default().with_bin(1e-15).with_span(None, None);
        assert!(flow_delivery_bins(&ana, &tiny).is_err());
        assert!(event_bins(&ana, &tiny, &[MarkerTag::AppTx]).is_err());
        assert!(link_delivery_bins(&ana, &tiny).is_err());
        assert!(hop_timeline(&ana, &tiny).is_err());

        let fine = ViewWindow::default().with_bin(0.001).resolve(&w).unwrap();
        assert!(fine.bins() <= MAX_VIEW_BINS);
    }

    #[test]
    fn node_selection() {
        let a = NodeId::new("n-1");
        let b = NodeId::new("n-2");
        assert!(NodeSelection::All.accepts(&a));
        assert!(ViewWindow::only([a.clone()]).nodes.accepts(&a));
        assert!(!ViewWindow::only([a.clone()]).nodes.accepts(&b));
        assert!(!NodeSelection::Except([a.clone()].into()).accepts(&a));
    }

    #[test]
    fn binned_views_over_sample() {
        let ana = sample();
        let view = ViewWindow::default().with_bin(1.0);

        let events = event_bins(&ana, &view, &[MarkerTag::AppTx, MarkerTag::AppAck]).unwrap();
        assert_eq!(events.ticks, vec![1.0]);
        assert_eq!(events.counts[&MarkerTag::AppTx], vec![2]);
        assert_eq!(events.counts[&MarkerTag::AppAck], vec![1]);

        let pdr = flow_delivery_bins(&ana, &view).unwrap();
        assert_eq!(pdr, vec![RatioPoint { x: 0.0, rx: 0.5, ack: 0.5 }]);

        let only = ViewWindow::only([NodeId::new("nrf52dk-3")]).with_bin(1.0);
        assert_eq!(flow_delivery_bins(&ana, &only).unwrap()[0].ack, 1.0);

        let full = ViewWindow::default().with_bin(10.0).with_span(None, None);
        let ll = link_delivery_bins(&ana, &full).unwrap();
        assert_eq!(ll.len(), 1);
        assert_eq!(ll[0].x, 0.0);
        assert_eq!(ll[0].rate, 0.9);
        assert!(link_delivery_bins(&ana, &view).unwrap().is_empty());
    }

    #[test]
    fn cdf_and_hops() {
        let ana = sample();
        let cdf = completion_cdf(&ana, &ViewWindow::default());
        assert_eq!(cdf.rx.len(), 2);
        assert_eq!(cdf.rx[0], (0.0, 0.0));
        assert!((cdf.rx[1].0 - 0.05).abs() < 1e-9);
        assert_eq!(cdf.rx[1].1, 0.5);
        assert_eq!(cdf.ack[1].1, 0.5);

        let none = ViewWindow::only([NodeId::new("nrf52dk-1")]);
        assert_eq!(completion_cdf(&ana, &none), CompletionCdf::default());

        let hops = hop_timeline(&ana, &ViewWindow::default().with_bin(1.0).with_span(None, None)).unwrap();
        assert_eq!(hops.len(), 3);
        assert_eq!(hops[1].links, 2);
        assert_eq!(hops[1].max, 2.0);
        assert_eq!(hops[2].links, 1);
        assert_eq!(hops[2].time, 5.0);
    }
}
