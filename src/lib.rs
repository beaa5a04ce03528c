//! Offline analysis of multi-node radio experiment telemetry.
//!
//! A recorded experiment log is a metadata header followed by one
//! `<seconds>;<node>;<output>` line per console print of every node. The
//! analyzer classifies each line into a typed event, routes it to a set of
//! independent trackers (liveness, link-layer channel statistics, credits,
//! topology, flows, interface validation) and runs one `finish` pass after
//! the stream is exhausted.
//!
//! ## Module Organization
//!
//! - `common`: experiment metadata, configuration, node address directory, errors
//! - `analyzer`: event classification, trackers, conservation rules, views,
//!   snapshots and the text summary

pub mod analyzer;
pub mod common;

pub use analyzer::{Analysis, Snapshot};
pub use common::{AnalysisConfig, AnalysisError, ExperimentMeta};
