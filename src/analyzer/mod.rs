//! Analyzer module for experiment log processing.
//!
//! Provides functionality for:
//! - Loading a recorded log and classifying every body line into an event
//! - Tracking liveness, link-layer, credit, topology and flow state per node
//! - Conservation checks, a text summary, plot views and snapshots
//!
//! [`Analysis`] owns every tracker and routes events to them.

pub mod analysis;
pub mod channel_stats;
pub mod conn_interval;
pub mod conservation;
pub mod credits;
pub mod event_counts;
pub mod flows;
pub mod iface;
pub mod liveness;
pub mod log_loader;
pub mod log_parser;
pub mod mesh_topology;
pub mod report;
pub mod snapshot;
pub mod topology;
pub mod types;
pub mod views;

pub use analysis::{Analysis, LineStats, Overview};
pub use log_loader::LogLoader;
pub use report::render_summary;
pub use snapshot::Snapshot;
pub use types::{Event, NodeId, Timestamp};
