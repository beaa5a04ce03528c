//! Shared infrastructure: experiment metadata, configuration, node
//! addressing and the crate error type.

pub mod config;
pub mod error;
pub mod metadata;
pub mod node_directory;

pub use config::{AnalysisConfig, BufferPool};
pub use error::{AnalysisError, AnalysisResult};
pub use metadata::{ExperimentMeta, HEADER_SENTINEL};
pub use node_directory::{NodeAddress, NodeDirectory};
