use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Builder;
use log::{LevelFilter, info};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use radio_telemetry_analyzer::analyzer::types::{MarkerTag, NodeId};
use radio_telemetry_analyzer::analyzer::views::{self, BinnedCounts, CompletionCdf, NodeSelection, RatePoint, RatioPoint, ViewWindow};
use radio_telemetry_analyzer::analyzer::topology::HopSample;
use radio_telemetry_analyzer::analyzer::render_summary;
use radio_telemetry_analyzer::{Analysis, AnalysisConfig, Snapshot};

#[derive(Parser)]
#[command(name = "radio-telemetry-analyzer", author, version, about = "Analyze recorded radio experiment logs")]
struct Cli {
    /// Trace-level logging for this crate.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Parse a log, print the summary and optionally persist the results.
    Analyze {
        log: PathBuf,
        /// Defaults to `config.toml` next to the log when present.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        snapshot_out: Option<PathBuf>,
        #[arg(long)]
        summary_out: Option<PathBuf>,
        /// Write the one-line overview as JSON.
        #[arg(long)]
        overview_out: Option<PathBuf>,
    },
    /// Print the summary of a saved snapshot.
    Summary { snapshot: PathBuf },
    /// Dump the plot views of a saved snapshot as JSON.
    Views {
        snapshot: PathBuf,
        /// Bin size in seconds.
        #[arg(long)]
        bin: Option<f64>,
        /// Span start relative to the experiment start.
        #[arg(long, allow_hyphen_values = true)]
        from: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        to: Option<f64>,
        /// Extend the span to the whole log.
        #[arg(long)]
        full: bool,
        /// Restrict to these nodes (repeatable).
        #[arg(long = "node")]
        nodes: Vec<String>,
        /// Marker tags to count (repeatable).
        #[arg(long = "tag", default_values = ["A_TX", "A_RX", "A_ACK"])]
        tags: Vec<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct ViewDump {
    events: BinnedCounts,
    flow_delivery: Vec<RatioPoint>,
    link_delivery: Vec<RatePoint>,
    completion: CompletionCdf,
    hops: Vec<HopSample>,
}

fn load_config(log: &Path, explicit: Option<&Path>) -> Result<AnalysisConfig> {
    if explicit.is_some() {
        return AnalysisConfig::load_or_default(explicit).context("loading analysis config");
    }
    let beside = AnalysisConfig::config_path_for_log(log);
    if beside.exists() {
        info!("Using config {}", beside.display());
        return AnalysisConfig::load(&beside).context("loading analysis config");
    }
    Ok(AnalysisConfig::default())
}

fn write_or_print(out: Option<&Path>, text: &str) -> Result<()> {
    match out {
        Some(path) => fs::write(path, text).with_context(|| format!("writing {}", path.display())),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

fn load_snapshot(path: &Path) -> Result<Analysis> {
    let snapshot = Snapshot::load(path).with_context(|| format!("loading snapshot {}", path.display()))?;
    Ok(snapshot.into_analysis())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Analyze {
            log,
            config,
            snapshot_out,
            summary_out,
            overview_out,
        } => {
            let config = load_config(&log, config.as_deref())?;
            let analysis = Analysis::from_log_file(&log, &config).with_context(|| format!("analyzing {}", log.display()))?;

            if let Some(path) = &snapshot_out {
                Snapshot::capture(&analysis).save(path)?;
            }
            if let Some(path) = &overview_out {
                let name = log.file_stem().and_then(|s| s.to_str()).unwrap_or("experiment");
                let json = serde_json::to_string_pretty(&analysis.overview(name))?;
                fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            }
            write_or_print(summary_out.as_deref(), &render_summary(&analysis))
        }
        Command::Summary { snapshot } => {
            let analysis = load_snapshot(&snapshot)?;
            write_or_print(None, &render_summary(&analysis))
        }
        Command::Views {
            snapshot,
            bin,
            from,
            to,
            full,
            nodes,
            tags,
            out,
        } => {
            let analysis = load_snapshot(&snapshot)?;
            let view = ViewWindow {
                nodes: if nodes.is_empty() {
                    NodeSelection::All
                } else {
                    NodeSelection::Only(nodes.into_iter().map(NodeId::new).collect())
                },
                bin,
                span: (full || from.is_some() || to.is_some()).then_some((from, to)),
            };
            let tags: Vec<MarkerTag> = tags.iter().map(|t| MarkerTag::parse(t)).collect();

            let dump = ViewDump {
                events: views::event_bins(&analysis, &view, &tags).context("resolving view window")?,
                flow_delivery: views::flow_delivery_bins(&analysis, &view)?,
                link_delivery: views::link_delivery_bins(&analysis, &view)?,
                completion: views::completion_cdf(&analysis, &view),
                hops: views::hop_timeline(&analysis, &view)?,
            };
            write_or_print(out.as_deref(), &serde_json::to_string_pretty(&dump)?)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging setup
    let crate_level = if cli.verbose { LevelFilter::Trace } else { LevelFilter::Debug };
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("radio_telemetry_analyzer"), crate_level)
        .init();

    info!("Starting up");
    run(cli)
}
