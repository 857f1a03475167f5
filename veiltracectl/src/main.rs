mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dialoguer::{console::Term, Confirm};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use veiltrace_core::{
    load_directory, Classifier, CorrelateOptions, Correlator, IngestOptions,
    Ingestor, Scorer, SignatureSet, Store, DEFAULT_CLASSIFY_BATCH_SIZE,
    DEFAULT_INGEST_BATCH_SIZE, DEFAULT_MIN_CIRCUIT_SIZE, DEFAULT_MIN_WEIGHT,
    DEFAULT_SCORE_BATCH_SIZE, DEFAULT_TIME_WINDOW_SECS,
};
use veiltrace_model::{ConfidenceCategory, NewReport};

use crate::config::AppConfig;

const DEFAULT_DB_PATH: &str = "veiltrace.db";

#[derive(Parser)]
#[command(
    name = "veiltracectl",
    about = "Relay-overlay traffic forensics: ingest captures, classify \
             flows, correlate suspects, and score confidence"
)]
struct Cli {
    /// Path of the analysis store (defaults to veiltrace.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Optional TOML config file (defaults to ./veiltrace.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconstruct flows from a capture file (pcap or pcapng)
    Ingest {
        #[arg(long, short = 'f')]
        file: PathBuf,
        /// Accumulators held in memory before a flush
        #[arg(long)]
        batch_size: Option<usize>,
        /// Stream the capture packet-at-a-time (the default mode)
        #[arg(long, conflicts_with = "eager")]
        streaming: bool,
        /// Load the whole capture before aggregating (small files, tests)
        #[arg(long)]
        eager: bool,
    },
    /// Upsert a relay directory snapshot (JSON) into the store
    LoadDirectory {
        #[arg(long, short = 'f')]
        file: PathBuf,
    },
    /// Set relay indicators on every persisted flow
    Classify {
        /// Flows updated per transaction
        #[arg(long)]
        batch_size: Option<usize>,
        /// Signature-table override (TOML)
        #[arg(long)]
        signatures: Option<PathBuf>,
    },
    /// Pair suspect flows inside a sliding time window
    Correlate {
        /// Window over flow start times, in seconds
        #[arg(long, short = 'w')]
        window: Option<f64>,
        /// Minimum pair weight to persist
        #[arg(long)]
        min_weight: Option<f64>,
        /// Smallest connected component reported as a candidate circuit
        #[arg(long)]
        min_circuit: Option<usize>,
    },
    /// Compute confidence scores, or show the breakdown for one flow
    Score {
        /// Score a single flow and print its components
        #[arg(long)]
        flow_id: Option<i64>,
        /// Flows written per transaction
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Append a summary report row (and optionally a JSON artifact)
    Report {
        #[arg(long, default_value = "Analysis summary")]
        title: String,
        /// Write the summary counters as JSON to this path
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
    /// Drop and recreate all tables
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::load(cli.config.as_deref())?;

    let db_path = cli
        .db
        .or_else(|| cfg.db_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
    let store = Store::open(&db_path).await?;

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    match cli.command {
        Command::Ingest {
            file,
            batch_size,
            streaming: _,
            eager,
        } => {
            let options = IngestOptions {
                batch_size: batch_size
                    .or(cfg.ingest.batch_size)
                    .unwrap_or(DEFAULT_INGEST_BATCH_SIZE),
                eager,
            };
            let outcome =
                Ingestor::new(&store, options).ingest(&file, &cancel).await?;
            println!(
                "Ingested {} flows from {} ({} packets, {} skipped)",
                outcome.flows_persisted,
                file.display(),
                outcome.packets_seen,
                outcome.packets_skipped
            );
        }
        Command::LoadDirectory { file } => {
            let outcome = load_directory(&store, &file).await?;
            println!(
                "Loaded {} relay nodes from {} ({} records skipped)",
                outcome.loaded,
                file.display(),
                outcome.skipped
            );
        }
        Command::Classify {
            batch_size,
            signatures,
        } => {
            let signatures = resolve_signatures(signatures, &cfg)?;
            let batch_size = batch_size
                .or(cfg.classify.batch_size)
                .unwrap_or(DEFAULT_CLASSIFY_BATCH_SIZE);
            let flagged = Classifier::new(&store, signatures, batch_size)
                .run(&cancel)
                .await?;
            println!("Flagged {flagged} flows with relay indicators");
        }
        Command::Correlate {
            window,
            min_weight,
            min_circuit,
        } => {
            let options = CorrelateOptions {
                window_seconds: window
                    .or(cfg.correlate.window_seconds)
                    .unwrap_or(DEFAULT_TIME_WINDOW_SECS),
                min_weight: min_weight
                    .or(cfg.correlate.min_weight)
                    .unwrap_or(DEFAULT_MIN_WEIGHT),
                min_circuit_size: min_circuit
                    .or(cfg.correlate.min_circuit_size)
                    .unwrap_or(DEFAULT_MIN_CIRCUIT_SIZE),
            };
            let outcome = Correlator::new(&store, options).run().await?;
            println!(
                "Created {} correlations",
                outcome.correlations_persisted
            );
            println!(
                "Found {} candidate circuits",
                outcome.candidate_circuits.len()
            );
        }
        Command::Score {
            flow_id,
            batch_size,
        } => {
            let signatures = resolve_signatures(None, &cfg)?;
            let batch_size = batch_size
                .or(cfg.score.batch_size)
                .unwrap_or(DEFAULT_SCORE_BATCH_SIZE);
            let scorer = Scorer::new(&store, signatures, batch_size);

            match flow_id {
                Some(id) => {
                    let breakdown = scorer.score_flow(id).await?;
                    println!(
                        "Flow {} score: {:.2} ({})",
                        id,
                        breakdown.total,
                        breakdown.category()
                    );
                    println!("  relay match:        {:>6.2}", breakdown.relay_match);
                    println!("  timing correlation: {:>6.2}", breakdown.timing_correlation);
                    println!("  payload patterns:   {:>6.2}", breakdown.payload_patterns);
                    println!("  traffic shape:      {:>6.2}", breakdown.traffic_shape);
                }
                None => {
                    let scored = scorer.run(&cancel).await?;
                    println!("Scored {scored} flows");
                }
            }
        }
        Command::Report { title, output } => {
            let id = write_report(&store, title, output).await?;
            println!("Recorded report {id}");
        }
        Command::Reset { yes } => {
            // Prompt only on an attended terminal; scripted resets proceed.
            if !yes && dialoguer::console::user_attended_stderr() {
                let confirmed = Confirm::new()
                    .with_prompt(
                        "Drop and recreate all veiltrace tables? All \
                         ingested evidence will be lost",
                    )
                    .default(false)
                    .interact_on(&Term::stderr())?;
                if !confirmed {
                    println!("Aborted; store was not modified.");
                    return Ok(());
                }
            }
            store.reset().await?;
            println!("Analysis store reset");
        }
    }

    Ok(())
}

fn resolve_signatures(
    flag: Option<PathBuf>,
    cfg: &AppConfig,
) -> Result<SignatureSet> {
    match flag.as_deref().or(cfg.signatures.as_deref()) {
        Some(path) => {
            debug!(path = %path.display(), "loading signature table");
            Ok(SignatureSet::from_toml_path(path)?)
        }
        None => Ok(SignatureSet::default()),
    }
}

async fn write_report(
    store: &Store,
    title: String,
    output: Option<PathBuf>,
) -> Result<i64> {
    let total_flows = store.flows().count().await?;
    let suspect_flows = store.flows().count_with_indicator().await?;
    let critical_flows = store
        .flows()
        .count_by_category(ConfidenceCategory::Critical)
        .await?;
    let correlations = store.correlations().count().await?;
    let relays = store.relays().count().await?;

    let summary = format!(
        "{total_flows} flows, {suspect_flows} with indicators, \
         {critical_flows} critical, {correlations} correlations, \
         {relays} known relays"
    );

    let file_path = match &output {
        Some(path) => {
            let artifact = serde_json::json!({
                "title": title,
                "total_flows": total_flows,
                "suspect_flows": suspect_flows,
                "critical_flows": critical_flows,
                "correlations": correlations,
                "relay_nodes": relays,
            });
            std::fs::write(path, serde_json::to_string_pretty(&artifact)?)?;
            Some(path.display().to_string())
        }
        None => None,
    };

    let id = store
        .reports()
        .append(&NewReport {
            title,
            report_type: Some("summary".to_string()),
            file_path,
            summary: Some(summary),
            total_flows,
            suspect_flows,
            critical_flows,
        })
        .await?;
    Ok(id)
}
