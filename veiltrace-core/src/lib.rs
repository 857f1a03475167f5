//! Core library for veiltrace: reconstructs flows from packet captures,
//! classifies them against a relay-node directory, correlates suspect
//! flows inside a sliding time window, and fuses the evidence into a
//! bounded confidence score.
//!
//! The pipeline is strictly acyclic (ingest → classify → correlate →
//! score); the [`store::Store`] is the only channel between stages, and
//! each stage is independently re-runnable over a fixed input snapshot.

pub mod classify;
pub mod correlate;
pub mod directory;
pub mod error;
pub mod ingest;
pub mod score;
pub mod store;

pub use classify::{Classifier, SignatureSet, DEFAULT_CLASSIFY_BATCH_SIZE};
pub use correlate::{
    CorrelateOptions, CorrelateOutcome, CorrelationGraph, Correlator,
    DEFAULT_MIN_CIRCUIT_SIZE, DEFAULT_MIN_WEIGHT, DEFAULT_TIME_WINDOW_SECS,
};
pub use directory::{load_directory, DirectoryOutcome};
pub use error::{PipelineError, Result};
pub use ingest::{
    IngestOptions, IngestOutcome, Ingestor, DEFAULT_INGEST_BATCH_SIZE,
};
pub use score::{ScoreBreakdown, Scorer, DEFAULT_SCORE_BATCH_SIZE};
pub use store::Store;
