use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of a pairwise flow correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKind {
    EntryExit,
    Timing,
    PayloadSimilarity,
}

impl CorrelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrelationKind::EntryExit => "entry_exit",
            CorrelationKind::Timing => "timing",
            CorrelationKind::PayloadSimilarity => "payload_similarity",
        }
    }
}

impl fmt::Display for CorrelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CorrelationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry_exit" => Ok(CorrelationKind::EntryExit),
            "timing" => Ok(CorrelationKind::Timing),
            "payload_similarity" => Ok(CorrelationKind::PayloadSimilarity),
            other => Err(format!("unknown correlation kind: {other}")),
        }
    }
}

/// One piece of evidence supporting a correlation. Serialised as a tagged
/// JSON list in the store; `Extension` is the open slot for keys the typed
/// variants do not cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    Timing { diff_seconds: f64, score: f64 },
    SizeSimilarity { ratio: f64 },
    EntryExit,
    SameSource,
    Extension { key: String, value: serde_json::Value },
}

/// A persisted link between two flows. `flow_a < flow_b` by convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub id: i64,
    pub flow_a: i64,
    pub flow_b: i64,
    /// Additive weight; bounded per component but NOT renormalised, so the
    /// total may exceed 1.0.
    pub weight: f64,
    pub kind: CorrelationKind,
    pub evidence: Vec<Evidence>,
    pub created_at: DateTime<Utc>,
}

/// A correlation ready for insertion, before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCorrelation {
    pub flow_a: i64,
    pub flow_b: i64,
    pub weight: f64,
    pub kind: CorrelationKind,
    pub evidence: Vec<Evidence>,
}
