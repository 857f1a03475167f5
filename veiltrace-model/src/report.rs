use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata about an externally produced report artifact. Rows are
/// append-only; the artifact body itself lives outside the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: i64,
    pub title: String,
    pub report_type: Option<String>,
    pub file_path: Option<String>,
    pub summary: Option<String>,
    pub total_flows: u64,
    pub suspect_flows: u64,
    pub critical_flows: u64,
    pub created_at: DateTime<Utc>,
}

/// A report row ready for insertion, before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReport {
    pub title: String,
    pub report_type: Option<String>,
    pub file_path: Option<String>,
    pub summary: Option<String>,
    pub total_flows: u64,
    pub suspect_flows: u64,
    pub critical_flows: u64,
}
