use std::net::IpAddr;
use std::path::Path;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info};
use veiltrace_model::NewRelayNode;

use crate::error::{PipelineError, Result};
use crate::store::Store;

/// One record of a relay directory snapshot. Unknown fields are ignored;
/// `ip_address` is accepted as a legacy alias for `address`.
#[derive(Debug, Deserialize)]
struct DirectoryRecord {
    #[serde(default, alias = "ip_address")]
    address: Option<String>,
    #[serde(default = "default_relay_port")]
    port: u16,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    asn: Option<String>,
    #[serde(default)]
    bandwidth: Option<i64>,
}

fn default_relay_port() -> u16 {
    9001
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryOutcome {
    pub loaded: u64,
    /// Records dropped for a missing or unparseable address or shape.
    pub skipped: u64,
}

/// Load a relay directory snapshot (a JSON list of records) into the
/// store. Loading is upsert-by-address: existing rows keep their primary
/// key and older entries persist unless overwritten. `last_seen` is
/// stamped with the load time.
pub async fn load_directory(
    store: &Store,
    path: &Path,
) -> Result<DirectoryOutcome> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::Input(format!(
            "cannot read directory snapshot {}: {e}",
            path.display()
        ))
    })?;
    let records: Vec<serde_json::Value> =
        serde_json::from_str(&text).map_err(|e| {
            PipelineError::Input(format!(
                "malformed directory snapshot {}: {e}",
                path.display()
            ))
        })?;

    let now = Utc::now();
    let mut outcome = DirectoryOutcome::default();

    let mut tx = store
        .pool()
        .begin()
        .await
        .map_err(|e| PipelineError::store("directory", "begin", e))?;

    for (index, value) in records.into_iter().enumerate() {
        let Some(node) = parse_record(index, value, now) else {
            outcome.skipped += 1;
            continue;
        };
        store.relays().upsert(&mut tx, &node).await?;
        outcome.loaded += 1;
    }

    tx.commit()
        .await
        .map_err(|e| PipelineError::store("directory", "commit", e))?;

    info!(
        loaded = outcome.loaded,
        skipped = outcome.skipped,
        "relay directory loaded"
    );
    Ok(outcome)
}

fn parse_record(
    index: usize,
    value: serde_json::Value,
    now: chrono::DateTime<Utc>,
) -> Option<NewRelayNode> {
    let record: DirectoryRecord = match serde_json::from_value(value) {
        Ok(record) => record,
        Err(e) => {
            debug!(index, error = %e, "skipping malformed directory record");
            return None;
        }
    };

    let address_text = record.address?;
    let address: IpAddr = match address_text.parse() {
        Ok(addr) => addr,
        Err(_) => {
            debug!(
                index,
                address = %address_text,
                "skipping directory record with unparseable address"
            );
            return None;
        }
    };

    Some(NewRelayNode {
        address,
        port: record.port,
        fingerprint: record.fingerprint,
        nickname: record.nickname,
        flags: record.flags,
        country_code: record.country_code,
        asn: record.asn,
        bandwidth: record.bandwidth,
        last_seen: Some(now),
    })
}
