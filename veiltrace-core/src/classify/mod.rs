mod signatures;

pub use signatures::SignatureSet;

use std::collections::HashSet;
use std::net::IpAddr;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use veiltrace_model::{Flow, Indicators};

use crate::error::{PipelineError, Result};
use crate::store::Store;

pub const DEFAULT_CLASSIFY_BATCH_SIZE: usize = 100;

/// Walks persisted flows and sets the four classification indicators from
/// the relay directory and the signature tables.
///
/// The rules are pure functions of a flow and the directory snapshot taken
/// at the start of the pass, so re-running the classifier over an unchanged
/// store yields identical indicators.
#[derive(Debug)]
pub struct Classifier<'a> {
    store: &'a Store,
    signatures: SignatureSet,
    batch_size: usize,
}

impl<'a> Classifier<'a> {
    pub fn new(
        store: &'a Store,
        signatures: SignatureSet,
        batch_size: usize,
    ) -> Self {
        Classifier {
            store,
            signatures,
            batch_size: batch_size.max(1),
        }
    }

    /// Classify every flow, committing one batch per transaction. Returns
    /// the number of flows that carry at least one indicator.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<u64> {
        let relay_addrs = self.store.relays().addresses().await?;
        info!(
            relays = relay_addrs.len(),
            batch_size = self.batch_size,
            "classifying flows"
        );

        let mut flagged = 0u64;
        let mut processed = 0u64;
        let mut last_id = 0i64;

        loop {
            let page = self
                .store
                .flows()
                .page_after(last_id, self.batch_size as u32)
                .await?;
            if page.is_empty() {
                break;
            }

            let mut tx = self.store.pool().begin().await.map_err(|e| {
                PipelineError::store("classifier", "begin", e)
            })?;

            for flow in &page {
                let indicators =
                    evaluate(flow, &relay_addrs, &self.signatures);
                self.store
                    .flows()
                    .update_indicators(&mut tx, flow.id, &indicators)
                    .await?;
                if indicators.any() {
                    flagged += 1;
                }
                last_id = flow.id;
            }

            tx.commit().await.map_err(|e| {
                PipelineError::store("classifier", "commit", e)
            })?;
            processed += page.len() as u64;

            if cancel.is_cancelled() {
                info!(processed, "classification cancelled at batch boundary");
                return Ok(flagged);
            }
        }

        info!(processed, flagged, "classification complete");
        Ok(flagged)
    }
}

/// Evaluate all classification rules for one flow. Rules fire
/// independently; a flow may trip several.
pub fn evaluate(
    flow: &Flow,
    relay_addrs: &HashSet<IpAddr>,
    signatures: &SignatureSet,
) -> Indicators {
    let mut indicators = Indicators::default();

    if relay_addrs.contains(&flow.key.dst_addr) {
        indicators.relay_comm = true;
    }
    if signatures.relay_ports.contains(&flow.key.dst_port) {
        indicators.relay_comm = true;
    }
    if flow.key.dst_port == signatures.directory_port {
        indicators.directory_fetch = true;
    }

    if let Some(payload) = flow.payload_prefix.as_deref() {
        if is_handshake(payload, signatures) {
            indicators.possible_handshake = true;
        }
        if is_obfuscated(payload, signatures) {
            indicators.obfuscated_candidate = true;
        }
    } else {
        debug!(flow = flow.id, "no payload prefix; payload rules skipped");
    }

    indicators
}

/// TLS record-layer prefix followed by one of the known cell/version
/// patterns anywhere in the stored prefix.
fn is_handshake(payload: &[u8], signatures: &SignatureSet) -> bool {
    if signatures.tls_record_prefix.is_empty()
        || !payload.starts_with(&signatures.tls_record_prefix)
    {
        return false;
    }
    signatures
        .handshake_patterns
        .iter()
        .any(|pattern| contains(payload, pattern))
}

/// Long prefix, no cleartext protocol marker in the leading window, and
/// high byte diversity inside that window.
fn is_obfuscated(payload: &[u8], signatures: &SignatureSet) -> bool {
    if payload.len() < signatures.min_obfuscated_len {
        return false;
    }

    let window = &payload[..signatures.marker_window.min(payload.len())];
    let has_marker = signatures
        .plaintext_markers
        .iter()
        .any(|marker| contains(window, marker.as_bytes()));
    if has_marker {
        return false;
    }

    distinct_bytes(window) > signatures.distinct_byte_threshold
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty()
        && haystack.windows(needle.len()).any(|chunk| chunk == needle)
}

fn distinct_bytes(window: &[u8]) -> usize {
    let mut seen = [false; 256];
    let mut count = 0;
    for &byte in window {
        if !seen[byte as usize] {
            seen[byte as usize] = true;
            count += 1;
        }
    }
    count
}
