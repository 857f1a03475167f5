use std::collections::HashMap;
use std::net::IpAddr;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use veiltrace_model::{ConfidenceCategory, Correlation, Flow, RelayFlag};

use crate::classify::SignatureSet;
use crate::error::{PipelineError, Result};
use crate::store::Store;

pub const DEFAULT_SCORE_BATCH_SIZE: usize = 100;

const MAX_RELAY_MATCH: f64 = 40.0;
const MAX_TIMING: f64 = 30.0;
const MAX_PAYLOAD: f64 = 20.0;
const MAX_SHAPE: f64 = 10.0;

/// Per-component confidence breakdown for one flow. Each component is
/// clamped to its budget before summation.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScoreBreakdown {
    pub relay_match: f64,
    pub timing_correlation: f64,
    pub payload_patterns: f64,
    pub traffic_shape: f64,
    pub total: f64,
}

impl ScoreBreakdown {
    pub fn category(&self) -> ConfidenceCategory {
        ConfidenceCategory::from_score(self.total)
    }
}

/// Fuses classifier indicators, relay-directory matches, and correlation
/// strength into a bounded confidence score per flow.
///
/// Scoring is deterministic over an unchanged store: two consecutive
/// passes write identical values.
#[derive(Debug)]
pub struct Scorer<'a> {
    store: &'a Store,
    signatures: SignatureSet,
    batch_size: usize,
}

impl<'a> Scorer<'a> {
    pub fn new(
        store: &'a Store,
        signatures: SignatureSet,
        batch_size: usize,
    ) -> Self {
        Scorer {
            store,
            signatures,
            batch_size: batch_size.max(1),
        }
    }

    /// Score every flow, writing score and category one batch per
    /// transaction. Returns the number of flows scored.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<u64> {
        let relay_flags = self.store.relays().flag_map().await?;
        info!(batch_size = self.batch_size, "scoring flows");

        let mut scored = 0u64;
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

            // Breakdowns are computed before the write transaction opens so
            // correlation lookups never contend with it.
            let mut updates = Vec::with_capacity(page.len());
            for flow in &page {
                let breakdown = self.breakdown(flow, &relay_flags).await?;
                updates.push((flow.id, breakdown));
                last_id = flow.id;
            }

            let mut tx = self
                .store
                .pool()
                .begin()
                .await
                .map_err(|e| PipelineError::store("scorer", "begin", e))?;

            for (id, breakdown) in &updates {
                self.store
                    .flows()
                    .update_score(
                        &mut tx,
                        *id,
                        breakdown.total,
                        breakdown.category(),
                    )
                    .await?;
            }

            tx.commit()
                .await
                .map_err(|e| PipelineError::store("scorer", "commit", e))?;
            scored += updates.len() as u64;

            if cancel.is_cancelled() {
                info!(scored, "scoring cancelled at batch boundary");
                return Ok(scored);
            }
        }

        info!(scored, "scoring complete");
        Ok(scored)
    }

    /// Component breakdown for one flow, without writing anything back.
    pub async fn score_flow(&self, id: i64) -> Result<ScoreBreakdown> {
        let flow = self.store.flows().fetch(id).await?.ok_or_else(|| {
            PipelineError::Input(format!("flow {id} not found"))
        })?;
        let relay_flags = self.store.relays().flag_map().await?;
        self.breakdown(&flow, &relay_flags).await
    }

    async fn breakdown(
        &self,
        flow: &Flow,
        relay_flags: &HashMap<IpAddr, Vec<String>>,
    ) -> Result<ScoreBreakdown> {
        let correlations =
            self.store.correlations().touching(flow.id).await?;

        let relay_match = relay_match_component(
            flow,
            relay_flags.get(&flow.key.dst_addr).map(Vec::as_slice),
        );
        let timing_correlation = timing_component(&correlations);
        let payload_patterns = payload_component(flow);
        let traffic_shape = shape_component(flow, &self.signatures);

        let total = relay_match
            + timing_correlation
            + payload_patterns
            + traffic_shape;
        if !total.is_finite() || !(0.0..=100.0).contains(&total) {
            return Err(PipelineError::Contract(format!(
                "flow {} scored {total} outside [0, 100]",
                flow.id
            )));
        }

        Ok(ScoreBreakdown {
            relay_match,
            timing_correlation,
            payload_patterns,
            traffic_shape,
            total: total.clamp(0.0, 100.0),
        })
    }
}

/// Relay-node match, up to 40: directory membership with role bonuses,
/// plus the classifier indicators.
fn relay_match_component(flow: &Flow, node_flags: Option<&[String]>) -> f64 {
    let mut score: f64 = 0.0;

    if let Some(flags) = node_flags {
        score += 20.0;
        if has_flag(flags, RelayFlag::Guard) {
            score += 8.0;
        }
        if has_flag(flags, RelayFlag::Exit) {
            score += 8.0;
        }
        if has_flag(flags, RelayFlag::Fast) {
            score += 4.0;
        }
    }

    if flow.indicators.relay_comm {
        score += 12.0;
    }
    if flow.indicators.directory_fetch {
        score += 8.0;
    }
    if flow.indicators.possible_handshake {
        score += 12.0;
    }
    if flow.indicators.obfuscated_candidate {
        score += 16.0;
    }

    score.min(MAX_RELAY_MATCH)
}

/// Timing correlation, up to 30: a count term plus the mean pair weight.
fn timing_component(correlations: &[Correlation]) -> f64 {
    if correlations.is_empty() {
        return 0.0;
    }

    let n = correlations.len();
    let count_term = if n >= 5 {
        15.0
    } else if n >= 3 {
        9.0
    } else {
        6.0
    };

    let mean_weight =
        correlations.iter().map(|c| c.weight).sum::<f64>() / n as f64;

    (count_term + 15.0 * mean_weight).min(MAX_TIMING)
}

/// Payload patterns, up to 20.
fn payload_component(flow: &Flow) -> f64 {
    let mut score: f64 = 0.0;
    if flow.indicators.possible_handshake {
        score += 12.0;
    }
    if flow.indicators.obfuscated_candidate {
        score += 16.0;
    }
    if flow.byte_count > 10_000 {
        score += 4.0;
    }
    score.min(MAX_PAYLOAD)
}

/// Unusual traffic shape, up to 10.
fn shape_component(flow: &Flow, signatures: &SignatureSet) -> f64 {
    let mut score: f64 = 0.0;
    if signatures.relay_ports.contains(&flow.key.dst_port) {
        score += 5.0;
    }
    if flow.pkt_count > 100 {
        score += 3.0;
    }
    if flow.duration_seconds() > 60.0 {
        score += 2.0;
    }
    score.min(MAX_SHAPE)
}

fn has_flag(flags: &[String], flag: RelayFlag) -> bool {
    flags.iter().any(|f| f == flag.as_str())
}
