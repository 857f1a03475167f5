mod capture;
mod decode;

pub use capture::{CaptureReader, PacketRecord};

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use veiltrace_model::{FlowKey, NewFlow};

use crate::error::{PipelineError, Result};
use crate::store::Store;

pub const DEFAULT_INGEST_BATCH_SIZE: usize = 1000;

/// Maximum stored transport payload prefix per flow.
const PAYLOAD_PREFIX_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Accumulator count that triggers a flush to the store.
    pub batch_size: usize,
    /// Load the whole capture before aggregating instead of streaming
    /// packet-at-a-time. Both modes produce the same flow set.
    pub eager: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            batch_size: DEFAULT_INGEST_BATCH_SIZE,
            eager: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOutcome {
    /// Flow rows persisted across all flushes.
    pub flows_persisted: u64,
    pub packets_seen: u64,
    /// Packets without a supported L3/L4 layer.
    pub packets_skipped: u64,
}

/// Running aggregate for one 5-tuple, held in memory between flushes.
#[derive(Debug)]
struct FlowAccumulator {
    seq: u64,
    ts_start: f64,
    ts_end: f64,
    pkt_count: u64,
    byte_count: u64,
    payload_prefix: Option<Vec<u8>>,
}

impl FlowAccumulator {
    fn new(seq: u64, timestamp: f64) -> Self {
        FlowAccumulator {
            seq,
            ts_start: timestamp,
            ts_end: timestamp,
            pkt_count: 0,
            byte_count: 0,
            payload_prefix: None,
        }
    }

    fn update(&mut self, timestamp: f64, wire_len: u32, payload: &[u8]) {
        self.ts_end = self.ts_end.max(timestamp);
        self.pkt_count += 1;
        self.byte_count += wire_len as u64;

        if self.payload_prefix.is_none() && !payload.is_empty() {
            let len = payload.len().min(PAYLOAD_PREFIX_LIMIT);
            self.payload_prefix = Some(payload[..len].to_vec());
        }
    }
}

/// Reconstructs flows from a capture file and persists them in batches.
///
/// Memory is bounded at O(batch_size) live accumulators: once the map
/// reaches the batch-size hint every accumulator is flushed in a single
/// transaction and the map is cleared.
#[derive(Debug)]
pub struct Ingestor<'a> {
    store: &'a Store,
    options: IngestOptions,
}

impl<'a> Ingestor<'a> {
    pub fn new(store: &'a Store, options: IngestOptions) -> Self {
        Ingestor { store, options }
    }

    pub async fn ingest(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome> {
        info!(
            capture = %path.display(),
            batch_size = self.options.batch_size,
            eager = self.options.eager,
            "starting capture ingest"
        );

        let mut reader = CaptureReader::open(path)?;
        let mut accumulators: HashMap<FlowKey, FlowAccumulator> =
            HashMap::new();
        let mut outcome = IngestOutcome::default();
        let mut next_seq = 0u64;

        if self.options.eager {
            let mut packets = Vec::new();
            while let Some(packet) = reader.next_packet()? {
                packets.push(packet);
            }
            for packet in &packets {
                self.process_packet(
                    packet,
                    &mut accumulators,
                    &mut outcome,
                    &mut next_seq,
                );
                if self
                    .maybe_flush(&mut accumulators, &mut outcome, cancel)
                    .await?
                {
                    return Ok(outcome);
                }
            }
        } else {
            while let Some(packet) = reader.next_packet()? {
                self.process_packet(
                    &packet,
                    &mut accumulators,
                    &mut outcome,
                    &mut next_seq,
                );
                if self
                    .maybe_flush(&mut accumulators, &mut outcome, cancel)
                    .await?
                {
                    return Ok(outcome);
                }
            }
        }

        outcome.flows_persisted += self.flush(&mut accumulators).await?;

        info!(
            packets = outcome.packets_seen,
            skipped = outcome.packets_skipped,
            flows = outcome.flows_persisted,
            "capture ingest complete"
        );
        Ok(outcome)
    }

    fn process_packet(
        &self,
        packet: &PacketRecord,
        accumulators: &mut HashMap<FlowKey, FlowAccumulator>,
        outcome: &mut IngestOutcome,
        next_seq: &mut u64,
    ) {
        outcome.packets_seen += 1;

        let Some(decoded) = decode::decode_ethernet(&packet.data) else {
            outcome.packets_skipped += 1;
            debug!(
                packet = outcome.packets_seen,
                "skipping packet without usable L3/L4 layers"
            );
            return;
        };

        let accumulator =
            accumulators.entry(decoded.key).or_insert_with(|| {
                let seq = *next_seq;
                *next_seq += 1;
                FlowAccumulator::new(seq, packet.timestamp)
            });
        accumulator.update(packet.timestamp, packet.wire_len, decoded.payload);
    }

    /// Flush when the accumulator map has reached the batch-size hint.
    /// Returns true when a cancellation was observed at the flush boundary.
    async fn maybe_flush(
        &self,
        accumulators: &mut HashMap<FlowKey, FlowAccumulator>,
        outcome: &mut IngestOutcome,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if accumulators.len() < self.options.batch_size.max(1) {
            return Ok(false);
        }

        outcome.flows_persisted += self.flush(accumulators).await?;

        if cancel.is_cancelled() {
            info!(
                flows = outcome.flows_persisted,
                "ingest cancelled at batch boundary"
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn flush(
        &self,
        accumulators: &mut HashMap<FlowKey, FlowAccumulator>,
    ) -> Result<u64> {
        if accumulators.is_empty() {
            return Ok(0);
        }

        // Drain in first-seen order so persistence order matches
        // processing order.
        let mut drained: Vec<(FlowKey, FlowAccumulator)> =
            accumulators.drain().collect();
        drained.sort_by_key(|(_, acc)| acc.seq);

        let mut batch = Vec::with_capacity(drained.len());
        for (key, acc) in drained {
            batch.push(NewFlow {
                key,
                ts_start: datetime_from_epoch(acc.ts_start)?,
                ts_end: datetime_from_epoch(acc.ts_end)?,
                pkt_count: acc.pkt_count,
                byte_count: acc.byte_count,
                payload_prefix: acc.payload_prefix,
            });
        }

        self.store.flows().insert_batch(&batch).await
    }
}

fn datetime_from_epoch(seconds: f64) -> Result<DateTime<Utc>> {
    if !seconds.is_finite() {
        return Err(PipelineError::Contract(format!(
            "non-finite packet timestamp: {seconds}"
        )));
    }
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
        .ok_or_else(|| {
            PipelineError::Contract(format!(
                "packet timestamp out of range: {seconds}"
            ))
        })
}
