mod graph;

pub use graph::CorrelationGraph;

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use futures::StreamExt;
use tracing::info;
use veiltrace_model::{
    CorrelationKind, Evidence, Flow, NewCorrelation, RelayFlag,
};

use crate::error::{PipelineError, Result};
use crate::store::Store;

pub const DEFAULT_TIME_WINDOW_SECS: f64 = 10.0;
pub const DEFAULT_MIN_WEIGHT: f64 = 0.3;
pub const DEFAULT_MIN_CIRCUIT_SIZE: usize = 2;

#[derive(Debug, Clone)]
pub struct CorrelateOptions {
    /// Sliding window over flow start times, in seconds.
    pub window_seconds: f64,
    /// Minimum additive weight for a pair to be persisted.
    pub min_weight: f64,
    /// Smallest connected component reported as a candidate circuit.
    pub min_circuit_size: usize,
}

impl Default for CorrelateOptions {
    fn default() -> Self {
        CorrelateOptions {
            window_seconds: DEFAULT_TIME_WINDOW_SECS,
            min_weight: DEFAULT_MIN_WEIGHT,
            min_circuit_size: DEFAULT_MIN_CIRCUIT_SIZE,
        }
    }
}

#[derive(Debug)]
pub struct CorrelateOutcome {
    pub correlations_persisted: u64,
    /// Connected components of the pair graph: candidate circuits.
    pub candidate_circuits: Vec<Vec<i64>>,
}

/// Pairs classifier-flagged flows whose start times fall inside a sliding
/// window, weighs each pair, and persists those above the threshold.
///
/// Only flows originating from private address space participate: the
/// correlator targets hosts behind the observation point. Each pass is
/// destructive over prior correlation rows and runs in a single
/// transaction, so a failed pass leaves the previous result set intact.
#[derive(Debug)]
pub struct Correlator<'a> {
    store: &'a Store,
    options: CorrelateOptions,
}

impl<'a> Correlator<'a> {
    pub fn new(store: &'a Store, options: CorrelateOptions) -> Self {
        Correlator { store, options }
    }

    pub async fn run(&self) -> Result<CorrelateOutcome> {
        let relay_flags = self.store.relays().flag_map().await?;
        info!(
            window_seconds = self.options.window_seconds,
            min_weight = self.options.min_weight,
            "correlating candidate flows"
        );

        let mut pairs: Vec<NewCorrelation> = Vec::new();
        let mut graph = CorrelationGraph::new();
        let mut window: VecDeque<Flow> = VecDeque::new();
        let mut candidates = 0u64;

        {
            let mut stream = self.store.flows().candidates_by_start();
            while let Some(flow) = stream.next().await {
                let flow = flow?;
                if !is_private_source(flow.key.src_addr) {
                    continue;
                }
                candidates += 1;

                while window.front().is_some_and(|front| {
                    start_delta_seconds(front, &flow)
                        > self.options.window_seconds
                }) {
                    window.pop_front();
                }

                for earlier in &window {
                    let (weight, kind, evidence) =
                        weigh_pair(earlier, &flow, &relay_flags);
                    if weight >= self.options.min_weight {
                        graph.add_edge(earlier.id, flow.id, weight);
                        pairs.push(NewCorrelation {
                            flow_a: earlier.id.min(flow.id),
                            flow_b: earlier.id.max(flow.id),
                            weight,
                            kind,
                            evidence,
                        });
                    }
                }

                window.push_back(flow);
            }
        }

        self.persist(&pairs).await?;

        let candidate_circuits =
            graph.components(self.options.min_circuit_size);
        info!(
            candidates,
            correlations = pairs.len(),
            circuits = candidate_circuits.len(),
            "correlation pass complete"
        );

        Ok(CorrelateOutcome {
            correlations_persisted: pairs.len() as u64,
            candidate_circuits,
        })
    }

    /// Replace the persisted correlation set in one transaction. On any
    /// failure the transaction rolls back and the prior rows survive.
    async fn persist(&self, pairs: &[NewCorrelation]) -> Result<()> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| PipelineError::store("correlator", "begin", e))?;

        self.store.correlations().delete_all(&mut tx).await?;
        for pair in pairs {
            self.store.correlations().insert(&mut tx, pair).await?;
        }

        tx.commit()
            .await
            .map_err(|e| PipelineError::store("correlator", "commit", e))?;
        Ok(())
    }
}

/// Δt between two flows' start times, in seconds.
fn start_delta_seconds(a: &Flow, b: &Flow) -> f64 {
    ((b.ts_start - a.ts_start).num_microseconds().unwrap_or(i64::MAX) as f64
        / 1_000_000.0)
        .abs()
}

/// Additive pair weight plus the evidence trail behind it. `a` starts no
/// later than `b`.
fn weigh_pair(
    a: &Flow,
    b: &Flow,
    relay_flags: &HashMap<IpAddr, Vec<String>>,
) -> (f64, CorrelationKind, Vec<Evidence>) {
    let diff = start_delta_seconds(a, b);
    let timing_score = if diff < 1.0 {
        0.4
    } else if diff < 5.0 {
        0.3
    } else if diff < 10.0 {
        0.2
    } else {
        0.1
    };

    let mut weight = timing_score;
    let mut kind = CorrelationKind::Timing;
    let mut evidence = vec![Evidence::Timing {
        diff_seconds: diff,
        score: timing_score,
    }];

    if entry_exit_pattern(a, b, relay_flags) {
        weight += 0.3;
        kind = CorrelationKind::EntryExit;
        evidence.push(Evidence::EntryExit);
    }

    if let (Some(avg_a), Some(avg_b)) =
        (a.avg_packet_size(), b.avg_packet_size())
    {
        let ratio = avg_a.min(avg_b) / avg_a.max(avg_b);
        weight += 0.2 * ratio;
        evidence.push(Evidence::SizeSimilarity { ratio });
    }

    if a.key.src_addr == b.key.src_addr {
        weight += 0.1;
        evidence.push(Evidence::SameSource);
    }

    (weight, kind, evidence)
}

/// Entry/exit shape: the earlier flow reaches a guard while the later one
/// reaches an exit, or the earlier flow reaches any relay while the later
/// one leaves the overlay entirely.
fn entry_exit_pattern(
    a: &Flow,
    b: &Flow,
    relay_flags: &HashMap<IpAddr, Vec<String>>,
) -> bool {
    let a_node = relay_flags.get(&a.key.dst_addr);
    let b_node = relay_flags.get(&b.key.dst_addr);

    match (a_node, b_node) {
        (Some(a_flags), Some(b_flags)) => {
            has_flag(a_flags, RelayFlag::Guard)
                && has_flag(b_flags, RelayFlag::Exit)
        }
        (Some(_), None) => true,
        _ => false,
    }
}

fn has_flag(flags: &[String], flag: RelayFlag) -> bool {
    flags.iter().any(|f| f == flag.as_str())
}

/// RFC1918 source check. The address was validated into an `IpAddr` at the
/// store boundary, so malformed text never reaches this point; anything
/// that is not a private IPv4 address is treated as non-private.
fn is_private_source(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}
