use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport protocol of a flow. Only TCP and UDP flows are reconstructed;
/// packets carrying anything else are skipped at ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Transport::Tcp),
            "UDP" => Ok(Transport::Udp),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

/// Directional 5-tuple identifying a flow. No symmetric canonicalisation is
/// applied; the two directions of a conversation are distinct flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub transport: Transport,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.transport, self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

/// Classification indicators set by the classifier stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indicators {
    pub relay_comm: bool,
    pub directory_fetch: bool,
    pub possible_handshake: bool,
    pub obfuscated_candidate: bool,
}

impl Indicators {
    pub fn any(&self) -> bool {
        self.relay_comm
            || self.directory_fetch
            || self.possible_handshake
            || self.obfuscated_candidate
    }
}

/// Coarse confidence label derived from the numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfidenceCategory {
    Low,
    Medium,
    High,
    Critical,
}

impl ConfidenceCategory {
    /// Derive the category from a clamped score. Intervals are half-open:
    /// [0, 30) Low, [30, 60) Medium, [60, 85) High, [85, 100] Critical.
    pub fn from_score(score: f64) -> Self {
        if score < 30.0 {
            ConfidenceCategory::Low
        } else if score < 60.0 {
            ConfidenceCategory::Medium
        } else if score < 85.0 {
            ConfidenceCategory::High
        } else {
            ConfidenceCategory::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceCategory::Low => "Low",
            ConfidenceCategory::Medium => "Medium",
            ConfidenceCategory::High => "High",
            ConfidenceCategory::Critical => "Critical",
        }
    }
}

impl fmt::Display for ConfidenceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfidenceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Low" => Ok(ConfidenceCategory::Low),
            "Medium" => Ok(ConfidenceCategory::Medium),
            "High" => Ok(ConfidenceCategory::High),
            "Critical" => Ok(ConfidenceCategory::Critical),
            other => Err(format!("unknown confidence category: {other}")),
        }
    }
}

/// A reconstructed bidirectional conversation aggregate.
///
/// Created by the ingestor, annotated in place by the classifier and scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: i64,
    pub key: FlowKey,
    pub ts_start: DateTime<Utc>,
    pub ts_end: DateTime<Utc>,
    pub pkt_count: u64,
    pub byte_count: u64,
    /// First non-empty transport payload observed, truncated to 512 bytes.
    pub payload_prefix: Option<Vec<u8>>,
    pub indicators: Indicators,
    pub confidence_score: f64,
    pub confidence_category: Option<ConfidenceCategory>,
    pub created_at: DateTime<Utc>,
}

impl Flow {
    pub fn has_indicator(&self) -> bool {
        self.indicators.any()
    }

    /// Mean on-wire packet size, when at least one packet was observed.
    pub fn avg_packet_size(&self) -> Option<f64> {
        if self.pkt_count > 0 {
            Some(self.byte_count as f64 / self.pkt_count as f64)
        } else {
            None
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.ts_end - self.ts_start).num_microseconds().unwrap_or(0) as f64
            / 1_000_000.0
    }
}

/// A flow aggregate ready for insertion, before the store assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFlow {
    pub key: FlowKey,
    pub ts_start: DateTime<Utc>,
    pub ts_end: DateTime<Utc>,
    pub pkt_count: u64,
    pub byte_count: u64,
    pub payload_prefix: Option<Vec<u8>>,
}
