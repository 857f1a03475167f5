use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Detection pattern tables used by the classifier and scorer.
///
/// The byte patterns and marker lists are data, not code: the built-in
/// defaults can be replaced from a TOML file without recompiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureSet {
    /// Record-layer prefix that opens a TLS handshake.
    pub tls_record_prefix: Vec<u8>,
    /// Cell/version byte patterns searched for inside a TLS-leading prefix.
    pub handshake_patterns: Vec<Vec<u8>>,
    /// ASCII markers of well-known cleartext protocols.
    pub plaintext_markers: Vec<String>,
    /// Destination ports associated with relay traffic.
    pub relay_ports: BTreeSet<u16>,
    /// Destination port of directory fetches.
    pub directory_port: u16,
    /// Leading window, in bytes, scanned for markers and byte diversity.
    pub marker_window: usize,
    /// Minimum prefix length considered for the obfuscation rule.
    pub min_obfuscated_len: usize,
    /// Distinct byte values within the window above which a prefix counts
    /// as obfuscated.
    pub distinct_byte_threshold: usize,
}

impl Default for SignatureSet {
    fn default() -> Self {
        SignatureSet {
            tls_record_prefix: vec![0x16, 0x03],
            handshake_patterns: vec![vec![0x00, 0x00, 0x00], vec![0x03, 0x00]],
            plaintext_markers: vec![
                "HTTP/".to_string(),
                "GET ".to_string(),
                "POST ".to_string(),
                "SSH-".to_string(),
                "220 ".to_string(),
                "CONNECT".to_string(),
            ],
            relay_ports: BTreeSet::from([9001, 9030, 9050, 9051, 9150]),
            directory_port: 9030,
            marker_window: 100,
            min_obfuscated_len: 100,
            distinct_byte_threshold: 50,
        }
    }
}

impl SignatureSet {
    /// Load a signature table from a TOML file. Missing keys fall back to
    /// the built-in defaults.
    pub fn from_toml_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Input(format!(
                "cannot read signature table {}: {e}",
                path.display()
            ))
        })?;
        toml::from_str(&text).map_err(|e| {
            PipelineError::Input(format!(
                "malformed signature table {}: {e}",
                path.display()
            ))
        })
    }
}
