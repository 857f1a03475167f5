use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default location probed when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "veiltrace.toml";

/// Optional TOML configuration. Every field has a sensible default and any
/// value given on the command line wins over the file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path of the analysis store.
    pub db_path: Option<PathBuf>,
    /// Path of a signature-table override (TOML).
    pub signatures: Option<PathBuf>,
    pub ingest: IngestSection,
    pub classify: ClassifySection,
    pub correlate: CorrelateSection,
    pub score: ScoreSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub batch_size: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifySection {
    pub batch_size: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelateSection {
    pub window_seconds: Option<f64>,
    pub min_weight: Option<f64>,
    pub min_circuit_size: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ScoreSection {
    pub batch_size: Option<usize>,
}

impl AppConfig {
    /// Load configuration. An explicitly named file must exist and parse;
    /// the default path is probed quietly and falls back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_path(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_path(default)
                } else {
                    Ok(AppConfig::default())
                }
            }
        }
    }

    fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| {
            format!("cannot read config file {}", path.display())
        })?;
        toml::from_str(&text).with_context(|| {
            format!("malformed config file {}", path.display())
        })
    }
}
