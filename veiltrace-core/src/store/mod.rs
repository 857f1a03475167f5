pub mod correlations;
pub mod flows;
pub mod relays;
pub mod reports;

pub use correlations::CorrelationRepository;
pub use flows::FlowRepository;
pub use relays::RelayRepository;
pub use reports::ReportRepository;

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use tracing::info;

use crate::error::{PipelineError, Result};

/// Handle to the analysis store: a single-file SQLite database holding
/// flows, relay nodes, correlations, and report metadata.
///
/// All pipeline stages read and write through this handle; it is passed
/// explicitly into every stage constructor rather than held as ambient
/// state.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    flows: FlowRepository,
    relays: RelayRepository,
    correlations: CorrelationRepository,
    reports: ReportRepository,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl Store {
    /// Open (or create) the store at `path` and bring the schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::store("store", "connect", e))?;

        Self::migrate(&pool).await?;
        info!(path = %path.display(), "analysis store opened");

        Ok(Self::from_pool(pool))
    }

    /// In-memory store, used by tests. A single connection keeps every
    /// statement on the same private database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::store("store", "connect", e))?;

        Self::migrate(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        let flows = FlowRepository::new(pool.clone());
        let relays = RelayRepository::new(pool.clone());
        let correlations = CorrelationRepository::new(pool.clone());
        let reports = ReportRepository::new(pool.clone());

        Store {
            pool,
            flows,
            relays,
            correlations,
            reports,
        }
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }

    /// Drop every table (including the migrations ledger) and recreate the
    /// schema from scratch.
    pub async fn reset(&self) -> Result<()> {
        for table in [
            "correlations",
            "reports",
            "flows",
            "relay_nodes",
            "_sqlx_migrations",
        ] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&self.pool)
                .await
                .map_err(|e| PipelineError::store("store", "reset", e))?;
        }

        Self::migrate(&self.pool).await?;
        info!("analysis store reset");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn flows(&self) -> &FlowRepository {
        &self.flows
    }

    pub fn relays(&self) -> &RelayRepository {
        &self.relays
    }

    pub fn correlations(&self) -> &CorrelationRepository {
        &self.correlations
    }

    pub fn reports(&self) -> &ReportRepository {
        &self.reports
    }
}

/// Timestamps are persisted as INTEGER microseconds since the epoch;
/// lexical and chronological order coincide and resolution matches the
/// capture formats.
pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value).ok_or_else(|| {
        PipelineError::Contract(format!(
            "stored timestamp out of range: {value}"
        ))
    })
}

pub(crate) fn addr_from_text(value: &str) -> Result<IpAddr> {
    IpAddr::from_str(value).map_err(|_| {
        PipelineError::Contract(format!("malformed stored address: {value}"))
    })
}
