use thiserror::Error;

/// Errors surfaced by pipeline stages and the store.
///
/// Per-record problems (an unparseable packet, a bad directory entry) are
/// not represented here: stages log those at debug and skip the record.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed or unreadable input (capture file, directory snapshot,
    /// signature table, unknown flow id). Nothing was committed.
    #[error("input error: {0}")]
    Input(String),

    /// Persistence failure. The in-progress batch was rolled back; batches
    /// committed earlier remain.
    #[error("store error in {stage}/{operation}: {source}")]
    Store {
        stage: &'static str,
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Invariant violation. These are programming bugs; the stage aborts.
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl PipelineError {
    /// Wrap a sqlx error with the stage and operation that hit it.
    pub fn store(
        stage: &'static str,
        operation: &'static str,
        source: sqlx::Error,
    ) -> Self {
        PipelineError::Store {
            stage,
            operation,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
