use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, SqliteConnection};
use veiltrace_model::{Correlation, CorrelationKind, Evidence, NewCorrelation};

use super::{from_micros, to_micros};
use crate::error::{PipelineError, Result};

const STAGE: &str = "store";

const CORRELATION_COLUMNS: &str =
    "id, flow_a, flow_b, weight, kind, evidence, created_at";

#[derive(Clone, Debug)]
pub struct CorrelationRepository {
    pool: SqlitePool,
}

impl CorrelationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Remove every correlation row. The correlator pass is destructive:
    /// it clears prior results and rebuilds inside one transaction.
    pub async fn delete_all(&self, conn: &mut SqliteConnection) -> Result<u64> {
        let result = sqlx::query("DELETE FROM correlations")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                PipelineError::store(STAGE, "delete_correlations", e)
            })?;

        Ok(result.rows_affected())
    }

    /// Insert one correlation inside the caller's transaction.
    pub async fn insert(
        &self,
        conn: &mut SqliteConnection,
        correlation: &NewCorrelation,
    ) -> Result<()> {
        if correlation.flow_a == correlation.flow_b {
            return Err(PipelineError::Contract(format!(
                "correlation links flow {} to itself",
                correlation.flow_a
            )));
        }
        if correlation.flow_a > correlation.flow_b {
            return Err(PipelineError::Contract(format!(
                "correlation ids out of order: {} > {}",
                correlation.flow_a, correlation.flow_b
            )));
        }

        let evidence = serde_json::to_string(&correlation.evidence)?;

        sqlx::query(
            r#"
            INSERT INTO correlations (
                flow_a, flow_b, weight, kind, evidence, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(correlation.flow_a)
        .bind(correlation.flow_b)
        .bind(correlation.weight)
        .bind(correlation.kind.as_str())
        .bind(evidence)
        .bind(to_micros(Utc::now()))
        .execute(&mut *conn)
        .await
        .map_err(|e| PipelineError::store(STAGE, "insert_correlation", e))?;

        Ok(())
    }

    /// All correlations referencing `flow_id` on either side.
    pub async fn touching(&self, flow_id: i64) -> Result<Vec<Correlation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CORRELATION_COLUMNS} FROM correlations \
             WHERE flow_a = ?1 OR flow_b = ?1 ORDER BY id"
        ))
        .bind(flow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "touching", e))?;

        rows.iter().map(correlation_from_row).collect()
    }

    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM correlations")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                PipelineError::store(STAGE, "count_correlations", e)
            })?;

        Ok(row.get::<i64, _>("n") as u64)
    }
}

fn correlation_from_row(row: &SqliteRow) -> Result<Correlation> {
    let kind = CorrelationKind::from_str(&row.get::<String, _>("kind"))
        .map_err(PipelineError::Contract)?;
    let evidence: Vec<Evidence> =
        serde_json::from_str(&row.get::<String, _>("evidence"))?;

    Ok(Correlation {
        id: row.get("id"),
        flow_a: row.get("flow_a"),
        flow_b: row.get("flow_b"),
        weight: row.get("weight"),
        kind,
        evidence,
        created_at: from_micros(row.get("created_at"))?,
    })
}
