use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, SqliteConnection};
use tracing::debug;
use veiltrace_model::{
    ConfidenceCategory, Flow, FlowKey, Indicators, NewFlow, Transport,
};

use super::{addr_from_text, from_micros, to_micros};
use crate::error::{PipelineError, Result};

const STAGE: &str = "store";

const FLOW_COLUMNS: &str = "id, src_addr, src_port, dst_addr, dst_port, \
     transport, ts_start, ts_end, pkt_count, byte_count, payload_prefix, \
     relay_comm, directory_fetch, possible_handshake, obfuscated_candidate, \
     confidence_score, confidence_category, created_at";

const ANY_INDICATOR: &str = "(relay_comm = 1 OR directory_fetch = 1 \
     OR possible_handshake = 1 OR obfuscated_candidate = 1)";

#[derive(Clone, Debug)]
pub struct FlowRepository {
    pool: SqlitePool,
}

impl FlowRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a batch of freshly reconstructed flows in one transaction.
    /// Every record is checked against the flow invariants before anything
    /// is written; a violation aborts the whole batch.
    pub async fn insert_batch(&self, flows: &[NewFlow]) -> Result<u64> {
        if flows.is_empty() {
            return Ok(0);
        }
        for flow in flows {
            validate_new_flow(flow)?;
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PipelineError::store(STAGE, "begin", e))?;

        let now = to_micros(Utc::now());
        for flow in flows {
            sqlx::query(
                r#"
                INSERT INTO flows (
                    src_addr, src_port, dst_addr, dst_port, transport,
                    ts_start, ts_end, pkt_count, byte_count, payload_prefix,
                    created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )
            .bind(flow.key.src_addr.to_string())
            .bind(flow.key.src_port as i64)
            .bind(flow.key.dst_addr.to_string())
            .bind(flow.key.dst_port as i64)
            .bind(flow.key.transport.as_str())
            .bind(to_micros(flow.ts_start))
            .bind(to_micros(flow.ts_end))
            .bind(flow.pkt_count as i64)
            .bind(flow.byte_count as i64)
            .bind(flow.payload_prefix.as_deref())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| PipelineError::store(STAGE, "insert_flow", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| PipelineError::store(STAGE, "commit_flows", e))?;

        debug!(count = flows.len(), "flushed flow batch");
        Ok(flows.len() as u64)
    }

    pub async fn fetch(&self, id: i64) -> Result<Option<Flow>> {
        let row = sqlx::query(&format!(
            "SELECT {FLOW_COLUMNS} FROM flows WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "fetch_flow", e))?;

        row.as_ref().map(flow_from_row).transpose()
    }

    /// Page through flows in id order; the classifier and scorer walk the
    /// table this way so each batch is a stable, resumable slice.
    pub async fn page_after(
        &self,
        last_id: i64,
        limit: u32,
    ) -> Result<Vec<Flow>> {
        let rows = sqlx::query(&format!(
            "SELECT {FLOW_COLUMNS} FROM flows WHERE id > ?1 \
             ORDER BY id LIMIT ?2"
        ))
        .bind(last_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "page_flows", e))?;

        rows.iter().map(flow_from_row).collect()
    }

    /// Stream all flows ordered by `(ts_start, id)`.
    pub fn stream_by_start(&self) -> BoxStream<'_, Result<Flow>> {
        sqlx::query(
            "SELECT id, src_addr, src_port, dst_addr, dst_port, transport, \
             ts_start, ts_end, pkt_count, byte_count, payload_prefix, \
             relay_comm, directory_fetch, possible_handshake, \
             obfuscated_candidate, confidence_score, confidence_category, \
             created_at FROM flows ORDER BY ts_start, id",
        )
        .fetch(&self.pool)
        .map(|res| {
            let row = res
                .map_err(|e| PipelineError::store(STAGE, "stream_flows", e))?;
            flow_from_row(&row)
        })
        .boxed()
    }

    /// Stream the correlation candidate set: flows with at least one
    /// classifier indicator, ordered by `(ts_start, id)`.
    pub fn candidates_by_start(&self) -> BoxStream<'_, Result<Flow>> {
        sqlx::query(
            "SELECT id, src_addr, src_port, dst_addr, dst_port, transport, \
             ts_start, ts_end, pkt_count, byte_count, payload_prefix, \
             relay_comm, directory_fetch, possible_handshake, \
             obfuscated_candidate, confidence_score, confidence_category, \
             created_at FROM flows \
             WHERE (relay_comm = 1 OR directory_fetch = 1 \
             OR possible_handshake = 1 OR obfuscated_candidate = 1) \
             ORDER BY ts_start, id",
        )
        .fetch(&self.pool)
        .map(|res| {
            let row = res.map_err(|e| {
                PipelineError::store(STAGE, "stream_candidates", e)
            })?;
            flow_from_row(&row)
        })
        .boxed()
    }

    pub async fn by_src_addr(&self, addr: IpAddr) -> Result<Vec<Flow>> {
        self.fetch_filtered("src_addr = ?1", addr.to_string()).await
    }

    pub async fn by_dst_addr(&self, addr: IpAddr) -> Result<Vec<Flow>> {
        self.fetch_filtered("dst_addr = ?1", addr.to_string()).await
    }

    pub async fn by_category(
        &self,
        category: ConfidenceCategory,
    ) -> Result<Vec<Flow>> {
        self.fetch_filtered(
            "confidence_category = ?1",
            category.as_str().to_string(),
        )
        .await
    }

    async fn fetch_filtered(
        &self,
        predicate: &str,
        bind: String,
    ) -> Result<Vec<Flow>> {
        let rows = sqlx::query(&format!(
            "SELECT {FLOW_COLUMNS} FROM flows WHERE {predicate} \
             ORDER BY ts_start, id"
        ))
        .bind(bind)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "filter_flows", e))?;

        rows.iter().map(flow_from_row).collect()
    }

    /// Flows whose start time falls inside `[start, end]`.
    pub async fn in_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Flow>> {
        let rows = sqlx::query(&format!(
            "SELECT {FLOW_COLUMNS} FROM flows \
             WHERE ts_start >= ?1 AND ts_start <= ?2 ORDER BY ts_start, id"
        ))
        .bind(to_micros(start))
        .bind(to_micros(end))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "time_range", e))?;

        rows.iter().map(flow_from_row).collect()
    }

    /// Flows at or above a confidence score, strongest first.
    pub async fn with_min_score(&self, min_score: f64) -> Result<Vec<Flow>> {
        let rows = sqlx::query(&format!(
            "SELECT {FLOW_COLUMNS} FROM flows \
             WHERE confidence_score >= ?1 \
             ORDER BY confidence_score DESC, id"
        ))
        .bind(min_score)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "min_score", e))?;

        rows.iter().map(flow_from_row).collect()
    }

    /// Write the classifier indicators for one flow inside the caller's
    /// batch transaction.
    pub async fn update_indicators(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        indicators: &Indicators,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE flows
            SET relay_comm = ?2,
                directory_fetch = ?3,
                possible_handshake = ?4,
                obfuscated_candidate = ?5
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(indicators.relay_comm)
        .bind(indicators.directory_fetch)
        .bind(indicators.possible_handshake)
        .bind(indicators.obfuscated_candidate)
        .execute(&mut *conn)
        .await
        .map_err(|e| PipelineError::store(STAGE, "update_indicators", e))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::Input(format!("flow {id} not found")));
        }
        Ok(())
    }

    /// Write the confidence score and category for one flow inside the
    /// caller's batch transaction.
    pub async fn update_score(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        score: f64,
        category: ConfidenceCategory,
    ) -> Result<()> {
        if !(0.0..=100.0).contains(&score) {
            return Err(PipelineError::Contract(format!(
                "confidence score {score} outside [0, 100] for flow {id}"
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE flows
            SET confidence_score = ?2,
                confidence_category = ?3
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(score)
        .bind(category.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| PipelineError::store(STAGE, "update_score", e))?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::Input(format!("flow {id} not found")));
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<u64> {
        self.count_where("1 = 1").await
    }

    pub async fn count_with_indicator(&self) -> Result<u64> {
        self.count_where(ANY_INDICATOR).await
    }

    pub async fn count_by_category(
        &self,
        category: ConfidenceCategory,
    ) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM flows WHERE confidence_category = ?1",
        )
        .bind(category.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "count_flows", e))?;

        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn count_where(&self, predicate: &str) -> Result<u64> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM flows WHERE {predicate}"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "count_flows", e))?;

        Ok(row.get::<i64, _>("n") as u64)
    }

    /// Delete one flow; its correlations cascade.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM flows WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::store(STAGE, "delete_flow", e))?;

        Ok(result.rows_affected() > 0)
    }
}

fn validate_new_flow(flow: &NewFlow) -> Result<()> {
    if flow.pkt_count < 1 {
        return Err(PipelineError::Contract(format!(
            "flow {} persisted with zero packets",
            flow.key
        )));
    }
    if flow.byte_count < flow.pkt_count {
        return Err(PipelineError::Contract(format!(
            "flow {} has byte_count {} below pkt_count {}",
            flow.key, flow.byte_count, flow.pkt_count
        )));
    }
    if flow.ts_start > flow.ts_end {
        return Err(PipelineError::Contract(format!(
            "flow {} starts after it ends",
            flow.key
        )));
    }
    if flow.payload_prefix.as_ref().is_some_and(|p| p.len() > 512) {
        return Err(PipelineError::Contract(format!(
            "flow {} payload prefix exceeds 512 bytes",
            flow.key
        )));
    }
    Ok(())
}

fn flow_from_row(row: &SqliteRow) -> Result<Flow> {
    let transport = Transport::from_str(&row.get::<String, _>("transport"))
        .map_err(PipelineError::Contract)?;
    let category = row
        .get::<Option<String>, _>("confidence_category")
        .map(|s| {
            ConfidenceCategory::from_str(&s).map_err(PipelineError::Contract)
        })
        .transpose()?;

    Ok(Flow {
        id: row.get("id"),
        key: FlowKey {
            src_addr: addr_from_text(&row.get::<String, _>("src_addr"))?,
            src_port: row.get::<i64, _>("src_port") as u16,
            dst_addr: addr_from_text(&row.get::<String, _>("dst_addr"))?,
            dst_port: row.get::<i64, _>("dst_port") as u16,
            transport,
        },
        ts_start: from_micros(row.get("ts_start"))?,
        ts_end: from_micros(row.get("ts_end"))?,
        pkt_count: row.get::<i64, _>("pkt_count") as u64,
        byte_count: row.get::<i64, _>("byte_count") as u64,
        payload_prefix: row.get("payload_prefix"),
        indicators: Indicators {
            relay_comm: row.get("relay_comm"),
            directory_fetch: row.get("directory_fetch"),
            possible_handshake: row.get("possible_handshake"),
            obfuscated_candidate: row.get("obfuscated_candidate"),
        },
        confidence_score: row.get("confidence_score"),
        confidence_category: category,
        created_at: from_micros(row.get("created_at"))?,
    })
}
