use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use veiltrace_model::{NewReport, Report};

use super::{from_micros, to_micros};
use crate::error::{PipelineError, Result};

const STAGE: &str = "store";

#[derive(Clone, Debug)]
pub struct ReportRepository {
    pool: SqlitePool,
}

impl ReportRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a report row. Reports are never updated or deleted.
    pub async fn append(&self, report: &NewReport) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO reports (
                title, report_type, file_path, summary,
                total_flows, suspect_flows, critical_flows, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&report.title)
        .bind(report.report_type.as_deref())
        .bind(report.file_path.as_deref())
        .bind(report.summary.as_deref())
        .bind(report.total_flows as i64)
        .bind(report.suspect_flows as i64)
        .bind(report.critical_flows as i64)
        .bind(to_micros(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "append_report", e))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list(&self) -> Result<Vec<Report>> {
        let rows = sqlx::query(
            "SELECT id, title, report_type, file_path, summary, \
             total_flows, suspect_flows, critical_flows, created_at \
             FROM reports ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "list_reports", e))?;

        rows.iter().map(report_from_row).collect()
    }

    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM reports")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PipelineError::store(STAGE, "count_reports", e))?;

        Ok(row.get::<i64, _>("n") as u64)
    }
}

fn report_from_row(row: &SqliteRow) -> Result<Report> {
    Ok(Report {
        id: row.get("id"),
        title: row.get("title"),
        report_type: row.get("report_type"),
        file_path: row.get("file_path"),
        summary: row.get("summary"),
        total_flows: row.get::<i64, _>("total_flows") as u64,
        suspect_flows: row.get::<i64, _>("suspect_flows") as u64,
        critical_flows: row.get::<i64, _>("critical_flows") as u64,
        created_at: from_micros(row.get("created_at"))?,
    })
}
