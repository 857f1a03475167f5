use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, SqliteConnection};
use veiltrace_model::{NewRelayNode, RelayFlag, RelayNode};

use super::{addr_from_text, from_micros, to_micros};
use crate::error::{PipelineError, Result};

const STAGE: &str = "store";

const RELAY_COLUMNS: &str = "id, address, port, fingerprint, nickname, \
     flags, country_code, asn, bandwidth, last_seen";

#[derive(Clone, Debug)]
pub struct RelayRepository {
    pool: SqlitePool,
}

impl RelayRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert one directory record inside the caller's transaction.
    /// Conflicts on address update the row in place, preserving its id.
    pub async fn upsert(
        &self,
        conn: &mut SqliteConnection,
        node: &NewRelayNode,
    ) -> Result<()> {
        let flags = serde_json::to_string(&node.flags)?;
        let now = to_micros(Utc::now());

        sqlx::query(
            r#"
            INSERT INTO relay_nodes (
                address, port, fingerprint, nickname, flags,
                country_code, asn, bandwidth, last_seen,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            ON CONFLICT (address) DO UPDATE SET
                port = excluded.port,
                fingerprint = excluded.fingerprint,
                nickname = excluded.nickname,
                flags = excluded.flags,
                country_code = excluded.country_code,
                asn = excluded.asn,
                bandwidth = excluded.bandwidth,
                last_seen = excluded.last_seen,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(node.address.to_string())
        .bind(node.port as i64)
        .bind(node.fingerprint.as_deref())
        .bind(node.nickname.as_deref())
        .bind(flags)
        .bind(node.country_code.as_deref())
        .bind(node.asn.as_deref())
        .bind(node.bandwidth)
        .bind(node.last_seen.map(to_micros))
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| PipelineError::store(STAGE, "upsert_relay", e))?;

        Ok(())
    }

    pub async fn find_by_address(
        &self,
        address: IpAddr,
    ) -> Result<Option<RelayNode>> {
        let row = sqlx::query(&format!(
            "SELECT {RELAY_COLUMNS} FROM relay_nodes WHERE address = ?1"
        ))
        .bind(address.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "find_relay", e))?;

        row.as_ref().map(relay_from_row).transpose()
    }

    /// Snapshot of every known relay address.
    pub async fn addresses(&self) -> Result<HashSet<IpAddr>> {
        let rows = sqlx::query("SELECT address FROM relay_nodes")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::store(STAGE, "relay_addresses", e))?;

        rows.iter()
            .map(|row| addr_from_text(&row.get::<String, _>("address")))
            .collect()
    }

    /// Snapshot mapping each relay address to its flag set. The correlator
    /// and scorer consult this instead of issuing a lookup per pair.
    pub async fn flag_map(&self) -> Result<HashMap<IpAddr, Vec<String>>> {
        let rows = sqlx::query("SELECT address, flags FROM relay_nodes")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PipelineError::store(STAGE, "relay_flags", e))?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in &rows {
            let addr = addr_from_text(&row.get::<String, _>("address"))?;
            let flags: Vec<String> =
                serde_json::from_str(&row.get::<String, _>("flags"))?;
            map.insert(addr, flags);
        }
        Ok(map)
    }

    /// All relays carrying a given flag.
    pub async fn by_flag(&self, flag: RelayFlag) -> Result<Vec<RelayNode>> {
        let rows = sqlx::query(&format!(
            "SELECT {RELAY_COLUMNS} FROM relay_nodes ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::store(STAGE, "relays_by_flag", e))?;

        let mut nodes = Vec::new();
        for row in &rows {
            let node = relay_from_row(row)?;
            if node.has_flag(flag) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM relay_nodes")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PipelineError::store(STAGE, "count_relays", e))?;

        Ok(row.get::<i64, _>("n") as u64)
    }
}

fn relay_from_row(row: &SqliteRow) -> Result<RelayNode> {
    let flags: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("flags"))?;

    Ok(RelayNode {
        id: row.get("id"),
        address: addr_from_text(&row.get::<String, _>("address"))?,
        port: row.get::<i64, _>("port") as u16,
        fingerprint: row.get("fingerprint"),
        nickname: row.get("nickname"),
        flags,
        country_code: row.get("country_code"),
        asn: row.get("asn"),
        bandwidth: row.get("bandwidth"),
        last_seen: row
            .get::<Option<i64>, _>("last_seen")
            .map(from_micros)
            .transpose()?,
    })
}
