use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::schema::init_sql;

/// A DuckDB backend for the Lumetric pipeline.
///
/// DuckDB is single-writer: concurrent reads are fine, but concurrent writes
/// cause contention. We wrap the connection in `Arc<Mutex<_>>` so the async
/// runtime serialises all writes — ingestion flushes, the session aggregator,
/// the rollup materializer — while the struct stays cheap to clone and share
/// across Axum handlers. Per-bucket rollup updates are therefore serialized
/// per key as a side effect of the single-writer lock.
#[derive(Clone)]
pub struct DuckDbBackend {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl DuckDbBackend {
    /// Open (or create) a DuckDB database file at `path`.
    ///
    /// `memory_limit` is a DuckDB size string such as `"512MB"` or `"1GB"`,
    /// read from `Config.duckdb_memory_limit` at the call site. Schema init is
    /// idempotent.
    pub fn open(path: &str, memory_limit: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(&init_sql(memory_limit))?;
        Self::seed_settings_sync(&conn)?;
        info!(
            "DuckDB opened at {} with memory_limit={}, threads=2",
            path, memory_limit
        );
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an **in-memory** DuckDB database.
    ///
    /// Intended for tests — data is discarded when the struct is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(&init_sql("1GB"))?;
        Self::seed_settings_sync(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn seed_settings_sync(conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO settings (key, value) VALUES ('version', ?1)",
            duckdb::params!["1"],
        )?;
        Ok(())
    }

    /// Insert a site row if it does not exist yet. Safe to run on every
    /// startup.
    pub async fn seed_site(&self, site_id: &str, domain: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO sites (id, name, domain) VALUES (?1, ?2, ?3)",
            duckdb::params![site_id, domain, domain],
        )?;
        Ok(())
    }

    pub async fn site_exists(&self, site_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT COUNT(*) FROM sites WHERE id = ?1")?;
        let count: i64 = stmt.query_row(duckdb::params![site_id], |row| row.get(0))?;
        Ok(count > 0)
    }
}

/// Format a UTC timestamp the way every write and comparison in this crate
/// does. No offset suffix: partition columns are plain TIMESTAMP and all
/// values are UTC by contract.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Parse a timestamp read back via `CAST(col AS VARCHAR)`.
///
/// DuckDB renders with an optional fractional part, which `%.f` matches.
pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| anyhow!("unparseable timestamp {raw:?}: {e}"))
}
