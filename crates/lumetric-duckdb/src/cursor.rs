use anyhow::Result;
use chrono::NaiveDate;

use crate::DuckDbBackend;

pub const SESSION_AGGREGATOR_CURSOR: &str = "cursor:session_aggregator";
pub const ROLLUP_EVENTS_CURSOR: &str = "cursor:rollup_events";
pub const ROLLUP_ATTRIBUTIONS_CURSOR: &str = "cursor:rollup_attributions";

/// Durable, restartable consumer cursors stored in `settings`.
///
/// Cursors are advanced only after a batch has been applied, so a crash
/// mid-batch replays the batch (at-least-once); the consumers are written to
/// tolerate redelivery.
impl DuckDbBackend {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let value: Option<String> = stmt
            .query_row(duckdb::params![key], |row| row.get(0))
            .ok();
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            duckdb::params![key, value],
        )?;
        Ok(())
    }

    /// Read a sequence cursor; absent means "start from the beginning".
    pub async fn get_cursor(&self, name: &str) -> Result<i64> {
        Ok(self
            .get_setting(name)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn set_cursor(&self, name: &str, position: i64) -> Result<()> {
        self.set_setting(name, &position.to_string()).await
    }

    /// Latest day for which rollups are known to be materialized for a site.
    /// Query reads serve later days from a raw scan instead of buckets.
    pub async fn rollup_high_water(&self, site_id: &str) -> Result<Option<NaiveDate>> {
        Ok(self
            .get_setting(&format!("rollup_high_water:{site_id}"))
            .await?
            .and_then(|v| NaiveDate::parse_from_str(&v, "%Y-%m-%d").ok()))
    }

    pub async fn set_rollup_high_water(&self, site_id: &str, day: NaiveDate) -> Result<()> {
        let current = self.rollup_high_water(site_id).await?;
        if current.map_or(true, |d| day > d) {
            self.set_setting(&format!("rollup_high_water:{site_id}"), &day.to_string())
                .await?;
        }
        Ok(())
    }
}
