use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use duckdb::Connection;
use tracing::info;

use crate::backend::fmt_ts;
use crate::schema::partition_table_sql;
use crate::DuckDbBackend;

/// One registered monthly partition, bounds `[starts_at, ends_at)`.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub partition_key: String,
    pub table_name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Calendar-month key, e.g. `202608`. Partition table names are derived from
/// this and nothing else, so embedding them in SQL is safe.
pub(crate) fn partition_key_for(ts: DateTime<Utc>) -> String {
    format!("{:04}{:02}", ts.year(), ts.month())
}

pub(crate) fn table_name_for(ts: DateTime<Utc>) -> String {
    format!("events_{}", partition_key_for(ts))
}

/// `[first day of month, first day of next month)` in UTC.
pub(crate) fn partition_bounds(ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = month_start(ts.year(), ts.month());
    let end = if ts.month() == 12 {
        month_start(ts.year() + 1, 1)
    } else {
        month_start(ts.year(), ts.month() + 1)
    };
    (start, end)
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    // Day 1 of any valid (year, month) always exists.
    let date = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN);
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
}

/// Create the partition table for `ts`'s month if absent and register it.
/// Returns the table name. Runs under the caller's connection lock.
pub(crate) fn ensure_partition_sync(conn: &Connection, ts: DateTime<Utc>) -> Result<String> {
    let key = partition_key_for(ts);
    let table_name = table_name_for(ts);
    let (starts_at, ends_at) = partition_bounds(ts);

    conn.execute_batch(&partition_table_sql(&table_name))?;
    conn.execute(
        "INSERT INTO event_partitions (partition_key, table_name, starts_at, ends_at) \
         VALUES (?1, ?2, ?3, ?4) ON CONFLICT (partition_key) DO NOTHING",
        duckdb::params![key, table_name, fmt_ts(starts_at), fmt_ts(ends_at)],
    )?;
    Ok(table_name)
}

/// All registered partitions, oldest first.
pub(crate) fn list_partitions_sync(conn: &Connection) -> Result<Vec<PartitionInfo>> {
    let mut stmt = conn.prepare(
        "SELECT partition_key, table_name, CAST(starts_at AS VARCHAR), CAST(ends_at AS VARCHAR) \
         FROM event_partitions ORDER BY partition_key",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut partitions = Vec::new();
    for row in rows {
        let (partition_key, table_name, starts_raw, ends_raw) = row?;
        partitions.push(PartitionInfo {
            partition_key,
            table_name,
            starts_at: crate::backend::parse_ts(&starts_raw)?,
            ends_at: crate::backend::parse_ts(&ends_raw)?,
        });
    }
    Ok(partitions)
}

/// Partition tables whose range intersects `[start, end)`, oldest first.
pub(crate) fn partitions_overlapping_sync(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<String>> {
    Ok(list_partitions_sync(conn)?
        .into_iter()
        .filter(|p| p.starts_at < end && p.ends_at > start)
        .map(|p| p.table_name)
        .collect())
}

impl DuckDbBackend {
    /// Drop every partition whose range ends on or before `before`.
    ///
    /// Retention expiry is an O(1) table drop per month — never a row-by-row
    /// delete. Returns the dropped table names.
    pub async fn expire_partitions(&self, before: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let expired: Vec<PartitionInfo> = list_partitions_sync(&conn)?
            .into_iter()
            .filter(|p| p.ends_at <= before)
            .collect();

        let mut dropped = Vec::with_capacity(expired.len());
        for partition in expired {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", partition.table_name))?;
            conn.execute(
                "DELETE FROM event_partitions WHERE partition_key = ?1",
                duckdb::params![partition.partition_key],
            )?;
            info!(partition = %partition.table_name, "Expired event partition");
            dropped.push(partition.table_name);
        }
        Ok(dropped)
    }

    pub async fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        let conn = self.conn.lock().await;
        list_partitions_sync(&conn)
    }
}
