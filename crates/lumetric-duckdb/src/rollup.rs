use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use duckdb::Connection;
use tracing::debug;

use lumetric_core::rollup::{BucketKey, DayStat, RollupBucket, StatsSummary};

use crate::backend::{fmt_ts, parse_ts};
use crate::cursor::{ROLLUP_ATTRIBUTIONS_CURSOR, ROLLUP_EVENTS_CURSOR, SESSION_AGGREGATOR_CURSOR};
use crate::events::ScanFilter;
use crate::partition::partitions_overlapping_sync;
use crate::DuckDbBackend;

fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap_or_default());
    (start, start + Duration::days(1))
}

#[derive(Debug, Clone)]
struct DimRow {
    source: String,
    device_class: String,
    bucket: RollupBucket,
}

impl DuckDbBackend {
    /// Run one materializer batch.
    ///
    /// Tails sessionized events and newly created attribution records from
    /// their durable cursors, collects the dirty `(site, day)` slices, and
    /// re-derives each affected slice wholesale from raw rows. A late event
    /// for an already-rolled-up day just marks that day dirty again — the
    /// correction path and the hot path are the same rebuild. Buckets are
    /// caches: this never reads a bucket to produce a bucket.
    ///
    /// Per-bucket update serialization comes for free from the single-writer
    /// connection lock.
    ///
    /// Returns the number of slices rebuilt.
    pub async fn run_rollup_once(&self, batch_limit: usize) -> Result<usize> {
        let mut dirty: BTreeSet<(String, NaiveDate)> = BTreeSet::new();

        // Events are consumed only up to the session aggregator's cursor.
        // Session stamping is an UPDATE that produces no new ingest_seq, so a
        // bucket built from unstamped rows would undercount sessions and
        // nothing would ever mark the day dirty again. Rows past the clamp
        // stay in the feed for a later pass.
        let session_cursor = self.get_cursor(SESSION_AGGREGATOR_CURSOR).await?;
        let ev_cursor = self.get_cursor(ROLLUP_EVENTS_CURSOR).await?;
        let mut events = self.tail_events(ev_cursor, batch_limit).await?;
        events.retain(|(seq, _)| *seq <= session_cursor);
        let max_ev_seq = events.iter().map(|(seq, _)| *seq).max();
        for (_, event) in &events {
            dirty.insert((event.site_id.clone(), event.occurred_at.date_naive()));
        }

        let at_cursor = self.get_cursor(ROLLUP_ATTRIBUTIONS_CURSOR).await?;
        let attributions = self.tail_attributions(at_cursor, batch_limit).await?;
        let max_at_seq = attributions.iter().map(|(seq, _, _)| *seq).max();
        for (_, site_id, occurred_at) in &attributions {
            dirty.insert((site_id.clone(), occurred_at.date_naive()));
        }

        if dirty.is_empty() {
            return Ok(0);
        }

        for (site_id, day) in &dirty {
            self.rebuild_day(site_id, *day).await?;
        }

        // High-water marks advance from events only: a day is "materialized"
        // once its traffic has flowed through here.
        for (_, event) in &events {
            self.set_rollup_high_water(&event.site_id, event.occurred_at.date_naive())
                .await?;
        }

        if let Some(seq) = max_ev_seq {
            self.set_cursor(ROLLUP_EVENTS_CURSOR, seq).await?;
        }
        if let Some(seq) = max_at_seq {
            self.set_cursor(ROLLUP_ATTRIBUTIONS_CURSOR, seq).await?;
        }
        debug!(slices = dirty.len(), "rollup slices rebuilt");
        Ok(dirty.len())
    }

    async fn tail_attributions(
        &self,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<(i64, String, DateTime<Utc>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT attr_seq, site_id, CAST(purchase_occurred_at AS VARCHAR) \
             FROM attribution_records WHERE attr_seq > ?1 \
             ORDER BY attr_seq LIMIT {}",
            limit.max(1)
        ))?;
        let rows = stmt.query_map(duckdb::params![after_seq], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, site_id, occurred_raw) = row?;
            out.push((seq, site_id, parse_ts(&occurred_raw)?));
        }
        Ok(out)
    }

    /// Re-derive every bucket of one `(site, day)` slice from raw events and
    /// attribution records, replacing whatever was there.
    pub async fn rebuild_day(&self, site_id: &str, day: NaiveDate) -> Result<()> {
        let (start, end) = day_bounds(day);
        let mut conn = self.conn.lock().await;

        let event_rows = event_dim_rows_sync(&conn, site_id, start, end, None, None)?;
        let attr_rows = attribution_dim_rows_sync(&conn, site_id, start, end, None, None)?;

        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM rollup_buckets WHERE site_id = ?1 AND day = ?2",
            duckdb::params![site_id, day.to_string()],
        )?;
        for row in &event_rows {
            tx.execute(
                "INSERT INTO rollup_buckets (
                    site_id, day, source, device_class,
                    pageviews, visitors, sessions, bounces, conversions, revenue
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0)",
                duckdb::params![
                    site_id,
                    day.to_string(),
                    row.source,
                    row.device_class,
                    row.bucket.pageviews as i64,
                    row.bucket.visitors as i64,
                    row.bucket.sessions as i64,
                    row.bucket.bounces as i64,
                ],
            )?;
        }
        for row in &attr_rows {
            tx.execute(
                "INSERT INTO rollup_buckets (
                    site_id, day, source, device_class,
                    pageviews, visitors, sessions, bounces, conversions, revenue
                 ) VALUES (?1, ?2, ?3, ?4, 0, 0, 0, 0, ?5, ?6)
                 ON CONFLICT (site_id, day, source, device_class)
                 DO UPDATE SET conversions = excluded.conversions, revenue = excluded.revenue",
                duckdb::params![
                    site_id,
                    day.to_string(),
                    row.source,
                    row.device_class,
                    row.bucket.conversions as i64,
                    row.bucket.revenue,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Read one bucket (test/verification helper).
    pub async fn read_bucket(&self, key: &BucketKey) -> Result<Option<RollupBucket>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT pageviews, visitors, sessions, bounces, conversions, revenue \
             FROM rollup_buckets \
             WHERE site_id = ?1 AND day = ?2 AND source = ?3 AND device_class = ?4",
        )?;
        let bucket = stmt
            .query_row(
                duckdb::params![
                    key.site_id,
                    key.day.to_string(),
                    key.source,
                    key.device_class
                ],
                |row| {
                    Ok(RollupBucket {
                        pageviews: row.get::<_, i64>(0)?.max(0) as u64,
                        visitors: row.get::<_, i64>(1)?.max(0) as u64,
                        sessions: row.get::<_, i64>(2)?.max(0) as u64,
                        bounces: row.get::<_, i64>(3)?.max(0) as u64,
                        conversions: row.get::<_, i64>(4)?.max(0) as u64,
                        revenue: row.get(5)?,
                    })
                },
            )
            .ok();
        Ok(bucket)
    }

    /// Range stats for the query interface, rollup-first.
    ///
    /// Days up to the site's materialized high-water mark are summed from
    /// `rollup_buckets`; later days fall back to an on-the-fly raw derivation
    /// (identical shape to the rebuild queries, just not persisted). Totals
    /// are the sum over returned days.
    pub async fn read_stats(
        &self,
        site_id: &str,
        start_day: NaiveDate,
        end_day: NaiveDate,
        filter: &ScanFilter,
    ) -> Result<StatsSummary> {
        let high_water = self.rollup_high_water(site_id).await?;
        let source = filter.source.as_deref();
        let device = filter.device_class.as_deref();

        let mut days: Vec<DayStat> = Vec::new();
        let mut day = start_day;
        while day <= end_day {
            let materialized = high_water.is_some_and(|hw| day <= hw);
            let bucket = if materialized {
                self.sum_buckets_for_day(site_id, day, source, device).await?
            } else {
                self.derive_day_from_raw(site_id, day, source, device).await?
            };
            days.push(DayStat { day, bucket });
            day += Duration::days(1);
        }

        let mut totals = RollupBucket::default();
        for stat in &days {
            totals.merge(&stat.bucket);
        }
        Ok(StatsSummary { totals, days })
    }

    async fn sum_buckets_for_day(
        &self,
        site_id: &str,
        day: NaiveDate,
        source: Option<&str>,
        device: Option<&str>,
    ) -> Result<RollupBucket> {
        let conn = self.conn.lock().await;
        let mut sql = String::from(
            "SELECT COALESCE(SUM(pageviews), 0), COALESCE(SUM(visitors), 0), \
                    COALESCE(SUM(sessions), 0), COALESCE(SUM(bounces), 0), \
                    COALESCE(SUM(conversions), 0), COALESCE(SUM(revenue), 0) \
             FROM rollup_buckets WHERE site_id = ?1 AND day = ?2",
        );
        let mut params: Vec<Box<dyn duckdb::types::ToSql>> =
            vec![Box::new(site_id.to_string()), Box::new(day.to_string())];
        let mut idx = 3;
        if let Some(source) = source {
            sql.push_str(&format!(" AND source = ?{idx}"));
            params.push(Box::new(source.to_string()));
            idx += 1;
        }
        if let Some(device) = device {
            sql.push_str(&format!(" AND device_class = ?{idx}"));
            params.push(Box::new(device.to_string()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn duckdb::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let bucket = stmt.query_row(param_refs.as_slice(), |row| {
            Ok(RollupBucket {
                pageviews: row.get::<_, i64>(0)?.max(0) as u64,
                visitors: row.get::<_, i64>(1)?.max(0) as u64,
                sessions: row.get::<_, i64>(2)?.max(0) as u64,
                bounces: row.get::<_, i64>(3)?.max(0) as u64,
                conversions: row.get::<_, i64>(4)?.max(0) as u64,
                revenue: row.get(5)?,
            })
        })?;
        Ok(bucket)
    }

    async fn derive_day_from_raw(
        &self,
        site_id: &str,
        day: NaiveDate,
        source: Option<&str>,
        device: Option<&str>,
    ) -> Result<RollupBucket> {
        let (start, end) = day_bounds(day);
        let conn = self.conn.lock().await;
        let event_rows = event_dim_rows_sync(&conn, site_id, start, end, source, device)?;
        let attr_rows = attribution_dim_rows_sync(&conn, site_id, start, end, source, device)?;

        let mut bucket = RollupBucket::default();
        for row in event_rows.iter().chain(attr_rows.iter()) {
            bucket.merge(&row.bucket);
        }
        Ok(bucket)
    }
}

/// Per-dimension aggregates over one site-day of raw events.
///
/// Dimension columns come from the event itself: `utm_source` (else
/// "direct") and `device_class` (else "unknown"). Bounce flags join in from
/// the derived sessions table; events not yet assigned to a session count
/// zero sessions.
fn event_dim_rows_sync(
    conn: &Connection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    source: Option<&str>,
    device: Option<&str>,
) -> Result<Vec<DimRow>> {
    let tables = partitions_overlapping_sync(conn, start, end)?;
    if tables.is_empty() {
        return Ok(Vec::new());
    }
    let union: Vec<String> = tables.iter().map(|t| format!("SELECT * FROM {t}")).collect();

    let mut sql = format!(
        "WITH day_events AS (
            SELECT e.*, \
                   COALESCE(NULLIF(e.utm_source, ''), 'direct') AS dim_source, \
                   COALESCE(NULLIF(e.device_class, ''), 'unknown') AS dim_device \
            FROM ({}) e \
            WHERE e.site_id = ?1 AND e.occurred_at >= ?2 AND e.occurred_at < ?3
        )
        SELECT de.dim_source, de.dim_device, \
               COUNT(*) FILTER (WHERE de.event_kind = 'pageview') AS pageviews, \
               COUNT(DISTINCT de.visitor_id) AS visitors, \
               COUNT(DISTINCT NULLIF(de.session_id, '')) AS sessions, \
               COUNT(DISTINCT CASE WHEN s.is_bounce THEN NULLIF(de.session_id, '') END) AS bounces \
        FROM day_events de \
        LEFT JOIN sessions s ON s.session_id = de.session_id",
        union.join(" UNION ALL ")
    );
    let mut params: Vec<Box<dyn duckdb::types::ToSql>> = vec![
        Box::new(site_id.to_string()),
        Box::new(fmt_ts(start)),
        Box::new(fmt_ts(end)),
    ];
    let mut conditions: Vec<String> = Vec::new();
    let mut idx = 4;
    if let Some(source) = source {
        conditions.push(format!("de.dim_source = ?{idx}"));
        params.push(Box::new(source.to_string()));
        idx += 1;
    }
    if let Some(device) = device {
        conditions.push(format!("de.dim_device = ?{idx}"));
        params.push(Box::new(device.to_string()));
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" GROUP BY 1, 2");

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, i64>(5)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (source, device_class, pageviews, visitors, sessions, bounces) = row?;
        out.push(DimRow {
            source,
            device_class,
            bucket: RollupBucket {
                pageviews: pageviews.max(0) as u64,
                visitors: visitors.max(0) as u64,
                sessions: sessions.max(0) as u64,
                bounces: bounces.max(0) as u64,
                conversions: 0,
                revenue: 0.0,
            },
        });
    }
    Ok(out)
}

/// Per-dimension conversion/revenue aggregates over one site-day of
/// attribution records. Dimensions come from the matched session's frozen
/// entry attributes; unmatched ("direct") purchases land in
/// `("direct", "unknown")`.
fn attribution_dim_rows_sync(
    conn: &Connection,
    site_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    source: Option<&str>,
    device: Option<&str>,
) -> Result<Vec<DimRow>> {
    let mut sql = String::from(
        "WITH day_attr AS (
            SELECT a.amount, \
                   COALESCE(NULLIF(s.entry_source, ''), 'direct') AS dim_source, \
                   COALESCE(NULLIF(s.entry_device_class, ''), 'unknown') AS dim_device \
            FROM attribution_records a \
            LEFT JOIN sessions s ON s.session_id = a.matched_session_id \
            WHERE a.site_id = ?1 AND a.purchase_occurred_at >= ?2 AND a.purchase_occurred_at < ?3
        )
        SELECT dim_source, dim_device, COUNT(*) AS conversions, \
               COALESCE(SUM(amount), 0) AS revenue \
        FROM day_attr",
    );
    let mut params: Vec<Box<dyn duckdb::types::ToSql>> = vec![
        Box::new(site_id.to_string()),
        Box::new(fmt_ts(start)),
        Box::new(fmt_ts(end)),
    ];
    let mut conditions: Vec<String> = Vec::new();
    let mut idx = 4;
    if let Some(source) = source {
        conditions.push(format!("dim_source = ?{idx}"));
        params.push(Box::new(source.to_string()));
        idx += 1;
    }
    if let Some(device) = device {
        conditions.push(format!("dim_device = ?{idx}"));
        params.push(Box::new(device.to_string()));
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(" GROUP BY 1, 2");

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt.query_map(param_refs.as_slice(), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, f64>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (source, device_class, conversions, revenue) = row?;
        out.push(DimRow {
            source,
            device_class,
            bucket: RollupBucket {
                conversions: conversions.max(0) as u64,
                revenue,
                ..RollupBucket::default()
            },
        });
    }
    Ok(out)
}
