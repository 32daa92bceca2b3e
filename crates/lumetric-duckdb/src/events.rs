use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lumetric_core::error::StoreError;
use lumetric_core::event::{Event, EventKind, TrafficAttributes};
use lumetric_core::sink::EventSink;

use crate::backend::{fmt_ts, parse_ts};
use crate::partition::{ensure_partition_sync, list_partitions_sync, partitions_overlapping_sync, table_name_for};
use crate::DuckDbBackend;

/// Keyset resumption cursor for [`DuckDbBackend::scan_events`]: position of
/// the last row already returned, in `(occurred_at, event_id)` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub occurred_at: DateTime<Utc>,
    pub event_id: String,
}

/// One page of a restartable range scan.
#[derive(Debug, Clone)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Present when the page filled up; pass back to resume.
    pub next_cursor: Option<ScanCursor>,
}

/// Optional predicate applied inside a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub kind: Option<String>,
    pub source: Option<String>,
    pub device_class: Option<String>,
}

/// Counts returned by a synchronous visitor erasure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErasureReport {
    pub events_deleted: usize,
    pub sessions_deleted: usize,
    pub attributions_deleted: usize,
}

const EVENT_COLUMNS: &str = "event_id, site_id, visitor_id, session_id, event_kind, \
     CAST(occurred_at AS VARCHAR), url, referrer, referrer_domain, \
     utm_source, utm_medium, utm_campaign, device_class, country, language, \
     identity, fingerprint, amount, goal_name";

/// `(SELECT * FROM a UNION ALL SELECT * FROM b ...)` over partition tables.
/// Callers must pass at least one table.
fn union_all(tables: &[String]) -> String {
    let selects: Vec<String> = tables
        .iter()
        .map(|t| format!("SELECT * FROM {t}"))
        .collect();
    format!("({})", selects.join(" UNION ALL "))
}

/// Read the flattened event columns starting at `base`.
///
/// The raw kind/timestamp strings are returned alongside the partially-built
/// [`Event`] because `duckdb::Result` cannot carry a chrono parse error;
/// [`finish_event`] completes the conversion.
fn read_event_row(
    row: &duckdb::Row<'_>,
    base: usize,
) -> duckdb::Result<(Event, String, String, Option<f64>, Option<String>)> {
    let event = Event {
        event_id: row.get(base)?,
        site_id: row.get(base + 1)?,
        visitor_id: row.get(base + 2)?,
        session_id: row.get(base + 3)?,
        kind: EventKind::Pageview,
        occurred_at: Utc::now(),
        url: row.get(base + 6)?,
        referrer: row.get(base + 7)?,
        referrer_domain: row.get(base + 8)?,
        traffic: TrafficAttributes {
            source: row.get(base + 9)?,
            medium: row.get(base + 10)?,
            campaign: row.get(base + 11)?,
        },
        device_class: row.get(base + 12)?,
        country: row.get(base + 13)?,
        language: row.get(base + 14)?,
        identity: row.get(base + 15)?,
        fingerprint: row.get(base + 16)?,
    };
    let kind_raw: String = row.get(base + 4)?;
    let occurred_raw: String = row.get(base + 5)?;
    let amount: Option<f64> = row.get(base + 17)?;
    let goal_name: Option<String> = row.get(base + 18)?;
    Ok((event, kind_raw, occurred_raw, amount, goal_name))
}

/// Reassemble the tagged kind and parsed timestamp from the flattened columns.
fn finish_event(
    mut event: Event,
    kind_raw: String,
    occurred_raw: String,
    amount: Option<f64>,
    goal_name: Option<String>,
) -> Result<Event> {
    event.occurred_at = parse_ts(&occurred_raw)?;
    event.kind = match kind_raw.as_str() {
        "pageview" => EventKind::Pageview,
        "goal" => EventKind::Goal {
            goal_name: goal_name.unwrap_or_default(),
        },
        "purchase" => EventKind::Purchase {
            amount: amount.unwrap_or(0.0),
        },
        other => return Err(anyhow!("unknown stored event_kind {other:?}")),
    };
    Ok(event)
}

impl DuckDbBackend {
    /// Append a batch of events, grouped by monthly partition.
    ///
    /// Idempotent on `event_id` within a partition: re-appending an existing
    /// id is a no-op, not an error. This is what makes the ingestion buffer's
    /// at-least-once redelivery (and dead-letter replay) safe.
    pub async fn append_events(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;

        // Partition tables must exist before the transaction writes into them.
        for event in events {
            ensure_partition_sync(&conn, event.occurred_at)?;
        }

        // One transaction per batch: atomic, and one fsync instead of N.
        let tx = conn.transaction()?;
        for event in events {
            let table = table_name_for(event.occurred_at);
            tx.execute(
                &format!(
                    "INSERT INTO {table} (
                        event_id, site_id, visitor_id, session_id, event_kind,
                        occurred_at, url, referrer, referrer_domain,
                        utm_source, utm_medium, utm_campaign,
                        device_class, country, language,
                        identity, fingerprint, amount, goal_name
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                    ON CONFLICT (event_id) DO NOTHING"
                ),
                duckdb::params![
                    event.event_id,
                    event.site_id,
                    event.visitor_id,
                    event.session_id,
                    event.kind.as_str(),
                    fmt_ts(event.occurred_at),
                    event.url,
                    event.referrer,
                    event.referrer_domain,
                    event.traffic.source,
                    event.traffic.medium,
                    event.traffic.campaign,
                    event.device_class,
                    event.country,
                    event.language,
                    event.identity,
                    event.fingerprint,
                    event.kind.amount(),
                    event.kind.goal_name(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Restartable, time-ordered range scan for one site.
    ///
    /// Rows come back in `(occurred_at, event_id)` order; `cursor` resumes
    /// strictly after the given position. Keyset pagination, no OFFSET.
    pub async fn scan_events(
        &self,
        site_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &ScanFilter,
        cursor: Option<&ScanCursor>,
        limit: usize,
    ) -> Result<EventPage> {
        let conn = self.conn.lock().await;
        let tables = partitions_overlapping_sync(&conn, start, end)?;
        if tables.is_empty() {
            return Ok(EventPage {
                events: Vec::new(),
                next_cursor: None,
            });
        }

        let mut sql = format!(
            "SELECT {EVENT_COLUMNS} FROM {} e \
             WHERE e.site_id = ?1 AND e.occurred_at >= ?2 AND e.occurred_at < ?3",
            union_all(&tables)
        );
        let mut params: Vec<Box<dyn duckdb::types::ToSql>> = vec![
            Box::new(site_id.to_string()),
            Box::new(fmt_ts(start)),
            Box::new(fmt_ts(end)),
        ];
        let mut idx = 4;

        if let Some(cursor) = cursor {
            sql.push_str(&format!(
                " AND (e.occurred_at > ?{} OR (e.occurred_at = ?{} AND e.event_id > ?{}))",
                idx,
                idx + 1,
                idx + 2
            ));
            let pos = fmt_ts(cursor.occurred_at);
            params.push(Box::new(pos.clone()));
            params.push(Box::new(pos));
            params.push(Box::new(cursor.event_id.clone()));
            idx += 3;
        }
        if let Some(kind) = &filter.kind {
            sql.push_str(&format!(" AND e.event_kind = ?{idx}"));
            params.push(Box::new(kind.clone()));
            idx += 1;
        }
        if let Some(source) = &filter.source {
            sql.push_str(&format!(" AND e.utm_source = ?{idx}"));
            params.push(Box::new(source.clone()));
            idx += 1;
        }
        if let Some(device) = &filter.device_class {
            sql.push_str(&format!(" AND e.device_class = ?{idx}"));
            params.push(Box::new(device.clone()));
        }
        sql.push_str(&format!(
            " ORDER BY e.occurred_at, e.event_id LIMIT {}",
            limit.max(1)
        ));

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn duckdb::types::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| read_event_row(row, 0))?;

        let mut events = Vec::new();
        for row in rows {
            let (event, kind_raw, occurred_raw, amount, goal_name) = row?;
            events.push(finish_event(event, kind_raw, occurred_raw, amount, goal_name)?);
        }

        let next_cursor = if events.len() >= limit.max(1) {
            events.last().map(|e| ScanCursor {
                occurred_at: e.occurred_at,
                event_id: e.event_id.clone(),
            })
        } else {
            None
        };

        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    /// Tail events across all partitions in ingest order, strictly after
    /// `after_seq`. This is the durable-cursor feed for the background
    /// consumers (session aggregator, rollup materializer).
    pub async fn tail_events(&self, after_seq: i64, limit: usize) -> Result<Vec<(i64, Event)>> {
        let conn = self.conn.lock().await;
        let tables: Vec<String> = list_partitions_sync(&conn)?
            .into_iter()
            .map(|p| p.table_name)
            .collect();
        if tables.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT ingest_seq, {EVENT_COLUMNS} FROM {} e \
             WHERE e.ingest_seq > ?1 ORDER BY e.ingest_seq LIMIT {}",
            union_all(&tables),
            limit.max(1)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(duckdb::params![after_seq], |row| {
            let seq: i64 = row.get(0)?;
            let mapped = read_event_row(row, 1)?;
            Ok((seq, mapped))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, (event, kind_raw, occurred_raw, amount, goal_name)) = row?;
            out.push((
                seq,
                finish_event(event, kind_raw, occurred_raw, amount, goal_name)?,
            ));
        }
        Ok(out)
    }

    /// Distinct visitor ids that ever recorded `identity` on this site.
    /// Data path for the exact-identity attribution matcher.
    pub async fn identity_visitors(&self, site_id: &str, identity: &str) -> Result<Vec<String>> {
        self.distinct_visitors_where(site_id, "identity", identity).await
    }

    /// Distinct visitor ids whose events carry `fingerprint`. Data path for
    /// the heuristic fallback matcher.
    pub async fn fingerprint_visitors(
        &self,
        site_id: &str,
        fingerprint: &str,
    ) -> Result<Vec<String>> {
        self.distinct_visitors_where(site_id, "fingerprint", fingerprint)
            .await
    }

    async fn distinct_visitors_where(
        &self,
        site_id: &str,
        column: &str,
        value: &str,
    ) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let tables: Vec<String> = list_partitions_sync(&conn)?
            .into_iter()
            .map(|p| p.table_name)
            .collect();
        if tables.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT DISTINCT e.visitor_id FROM {} e WHERE e.site_id = ?1 AND e.{column} = ?2 \
             ORDER BY e.visitor_id",
            union_all(&tables)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(duckdb::params![site_id, value], |row| row.get::<_, String>(0))?;
        let mut visitors = Vec::new();
        for row in rows {
            visitors.push(row?);
        }
        Ok(visitors)
    }

    /// Synchronous right-to-erasure cascade for one visitor.
    ///
    /// Deletes the visitor's event rows in every partition, their sessions,
    /// and any attribution records matched to those sessions, then returns the
    /// per-table counts. The caller gets an acknowledgement only after every
    /// delete has executed.
    pub async fn erase_visitor(&self, site_id: &str, visitor_id: &str) -> Result<ErasureReport> {
        let mut conn = self.conn.lock().await;
        let tables: Vec<String> = list_partitions_sync(&conn)?
            .into_iter()
            .map(|p| p.table_name)
            .collect();

        let tx = conn.transaction()?;
        let mut report = ErasureReport::default();

        for table in &tables {
            report.events_deleted += tx.execute(
                &format!("DELETE FROM {table} WHERE site_id = ?1 AND visitor_id = ?2"),
                duckdb::params![site_id, visitor_id],
            )?;
        }

        report.attributions_deleted = tx.execute(
            "DELETE FROM attribution_records WHERE site_id = ?1 AND matched_session_id IN \
             (SELECT session_id FROM sessions WHERE site_id = ?1 AND visitor_id = ?2)",
            duckdb::params![site_id, visitor_id],
        )?;

        report.sessions_deleted = tx.execute(
            "DELETE FROM sessions WHERE site_id = ?1 AND visitor_id = ?2",
            duckdb::params![site_id, visitor_id],
        )?;

        tx.commit()?;
        info!(
            site_id,
            visitor_id,
            events = report.events_deleted,
            sessions = report.sessions_deleted,
            attributions = report.attributions_deleted,
            "Visitor erased"
        );
        Ok(report)
    }

    /// Expose the partition-backed idempotent append to stamping queries.
    pub(crate) fn stamp_session_sync(
        conn: &Connection,
        occurred_at: DateTime<Utc>,
        event_id: &str,
        session_id: &str,
    ) -> Result<bool> {
        let table = table_name_for(occurred_at);
        let changed = conn.execute(
            &format!(
                "UPDATE {table} SET session_id = ?1 WHERE event_id = ?2 AND session_id = ''"
            ),
            duckdb::params![session_id, event_id],
        )?;
        if changed == 0 {
            warn!(event_id, "event already assigned to a session, skipping");
        }
        Ok(changed > 0)
    }
}

#[async_trait]
impl EventSink for DuckDbBackend {
    async fn append(&self, batch: &[Event]) -> Result<(), StoreError> {
        // DuckDB failures here are infrastructure hiccups (lock contention,
        // disk) — classify transient so the buffer retries then spills.
        self.append_events(batch)
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))
    }
}
