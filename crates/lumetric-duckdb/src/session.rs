use anyhow::Result;
use chrono::Duration;
use duckdb::Connection;
use tracing::debug;

use lumetric_core::event::Event;
use lumetric_core::session::{compute_session_id, Session};

use crate::backend::{fmt_ts, parse_ts};
use crate::cursor::SESSION_AGGREGATOR_CURSOR;
use crate::DuckDbBackend;

struct OpenSessionRow {
    session_id: String,
    started_at: chrono::DateTime<chrono::Utc>,
    ended_at: chrono::DateTime<chrono::Utc>,
    event_count: i64,
    pageview_count: i64,
}

impl DuckDbBackend {
    /// Run one batch of the session aggregator: tail newly appended events
    /// from the durable cursor and fold them into sessions.
    ///
    /// Events are applied per visitor in `(occurred_at, event_id)` order —
    /// the ordering the state machine requires — while different visitors may
    /// interleave freely. Each event is claimed by stamping its `session_id`
    /// onto the stored row; a redelivered event (cursor replay after a crash)
    /// finds itself already stamped and is skipped, so counts never drift.
    ///
    /// Returns the number of events consumed.
    pub async fn run_session_aggregation_once(
        &self,
        gap: Duration,
        batch_limit: usize,
    ) -> Result<usize> {
        let cursor = self.get_cursor(SESSION_AGGREGATOR_CURSOR).await?;
        let mut batch = self.tail_events(cursor, batch_limit).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let max_seq = batch.iter().map(|(seq, _)| *seq).max().unwrap_or(cursor);

        batch.sort_by(|(_, a), (_, b)| {
            (&a.visitor_id, a.occurred_at, &a.event_id).cmp(&(
                &b.visitor_id,
                b.occurred_at,
                &b.event_id,
            ))
        });

        {
            let mut conn = self.conn.lock().await;
            let tx = conn.transaction()?;
            for (_, event) in &batch {
                apply_event_sync(&tx, event, gap)?;
            }
            tx.commit()?;
        }

        // Advanced only after the batch committed; a crash in between replays
        // the batch and the stamp guard absorbs it.
        self.set_cursor(SESSION_AGGREGATOR_CURSOR, max_seq).await?;
        Ok(batch.len())
    }

    /// Fetch one session by id (query/test helper).
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?1"
        ))?;
        let row = stmt
            .query_row(duckdb::params![session_id], read_session_row)
            .ok();
        row.map(finish_session).transpose()
    }

    /// All sessions for a visitor, oldest first.
    pub async fn sessions_for_visitor(
        &self,
        site_id: &str,
        visitor_id: &str,
    ) -> Result<Vec<Session>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE site_id = ?1 AND visitor_id = ?2 ORDER BY started_at"
        ))?;
        let rows = stmt.query_map(duckdb::params![site_id, visitor_id], read_session_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(finish_session(row?)?);
        }
        Ok(sessions)
    }
}

const SESSION_COLUMNS: &str = "session_id, site_id, visitor_id, \
     CAST(started_at AS VARCHAR), CAST(ended_at AS VARCHAR), \
     event_count, pageview_count, is_bounce, \
     entry_source, entry_medium, entry_campaign, \
     entry_referrer_domain, entry_device_class, entry_country";

type RawSessionRow = (
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    bool,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn read_session_row(row: &duckdb::Row<'_>) -> duckdb::Result<RawSessionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn finish_session(raw: RawSessionRow) -> Result<Session> {
    let (
        session_id,
        site_id,
        visitor_id,
        started_raw,
        ended_raw,
        event_count,
        pageview_count,
        is_bounce,
        entry_source,
        entry_medium,
        entry_campaign,
        entry_referrer_domain,
        entry_device_class,
        entry_country,
    ) = raw;
    Ok(Session {
        session_id,
        site_id,
        visitor_id,
        started_at: parse_ts(&started_raw)?,
        ended_at: parse_ts(&ended_raw)?,
        event_count: event_count.max(0) as u32,
        pageview_count: pageview_count.max(0) as u32,
        is_bounce,
        entry_traffic: lumetric_core::event::TrafficAttributes {
            source: entry_source,
            medium: entry_medium,
            campaign: entry_campaign,
        },
        entry_referrer_domain,
        entry_device_class,
        entry_country,
    })
}

/// The per-visitor state machine: NoSession → Open → Closed.
///
/// An Open session absorbs the event when it falls within the inactivity gap
/// of the session's span; otherwise the old session is left behind (Closed is
/// implicit — nothing reopens it once the gap has passed) and a new one is
/// created with entry attributes frozen from this event.
fn apply_event_sync(conn: &Connection, event: &Event, gap: Duration) -> Result<()> {
    let open = latest_session_sync(conn, &event.site_id, &event.visitor_id)?;

    let belongs_to_open = open.as_ref().is_some_and(|s| {
        event.occurred_at - s.ended_at <= gap && s.started_at - event.occurred_at <= gap
    });

    if let Some(session) = open.filter(|_| belongs_to_open) {
        if !DuckDbBackend::stamp_session_sync(
            conn,
            event.occurred_at,
            &event.event_id,
            &session.session_id,
        )? {
            return Ok(()); // redelivered, already folded in
        }
        let is_pageview = event.kind.as_str() == "pageview";
        let pageview_count = session.pageview_count + i64::from(is_pageview);
        let ended_at = session.ended_at.max(event.occurred_at);
        conn.execute(
            "UPDATE sessions SET ended_at = ?1, event_count = ?2, pageview_count = ?3, \
             is_bounce = ?4 WHERE session_id = ?5",
            duckdb::params![
                fmt_ts(ended_at),
                session.event_count + 1,
                pageview_count,
                pageview_count == 1,
                session.session_id
            ],
        )?;
        return Ok(());
    }

    let session_id = compute_session_id(
        &event.visitor_id,
        &event.site_id,
        event.occurred_at.timestamp_millis(),
    );
    if !DuckDbBackend::stamp_session_sync(conn, event.occurred_at, &event.event_id, &session_id)? {
        return Ok(());
    }
    let is_pageview = event.kind.as_str() == "pageview";
    debug!(
        visitor_id = %event.visitor_id,
        session_id = %session_id,
        "opening new session"
    );
    conn.execute(
        "INSERT INTO sessions (
            session_id, site_id, visitor_id, started_at, ended_at,
            event_count, pageview_count, is_bounce,
            entry_source, entry_medium, entry_campaign,
            entry_referrer_domain, entry_device_class, entry_country
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT (session_id) DO NOTHING",
        duckdb::params![
            session_id,
            event.site_id,
            event.visitor_id,
            fmt_ts(event.occurred_at),
            fmt_ts(event.occurred_at),
            1_i64,
            i64::from(is_pageview),
            is_pageview, // a single pageview is a bounce until a second one lands
            event.traffic.source,
            event.traffic.medium,
            event.traffic.campaign,
            event.referrer_domain,
            event.device_class,
            event.country,
        ],
    )?;
    Ok(())
}

fn latest_session_sync(
    conn: &Connection,
    site_id: &str,
    visitor_id: &str,
) -> Result<Option<OpenSessionRow>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, CAST(started_at AS VARCHAR), CAST(ended_at AS VARCHAR), \
                event_count, pageview_count \
         FROM sessions WHERE site_id = ?1 AND visitor_id = ?2 \
         ORDER BY ended_at DESC LIMIT 1",
    )?;
    let raw: Option<(String, String, String, i64, i64)> = stmt
        .query_row(duckdb::params![site_id, visitor_id], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })
        .ok();

    raw.map(|(session_id, started_raw, ended_raw, event_count, pageview_count)| {
        Ok(OpenSessionRow {
            session_id,
            started_at: parse_ts(&started_raw)?,
            ended_at: parse_ts(&ended_raw)?,
            event_count,
            pageview_count,
        })
    })
    .transpose()
}
