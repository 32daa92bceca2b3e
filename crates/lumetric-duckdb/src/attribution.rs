use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use lumetric_core::attribution::{
    AttributionRecord, CandidateMatcher, MatchConfidence, PurchaseNotification,
};
use lumetric_core::visitor::compute_fingerprint;

use crate::backend::{fmt_ts, parse_ts};
use crate::DuckDbBackend;

/// Exact match on the identity the tracking script recorded alongside prior
/// events (email / customer id). Highest confidence.
pub struct ExactIdentityMatcher {
    db: Arc<DuckDbBackend>,
}

impl ExactIdentityMatcher {
    pub fn new(db: Arc<DuckDbBackend>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CandidateMatcher for ExactIdentityMatcher {
    fn confidence(&self) -> MatchConfidence {
        MatchConfidence::Exact
    }

    async fn resolve(&self, purchase: &PurchaseNotification) -> Result<Vec<String>> {
        self.db
            .identity_visitors(&purchase.site_id, &purchase.visitor_identity)
            .await
    }
}

/// Heuristic fallback: recompute the day-salted ip+ua fingerprint from the
/// client hints some processors forward, and match visitors whose events
/// carry it. Explicitly best-effort; only consulted when the exact matcher
/// comes up empty, and only when enabled in config.
pub struct FingerprintMatcher {
    db: Arc<DuckDbBackend>,
}

impl FingerprintMatcher {
    pub fn new(db: Arc<DuckDbBackend>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CandidateMatcher for FingerprintMatcher {
    fn confidence(&self) -> MatchConfidence {
        MatchConfidence::Fingerprint
    }

    async fn resolve(&self, purchase: &PurchaseNotification) -> Result<Vec<String>> {
        let (Some(ip), Some(ua)) = (&purchase.client_ip, &purchase.user_agent) else {
            return Ok(Vec::new());
        };
        let fingerprint = compute_fingerprint(ip, ua);
        self.db
            .fingerprint_visitors(&purchase.site_id, &fingerprint)
            .await
    }
}

impl DuckDbBackend {
    /// Last-touch attribution for one purchase notification.
    ///
    /// Walks the matcher chain for candidate visitors (first non-empty result
    /// wins; the chain is ordered by descending confidence), collects their
    /// sessions with `started_at <= purchase_time <= started_at + lookback`,
    /// and credits the one with the latest `started_at`. Ties are broken by
    /// the larger `session_id` so repeated runs always pick the same session;
    /// a tie is logged as an ambiguous outcome, not an error. No qualifying
    /// session means the purchase is recorded as "direct"
    /// (`matched_session_id = NULL`) — a deliberate policy, also not an error.
    ///
    /// Idempotent on `purchase_id`: a webhook retry returns the original
    /// record and the `bool` comes back `false`, so nothing is double-counted
    /// downstream (the rollup materializer only ever sees one `attr_seq`).
    pub async fn attribute(
        &self,
        purchase: &PurchaseNotification,
        lookback_days: u32,
        matchers: &[Box<dyn CandidateMatcher>],
    ) -> Result<(AttributionRecord, bool)> {
        if let Some(existing) = self.get_attribution(&purchase.purchase_id).await? {
            return Ok((existing, false));
        }

        let mut candidates: Vec<String> = Vec::new();
        let mut confidence = None;
        for matcher in matchers {
            let resolved = matcher.resolve(purchase).await?;
            if !resolved.is_empty() {
                confidence = Some(matcher.confidence());
                candidates = resolved;
                break;
            }
        }

        let matched_session_id = if candidates.is_empty() {
            None
        } else {
            self.best_session(purchase, lookback_days, &candidates).await?
        };
        let confidence = matched_session_id.as_ref().and(confidence);

        let record = AttributionRecord {
            purchase_id: purchase.purchase_id.clone(),
            site_id: purchase.site_id.clone(),
            visitor_identity: purchase.visitor_identity.clone(),
            matched_session_id,
            amount: purchase.amount,
            currency: purchase.currency.clone(),
            attributed_at: Utc::now(),
            lookback_window_days: lookback_days,
            confidence,
        };

        let inserted = {
            let conn = self.conn.lock().await;
            conn.execute(
                "INSERT INTO attribution_records (
                    purchase_id, site_id, visitor_identity, matched_session_id,
                    amount, currency, purchase_occurred_at, attributed_at,
                    lookback_window_days, confidence
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (purchase_id) DO NOTHING",
                duckdb::params![
                    record.purchase_id,
                    record.site_id,
                    record.visitor_identity,
                    record.matched_session_id,
                    record.amount,
                    record.currency,
                    fmt_ts(purchase.occurred_at),
                    fmt_ts(record.attributed_at),
                    record.lookback_window_days as i64,
                    record.confidence.map(|c| c.as_str()),
                ],
            )?
        };

        if inserted == 0 {
            // Lost a race with a concurrent delivery of the same purchase_id;
            // the stored record is the truth.
            let existing = self
                .get_attribution(&purchase.purchase_id)
                .await?
                .unwrap_or(record);
            return Ok((existing, false));
        }

        info!(
            purchase_id = %record.purchase_id,
            matched = record.matched_session_id.as_deref().unwrap_or("direct"),
            "purchase attributed"
        );
        Ok((record, true))
    }

    /// Latest-started qualifying session among the candidate visitors.
    async fn best_session(
        &self,
        purchase: &PurchaseNotification,
        lookback_days: u32,
        candidates: &[String],
    ) -> Result<Option<String>> {
        let earliest_start = purchase.occurred_at - Duration::days(i64::from(lookback_days));
        let conn = self.conn.lock().await;

        let placeholders: Vec<String> = (0..candidates.len())
            .map(|i| format!("?{}", i + 4))
            .collect();
        let sql = format!(
            "SELECT session_id, CAST(started_at AS VARCHAR) FROM sessions \
             WHERE site_id = ?1 AND started_at <= ?2 AND started_at >= ?3 \
               AND visitor_id IN ({}) \
             ORDER BY started_at DESC, session_id DESC LIMIT 5",
            placeholders.join(", ")
        );

        let mut params: Vec<Box<dyn duckdb::types::ToSql>> = vec![
            Box::new(purchase.site_id.clone()),
            Box::new(fmt_ts(purchase.occurred_at)),
            Box::new(fmt_ts(earliest_start)),
        ];
        for candidate in candidates {
            params.push(Box::new(candidate.clone()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn duckdb::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut top: Vec<(String, chrono::DateTime<Utc>)> = Vec::new();
        for row in rows {
            let (session_id, started_raw) = row?;
            top.push((session_id, parse_ts(&started_raw)?));
        }

        let Some((best_id, best_started)) = top.first().cloned() else {
            return Ok(None);
        };
        let ties = top.iter().filter(|(_, s)| *s == best_started).count();
        if ties > 1 {
            warn!(
                purchase_id = %purchase.purchase_id,
                tied_sessions = ties,
                winner = %best_id,
                "ambiguous attribution resolved by session_id tie-break"
            );
        }
        Ok(Some(best_id))
    }

    pub async fn get_attribution(&self, purchase_id: &str) -> Result<Option<AttributionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT purchase_id, site_id, visitor_identity, matched_session_id, \
                    amount, currency, CAST(attributed_at AS VARCHAR), \
                    lookback_window_days, confidence \
             FROM attribution_records WHERE purchase_id = ?1",
        )?;
        type Raw = (
            String,
            String,
            String,
            Option<String>,
            f64,
            String,
            String,
            i64,
            Option<String>,
        );
        let raw: Option<Raw> = stmt
            .query_row(duckdb::params![purchase_id], |row| {
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
                ))
            })
            .ok();

        raw.map(
            |(
                purchase_id,
                site_id,
                visitor_identity,
                matched_session_id,
                amount,
                currency,
                attributed_raw,
                lookback,
                confidence_raw,
            )| {
                Ok(AttributionRecord {
                    purchase_id,
                    site_id,
                    visitor_identity,
                    matched_session_id,
                    amount,
                    currency,
                    attributed_at: parse_ts(&attributed_raw)?,
                    lookback_window_days: lookback.max(0) as u32,
                    confidence: match confidence_raw.as_deref() {
                        Some("exact") => Some(MatchConfidence::Exact),
                        Some("fingerprint") => Some(MatchConfidence::Fingerprint),
                        _ => None,
                    },
                })
            },
        )
        .transpose()
    }
}
