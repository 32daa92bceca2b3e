use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The payment processor's webhook payload, consumed at the boundary only.
///
/// `client_ip` / `user_agent` are optional hints some processors forward from
/// the checkout page; when present and the fallback matcher is enabled they
/// feed the fingerprint strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseNotification {
    pub purchase_id: String,
    pub site_id: String,
    pub visitor_identity: String,
    pub amount: f64,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// How confident a matcher chain result is. Ordered: exact identity matches
/// always beat fingerprint heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    Fingerprint,
    Exact,
}

impl MatchConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchConfidence::Exact => "exact",
            MatchConfidence::Fingerprint => "fingerprint",
        }
    }
}

/// Links a purchase notification to the session that produced it.
///
/// `matched_session_id = None` means the purchase fell back to "direct":
/// either the identity matched no visitor or no session qualified inside the
/// lookback window. At most one record exists per `purchase_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionRecord {
    pub purchase_id: String,
    pub site_id: String,
    pub visitor_identity: String,
    pub matched_session_id: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub attributed_at: DateTime<Utc>,
    pub lookback_window_days: u32,
    pub confidence: Option<MatchConfidence>,
}

/// One strategy for resolving an external identity to candidate visitor ids.
///
/// The attribution engine walks an ordered chain of these and keeps the first
/// non-empty result, so strategies can be added or removed without touching
/// the core last-touch selection.
#[async_trait]
pub trait CandidateMatcher: Send + Sync {
    fn confidence(&self) -> MatchConfidence;

    async fn resolve(&self, purchase: &PurchaseNotification) -> Result<Vec<String>>;
}
