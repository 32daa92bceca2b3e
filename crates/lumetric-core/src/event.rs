use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// UTM-style traffic attributes attached to an event (and frozen onto the
/// session that the event opens).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficAttributes {
    pub source: Option<String>,
    pub medium: Option<String>,
    pub campaign: Option<String>,
}

impl TrafficAttributes {
    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.medium.is_none() && self.campaign.is_none()
    }
}

/// What kind of event was observed, with the kind-specific payload carried in
/// the variant. A pageview cannot carry an amount and a purchase cannot lose
/// one, so the illegal field combinations never exist past validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Pageview,
    Goal { goal_name: String },
    Purchase { amount: f64 },
}

impl EventKind {
    /// Stable discriminant string used for storage and rollup grouping.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Pageview => "pageview",
            EventKind::Goal { .. } => "goal",
            EventKind::Purchase { .. } => "purchase",
        }
    }

    pub fn amount(&self) -> Option<f64> {
        match self {
            EventKind::Purchase { amount } => Some(*amount),
            _ => None,
        }
    }

    pub fn goal_name(&self) -> Option<&str> {
        match self {
            EventKind::Goal { goal_name } => Some(goal_name),
            _ => None,
        }
    }
}

/// The payload the tracking script sends to POST /api/collect.
///
/// `kind` is the wire discriminant ("pageview" | "goal" | "purchase");
/// `goal_name` and `amount` are kind-dependent and checked by the validator,
/// which folds them into [`EventKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectPayload {
    pub site_id: String,
    /// Stable pseudonymous id minted by the script and kept in localStorage.
    pub visitor_id: String,
    pub kind: String,
    /// Client-side event time, UTC. Bounded by the validator's clock-skew
    /// tolerance; missing means "use server receive time".
    pub occurred_at: Option<DateTime<Utc>>,
    pub url: String,
    pub referrer: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub goal_name: Option<String>,
    pub amount: Option<f64>,
    /// External identity (email / customer id) the site chose to record, used
    /// later as the attribution matching key.
    pub identity: Option<String>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    pub language: Option<String>,
}

/// Accepts either a single event or a batch array at POST /api/collect.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CollectOrBatch {
    Single(Box<CollectPayload>),
    Batch(Vec<CollectPayload>),
}

/// The enriched, stored version of an event — one row in a monthly event
/// partition. Append-only: never updated after the session aggregator has
/// stamped `session_id`, and deleted only by partition expiry or erasure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub site_id: String,
    pub visitor_id: String,
    /// Empty until the session aggregator assigns the event to a session.
    pub session_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub url: String,
    pub referrer: Option<String>,
    pub referrer_domain: Option<String>,
    pub traffic: TrafficAttributes,
    pub device_class: Option<String>,
    pub country: Option<String>,
    pub language: Option<String>,
    pub identity: Option<String>,
    /// Day-salted ip+ua hash, kept only as the low-confidence attribution
    /// fallback key.
    pub fingerprint: Option<String>,
}
