use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::TrafficAttributes;

/// Default inactivity gap that closes a session.
pub const DEFAULT_SESSION_GAP_MINUTES: u32 = 30;

/// A derived grouping of one visitor's events with no inter-event gap
/// exceeding the inactivity threshold.
///
/// Entry attributes are captured from the session's first event and never
/// rewritten; `ended_at` only moves forward. A session is implicitly closed
/// once the gap has elapsed past `ended_at` — there is no separate state
/// column to keep in sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub site_id: String,
    pub visitor_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub event_count: u32,
    pub pageview_count: u32,
    /// True while the session has exactly one pageview.
    pub is_bounce: bool,
    pub entry_traffic: TrafficAttributes,
    pub entry_referrer_domain: Option<String>,
    pub entry_device_class: Option<String>,
    pub entry_country: Option<String>,
}

/// Compute a deterministic session ID.
///
/// `session_id = sha256(visitor_id + site_id + started_at_ms)[0..8]` as 16 hex
/// chars, so replaying the same event stream reproduces the same ids.
pub fn compute_session_id(visitor_id: &str, site_id: &str, started_at_ms: i64) -> String {
    let input = format!("{}{}{}", visitor_id, site_id, started_at_ms);
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}
