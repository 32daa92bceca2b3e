use chrono::{DateTime, Duration, Utc};

use crate::error::ValidationError;
use crate::event::{CollectPayload, EventKind, TrafficAttributes};

/// Maximum tolerated client clock skew into the future.
pub const CLOCK_SKEW_TOLERANCE_SECS: i64 = 300;
/// Free-text length caps. Anything longer is client abuse, not analytics.
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_REFERRER_LEN: usize = 2048;

/// A payload that passed validation, with the kind-dependent fields folded
/// into [`EventKind`]. Enrichment (geo, device class, fingerprint) happens in
/// the collect handler; this stays a pure function of its inputs.
#[derive(Debug, Clone)]
pub struct ValidEvent {
    pub site_id: String,
    pub visitor_id: String,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub url: String,
    pub referrer: Option<String>,
    pub traffic: TrafficAttributes,
    pub identity: Option<String>,
    pub language: Option<String>,
}

/// Validate one collect payload against the canonical event shape.
///
/// Pure: `received_at` is passed in so the clock-skew check is deterministic
/// under test. One bad item must never stall the rest of its batch, so the
/// caller validates items independently and reports per-item errors.
pub fn validate(
    payload: &CollectPayload,
    received_at: DateTime<Utc>,
) -> Result<ValidEvent, ValidationError> {
    if payload.site_id.trim().is_empty() {
        return Err(ValidationError::MissingSiteId);
    }
    if payload.visitor_id.trim().is_empty() {
        return Err(ValidationError::MissingVisitorId);
    }
    if payload.url.trim().is_empty() {
        return Err(ValidationError::MissingUrl);
    }
    if payload.url.len() > MAX_URL_LEN {
        return Err(ValidationError::UrlTooLong(MAX_URL_LEN));
    }
    if let Some(referrer) = &payload.referrer {
        if referrer.len() > MAX_REFERRER_LEN {
            return Err(ValidationError::ReferrerTooLong(MAX_REFERRER_LEN));
        }
    }

    let occurred_at = payload.occurred_at.unwrap_or(received_at);
    let skew = (occurred_at - received_at).num_seconds();
    if skew > CLOCK_SKEW_TOLERANCE_SECS {
        return Err(ValidationError::TimestampInFuture(skew));
    }

    let kind = match payload.kind.as_str() {
        "pageview" => {
            if payload.amount.is_some() {
                return Err(ValidationError::AmountOnNonPurchase);
            }
            if payload.goal_name.is_some() {
                return Err(ValidationError::GoalNameOnNonGoal);
            }
            EventKind::Pageview
        }
        "goal" => {
            if payload.amount.is_some() {
                return Err(ValidationError::AmountOnNonPurchase);
            }
            let goal_name = payload
                .goal_name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or(ValidationError::MissingGoalName)?;
            EventKind::Goal {
                goal_name: goal_name.to_string(),
            }
        }
        "purchase" => {
            if payload.goal_name.is_some() {
                return Err(ValidationError::GoalNameOnNonGoal);
            }
            let amount = payload.amount.ok_or(ValidationError::MissingAmount)?;
            if !amount.is_finite() || amount < 0.0 {
                return Err(ValidationError::InvalidAmount);
            }
            EventKind::Purchase { amount }
        }
        other => return Err(ValidationError::UnknownKind(other.to_string())),
    };

    Ok(ValidEvent {
        site_id: payload.site_id.trim().to_string(),
        visitor_id: payload.visitor_id.trim().to_string(),
        kind,
        occurred_at,
        url: payload.url.clone(),
        referrer: payload.referrer.clone(),
        traffic: TrafficAttributes {
            source: non_empty(&payload.utm_source),
            medium: non_empty(&payload.utm_medium),
            campaign: non_empty(&payload.utm_campaign),
        },
        identity: non_empty(&payload.identity),
        language: non_empty(&payload.language),
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Clamp a configured lookback window into the supported 1–90 day range.
pub fn clamp_lookback_days(days: u32) -> u32 {
    days.clamp(1, 90)
}
