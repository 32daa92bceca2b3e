use thiserror::Error;

/// Storage-layer failure split by retryability: the ingestion buffer retries
/// `Transient` with backoff and spills to dead-letter when exhausted, while
/// `Fatal` goes straight to dead-letter.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("fatal store error: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Client-caused rejection of a single collect item. Never retried, surfaced
/// immediately in the per-item error list of the 400 response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("site_id is required")]
    MissingSiteId,

    #[error("visitor_id is required")]
    MissingVisitorId,

    #[error("unknown event kind: {0}")]
    UnknownKind(String),

    #[error("occurred_at is {0} seconds in the future (max 300)")]
    TimestampInFuture(i64),

    #[error("amount is only valid on purchase events")]
    AmountOnNonPurchase,

    #[error("amount must be a non-negative finite number")]
    InvalidAmount,

    #[error("purchase events require an amount")]
    MissingAmount,

    #[error("goal events require a non-empty goal_name")]
    MissingGoalName,

    #[error("goal_name is only valid on goal events")]
    GoalNameOnNonGoal,

    #[error("url is required")]
    MissingUrl,

    #[error("url exceeds {0} characters")]
    UrlTooLong(usize),

    #[error("referrer exceeds {0} characters")]
    ReferrerTooLong(usize),
}

impl ValidationError {
    /// Stable machine-readable code for the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingSiteId => "missing_site_id",
            ValidationError::MissingVisitorId => "missing_visitor_id",
            ValidationError::UnknownKind(_) => "unknown_kind",
            ValidationError::TimestampInFuture(_) => "timestamp_in_future",
            ValidationError::AmountOnNonPurchase => "amount_on_non_purchase",
            ValidationError::InvalidAmount => "invalid_amount",
            ValidationError::MissingAmount => "missing_amount",
            ValidationError::MissingGoalName => "missing_goal_name",
            ValidationError::GoalNameOnNonGoal => "goal_name_on_non_goal",
            ValidationError::MissingUrl => "missing_url",
            ValidationError::UrlTooLong(_) => "url_too_long",
            ValidationError::ReferrerTooLong(_) => "referrer_too_long",
        }
    }

    /// The payload field the error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::MissingSiteId => "site_id",
            ValidationError::MissingVisitorId => "visitor_id",
            ValidationError::UnknownKind(_) => "kind",
            ValidationError::TimestampInFuture(_) => "occurred_at",
            ValidationError::AmountOnNonPurchase
            | ValidationError::InvalidAmount
            | ValidationError::MissingAmount => "amount",
            ValidationError::MissingGoalName | ValidationError::GoalNameOnNonGoal => "goal_name",
            ValidationError::MissingUrl | ValidationError::UrlTooLong(_) => "url",
            ValidationError::ReferrerTooLong(_) => "referrer",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
