use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Placeholder dimension values for events that carry no source / no parsed
/// device class, so every event lands in exactly one bucket.
pub const DIRECT_SOURCE: &str = "direct";
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Addressing key for one pre-aggregated bucket: site × day × traffic source ×
/// device class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    pub site_id: String,
    pub day: NaiveDate,
    pub source: String,
    pub device_class: String,
}

/// Incrementally maintained aggregates for one bucket key.
///
/// A bucket is a cache, never a source of truth: deleting it and rebuilding
/// from the raw event/attribution rows of its day must reproduce it exactly
/// (floating-point tolerance on `revenue`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    pub pageviews: u64,
    pub visitors: u64,
    pub sessions: u64,
    pub bounces: u64,
    pub conversions: u64,
    pub revenue: f64,
}

impl RollupBucket {
    pub fn bounce_rate(&self) -> f64 {
        if self.sessions == 0 {
            0.0
        } else {
            self.bounces as f64 / self.sessions as f64
        }
    }

    pub fn conversion_rate(&self) -> f64 {
        if self.visitors == 0 {
            0.0
        } else {
            self.conversions as f64 / self.visitors as f64
        }
    }

    pub fn merge(&mut self, other: &RollupBucket) {
        self.pageviews += other.pageviews;
        self.visitors += other.visitors;
        self.sessions += other.sessions;
        self.bounces += other.bounces;
        self.conversions += other.conversions;
        self.revenue += other.revenue;
    }
}

/// One day of a stats response, already collapsed across the dimension
/// filters the caller applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayStat {
    pub day: NaiveDate,
    #[serde(flatten)]
    pub bucket: RollupBucket,
}

/// Range-query result served rollup-first: days at or below the site's
/// materialized high-water mark come from buckets, later days from a raw
/// scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub totals: RollupBucket,
    pub days: Vec<DayStat>,
}
