use std::time::Duration;

use crate::validate::clamp_lookback_days;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: String,
    pub geoip_path: String,
    pub cors_origins: Vec<String>,
    /// Monthly event partitions older than this are dropped by retention.
    pub retention_months: u32,
    /// Inactivity gap (minutes) that closes a session.
    pub session_gap_minutes: u32,
    /// Attribution lookback window, clamped to 1–90 days.
    pub lookback_days: u32,
    /// Enable the ip+ua fingerprint fallback matcher (heuristic, off by default).
    pub fingerprint_fallback: bool,
    /// Shared secret for the purchase webhook HMAC signature. Empty disables
    /// the endpoint (requests are rejected).
    pub webhook_secret: String,
    pub buffer_flush_interval_ms: u64,
    /// Flush immediately once this many events are buffered across shards.
    pub buffer_max_batch: usize,
    /// Per-site shard capacity; submits beyond this are rejected as overloaded.
    pub shard_capacity: usize,
    /// Maximum events per collect request.
    pub collect_batch_max: usize,
    pub flush_max_retries: u32,
    pub worker_poll_interval_ms: u64,
    pub duckdb_memory_limit: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            port: std::env::var("LUMETRIC_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|e| format!("invalid port: {e}"))?,
            data_dir: std::env::var("LUMETRIC_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            geoip_path: std::env::var("LUMETRIC_GEOIP_PATH")
                .unwrap_or_else(|_| "./GeoLite2-City.mmdb".to_string()),
            cors_origins: std::env::var("LUMETRIC_CORS_ORIGINS")
                .map(|v| v.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            retention_months: parse_or("LUMETRIC_RETENTION_MONTHS", 13),
            session_gap_minutes: parse_or("LUMETRIC_SESSION_GAP_MINUTES", 30),
            lookback_days: clamp_lookback_days(parse_or("LUMETRIC_LOOKBACK_DAYS", 30)),
            fingerprint_fallback: std::env::var("LUMETRIC_FINGERPRINT_FALLBACK")
                .map(|v| v == "true")
                .unwrap_or(false),
            webhook_secret: std::env::var("LUMETRIC_WEBHOOK_SECRET").unwrap_or_default(),
            buffer_flush_interval_ms: parse_or("LUMETRIC_BUFFER_FLUSH_INTERVAL_MS", 1000),
            buffer_max_batch: parse_or("LUMETRIC_BUFFER_MAX_BATCH", 500),
            shard_capacity: parse_or("LUMETRIC_SHARD_CAPACITY", 10_000),
            collect_batch_max: parse_or("LUMETRIC_COLLECT_BATCH_MAX", 10),
            flush_max_retries: parse_or("LUMETRIC_FLUSH_MAX_RETRIES", 5),
            worker_poll_interval_ms: parse_or("LUMETRIC_WORKER_POLL_INTERVAL_MS", 500),
            duckdb_memory_limit: std::env::var("LUMETRIC_DUCKDB_MEMORY")
                .unwrap_or_else(|_| "512MB".to_string()),
        })
    }

    pub fn buffer_flush_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_flush_interval_ms)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn session_gap(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.session_gap_minutes))
    }
}

fn parse_or<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
