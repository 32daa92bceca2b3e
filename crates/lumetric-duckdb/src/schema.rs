/// DuckDB initialization SQL.
///
/// Executed once at database open time via `Connection::execute_batch`.
/// All statements use `IF NOT EXISTS` so they are safe to re-run on every
/// startup (idempotent).
///
/// Raw events do NOT live in one table: they are written to monthly partition
/// tables (`events_YYYYMM`, see `partition.rs`) created on demand and tracked
/// in the `event_partitions` registry. Retention expiry drops whole partition
/// tables, never individual rows.
///
/// `memory_limit` is passed at runtime from `Config.duckdb_memory_limit`
/// (env `LUMETRIC_DUCKDB_MEMORY`, default `"512MB"`). Always set an explicit
/// limit — the DuckDB default (80% of system RAM) is not acceptable for a
/// server process. `SET threads = 2` keeps the background pool small for
/// single-writer embedded use.
pub fn init_sql(memory_limit: &str) -> String {
    format!(
        r#"SET memory_limit = '{memory_limit}';
SET threads = 2;

-- Monotonic sequences used by the durable consumer cursors: the session
-- aggregator and the rollup materializer tail rows in sequence order.
CREATE SEQUENCE IF NOT EXISTS event_seq;
CREATE SEQUENCE IF NOT EXISTS attribution_seq;

-- ===========================================
-- SETTINGS
-- ===========================================
-- Keys stored in this table:
--   'cursor:session_aggregator'  – last event ingest_seq applied to sessions
--   'cursor:rollup_events'       – last event ingest_seq consumed by rollups
--   'cursor:rollup_attributions' – last attribution attr_seq consumed by rollups
--   'rollup_high_water:<site>'   – latest fully materialized day per site
--   'version'                    – schema version (for migrations)
CREATE TABLE IF NOT EXISTS settings (
    key             VARCHAR PRIMARY KEY,
    value           VARCHAR NOT NULL
);

-- ===========================================
-- SITES (tenant registry, validated on collect)
-- ===========================================
CREATE TABLE IF NOT EXISTS sites (
    id              VARCHAR PRIMARY KEY,
    name            VARCHAR NOT NULL,
    domain          VARCHAR NOT NULL,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- ===========================================
-- EVENT PARTITION REGISTRY
-- ===========================================
-- One row per monthly partition table. [starts_at, ends_at) bounds let scans
-- pick only overlapping partitions and let retention drop whole months.
CREATE TABLE IF NOT EXISTS event_partitions (
    partition_key   VARCHAR PRIMARY KEY,           -- 'YYYYMM'
    table_name      VARCHAR NOT NULL,              -- 'events_YYYYMM'
    starts_at       TIMESTAMP NOT NULL,
    ends_at         TIMESTAMP NOT NULL
);

-- ===========================================
-- SESSIONS (derived by the session aggregator)
-- ===========================================
-- entry_* columns are frozen at insert; ended_at only moves forward.
CREATE TABLE IF NOT EXISTS sessions (
    session_id            VARCHAR PRIMARY KEY,
    site_id               VARCHAR NOT NULL,
    visitor_id            VARCHAR NOT NULL,
    started_at            TIMESTAMP NOT NULL,
    ended_at              TIMESTAMP NOT NULL,
    event_count           INTEGER NOT NULL DEFAULT 1,
    pageview_count        INTEGER NOT NULL DEFAULT 0,
    is_bounce             BOOLEAN NOT NULL DEFAULT FALSE,
    entry_source          VARCHAR,
    entry_medium          VARCHAR,
    entry_campaign        VARCHAR,
    entry_referrer_domain VARCHAR,
    entry_device_class    VARCHAR,
    entry_country         VARCHAR
);
-- Open-session lookup: newest session per (site, visitor).
CREATE INDEX IF NOT EXISTS idx_sessions_site_visitor
    ON sessions(site_id, visitor_id, ended_at DESC);
-- Attribution candidate lookup: sessions by start time.
CREATE INDEX IF NOT EXISTS idx_sessions_site_started
    ON sessions(site_id, started_at DESC, session_id DESC);

-- ===========================================
-- ATTRIBUTION RECORDS
-- ===========================================
-- At most one row per purchase_id (webhook retries are upsert no-ops).
-- purchase_occurred_at is the processor-reported purchase time and is what
-- revenue is bucketed by; attributed_at is when we processed the webhook.
CREATE TABLE IF NOT EXISTS attribution_records (
    purchase_id           VARCHAR PRIMARY KEY,
    attr_seq              BIGINT NOT NULL DEFAULT nextval('attribution_seq'),
    site_id               VARCHAR NOT NULL,
    visitor_identity      VARCHAR NOT NULL,
    matched_session_id    VARCHAR,                 -- NULL = "direct"
    amount                DOUBLE NOT NULL,
    currency              VARCHAR NOT NULL,
    purchase_occurred_at  TIMESTAMP NOT NULL,
    attributed_at         TIMESTAMP NOT NULL,
    lookback_window_days  INTEGER NOT NULL,
    confidence            VARCHAR                  -- 'exact' | 'fingerprint' | NULL
);
CREATE INDEX IF NOT EXISTS idx_attribution_seq
    ON attribution_records(attr_seq);
CREATE INDEX IF NOT EXISTS idx_attribution_site_day
    ON attribution_records(site_id, purchase_occurred_at);

-- ===========================================
-- ROLLUP BUCKETS (pure cache, rebuildable from raw)
-- ===========================================
CREATE TABLE IF NOT EXISTS rollup_buckets (
    site_id         VARCHAR NOT NULL,
    day             DATE NOT NULL,
    source          VARCHAR NOT NULL,              -- 'direct' when absent
    device_class    VARCHAR NOT NULL,              -- 'unknown' when absent
    pageviews       BIGINT NOT NULL DEFAULT 0,
    visitors        BIGINT NOT NULL DEFAULT 0,
    sessions        BIGINT NOT NULL DEFAULT 0,
    bounces         BIGINT NOT NULL DEFAULT 0,
    conversions     BIGINT NOT NULL DEFAULT 0,
    revenue         DOUBLE NOT NULL DEFAULT 0,
    PRIMARY KEY (site_id, day, source, device_class)
);
"#
    )
}

/// Column list shared by every monthly event partition table.
///
/// Kind-dependent payload is flattened for storage: `amount` is non-NULL only
/// for purchase rows, `goal_name` only for goal rows — the tagged
/// [`lumetric_core::event::EventKind`] is reassembled on read.
pub fn partition_table_sql(table_name: &str) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {table_name} (
    ingest_seq      BIGINT NOT NULL DEFAULT nextval('event_seq'),
    event_id        VARCHAR PRIMARY KEY,
    site_id         VARCHAR NOT NULL,
    visitor_id      VARCHAR NOT NULL,
    session_id      VARCHAR NOT NULL DEFAULT '',
    event_kind      VARCHAR NOT NULL,              -- 'pageview' | 'goal' | 'purchase'
    occurred_at     TIMESTAMP NOT NULL,
    url             VARCHAR NOT NULL,
    referrer        VARCHAR,
    referrer_domain VARCHAR,
    utm_source      VARCHAR,
    utm_medium      VARCHAR,
    utm_campaign    VARCHAR,
    device_class    VARCHAR,
    country         VARCHAR(2),
    language        VARCHAR,
    identity        VARCHAR,
    fingerprint     VARCHAR,
    amount          DOUBLE,
    goal_name       VARCHAR
);
CREATE INDEX IF NOT EXISTS idx_{table_name}_scan
    ON {table_name}(site_id, occurred_at, event_id);
CREATE INDEX IF NOT EXISTS idx_{table_name}_seq
    ON {table_name}(ingest_seq);
"#
    )
}
