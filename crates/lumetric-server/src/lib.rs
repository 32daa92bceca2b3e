//! HTTP surface and background workers for the Lumetric analytics pipeline:
//! event collection, purchase attribution webhook, rollup-backed stats
//! queries, and retention/erasure endpoints.

pub mod app;
pub mod enrich;
pub mod error;
pub mod ingest;
pub mod routes;
pub mod state;
pub mod workers;
