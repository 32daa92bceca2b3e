//! DuckDB persistence for the Lumetric pipeline: the time-partitioned event
//! store, derived sessions, attribution records, and rollup buckets, plus the
//! durable cursors the background consumers resume from.

pub mod attribution;
pub mod backend;
pub mod cursor;
pub mod events;
pub mod partition;
pub mod rollup;
pub mod schema;
pub mod session;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so consumers (especially tests) can use
/// `lumetric_duckdb::duckdb::params!` without an extra dependency.
pub use duckdb;
