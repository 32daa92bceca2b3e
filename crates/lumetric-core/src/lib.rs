//! Domain types and pure logic for the Lumetric event-ingestion and
//! revenue-attribution pipeline: event schema + validation, session and
//! attribution models, rollup bucket types, configuration, and the error
//! taxonomy shared across crates.

pub mod attribution;
pub mod config;
pub mod error;
pub mod event;
pub mod rollup;
pub mod session;
pub mod sink;
pub mod validate;
pub mod visitor;
