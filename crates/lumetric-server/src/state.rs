use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, warn};

use lumetric_core::attribution::CandidateMatcher;
use lumetric_core::config::Config;
use lumetric_duckdb::attribution::{ExactIdentityMatcher, FingerprintMatcher};
use lumetric_duckdb::DuckDbBackend;

use crate::ingest::IngestBuffer;

/// Shared application state injected into every Axum handler via
/// [`axum::extract::State`].
pub struct AppState {
    pub db: Arc<DuckDbBackend>,
    pub config: Arc<Config>,
    pub buffer: Arc<IngestBuffer>,
    /// Ordered attribution matcher chain, highest confidence first.
    pub matchers: Vec<Box<dyn CandidateMatcher>>,
    /// GeoIP reader, absent when the .mmdb file is missing (events then store
    /// NULL country — non-fatal, warned at startup).
    pub geoip: Option<maxminddb::Reader<Vec<u8>>>,
    /// Fast in-process cache of known-valid `site_id` values. Populated
    /// lazily on first collect per site; never invalidated during a run.
    site_cache: RwLock<HashSet<String>>,
}

impl AppState {
    pub fn new(db: Arc<DuckDbBackend>, config: Config) -> Self {
        let buffer = Arc::new(IngestBuffer::new(
            db.clone(),
            config.shard_capacity,
            config.buffer_max_batch,
            config.flush_max_retries,
            &config.data_dir,
        ));

        let mut matchers: Vec<Box<dyn CandidateMatcher>> =
            vec![Box::new(ExactIdentityMatcher::new(db.clone()))];
        if config.fingerprint_fallback {
            matchers.push(Box::new(FingerprintMatcher::new(db.clone())));
        }

        let geoip = match maxminddb::Reader::open_readfile(&config.geoip_path) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!(
                    geoip_path = %config.geoip_path,
                    error = %e,
                    "GeoIP database unavailable, events will store NULL country"
                );
                None
            }
        };

        Self {
            db,
            config: Arc::new(config),
            buffer,
            matchers,
            geoip,
            site_cache: RwLock::new(HashSet::new()),
        }
    }

    /// Return `true` if the `site_id` is known to exist.
    ///
    /// Checks the in-process cache first; on a cache miss falls back to a
    /// DuckDB query and populates the cache on success.
    pub async fn is_valid_site(&self, site_id: &str) -> bool {
        {
            let cache = self.site_cache.read().await;
            if cache.contains(site_id) {
                return true;
            }
        }

        match self.db.site_exists(site_id).await {
            Ok(true) => {
                let mut cache = self.site_cache.write().await;
                cache.insert(site_id.to_string());
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!(site_id, error = %e, "site_exists lookup failed");
                false
            }
        }
    }
}
