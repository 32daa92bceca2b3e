use async_trait::async_trait;

use crate::error::StoreError;
use crate::event::Event;

/// Durable destination for event batches.
///
/// The ingestion buffer flushes through this seam so it can be exercised
/// against mock sinks (failing, counting) without a database. Appends must be
/// idempotent on `event_id`: the buffer delivers at-least-once and a crash
/// between accept and flush may redeliver a whole batch.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, batch: &[Event]) -> Result<(), StoreError>;
}
