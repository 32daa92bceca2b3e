use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use lumetric_core::event::Event;
use lumetric_core::sink::EventSink;

/// Result of offering a batch to the buffer. `rejected` items hit a full
/// shard and were dropped back to the caller (HTTP 429); the caller's script
/// is expected to requeue locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub accepted: usize,
    pub rejected: usize,
}

/// Bounded, sharded in-memory ingestion buffer.
///
/// One shard per site keeps a noisy tenant from starving the rest. `submit`
/// never blocks: a full shard rejects immediately. Flushing drains every
/// shard into one time-sorted batch and appends it through the [`EventSink`]
/// with bounded exponential backoff; a batch that exhausts its retries is
/// spilled to a JSON-lines dead-letter file for later replay, never silently
/// dropped. Delivery is therefore at-least-once and relies on the store's
/// idempotent append.
pub struct IngestBuffer {
    sink: Arc<dyn EventSink>,
    shards: Mutex<HashMap<String, Vec<Event>>>,
    shard_capacity: usize,
    max_batch: usize,
    max_retries: u32,
    spill_dir: PathBuf,
    flush_signal: Notify,
}

impl IngestBuffer {
    pub fn new(
        sink: Arc<dyn EventSink>,
        shard_capacity: usize,
        max_batch: usize,
        max_retries: u32,
        data_dir: &str,
    ) -> Self {
        Self {
            sink,
            shards: Mutex::new(HashMap::new()),
            shard_capacity,
            max_batch,
            max_retries,
            spill_dir: Path::new(data_dir).join("dead_letter"),
            flush_signal: Notify::new(),
        }
    }

    /// Offer events to their site shards. Fills each shard up to capacity and
    /// rejects the remainder without blocking or partial-batch corruption:
    /// every event is either queued whole or reported rejected.
    ///
    /// Crossing `max_batch` total pending wakes the flush loop instead of
    /// flushing inline; the submitter never sits through the store's retry
    /// ladder.
    pub async fn submit(&self, events: Vec<Event>) -> SubmitOutcome {
        let mut outcome = SubmitOutcome::default();
        let should_flush = {
            let mut shards = self.shards.lock().await;
            for event in events {
                let shard = shards.entry(event.site_id.clone()).or_default();
                if shard.len() >= self.shard_capacity {
                    outcome.rejected += 1;
                } else {
                    shard.push(event);
                    outcome.accepted += 1;
                }
            }
            shards.values().map(Vec::len).sum::<usize>() >= self.max_batch
        };

        if outcome.rejected > 0 {
            warn!(
                rejected = outcome.rejected,
                accepted = outcome.accepted,
                "ingestion shard full, rejecting overflow"
            );
        }
        if should_flush {
            self.flush_signal.notify_one();
        }
        outcome
    }

    pub async fn pending(&self) -> usize {
        self.shards.lock().await.values().map(Vec::len).sum()
    }

    /// Drain all shards and deliver the combined batch.
    ///
    /// The lock is held only for the drain so `submit` is never blocked by a
    /// slow store write. Events are sorted by `occurred_at` before delivery
    /// so the per-connection arrival order is approximately preserved
    /// downstream.
    pub async fn flush(&self) {
        let mut batch: Vec<Event> = {
            let mut shards = self.shards.lock().await;
            shards.drain().flat_map(|(_, events)| events).collect()
        };
        if batch.is_empty() {
            return;
        }
        batch.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });

        match self.append_with_retry(&batch).await {
            Ok(attempts) => {
                info!(count = batch.len(), attempts, "buffer flushed");
            }
            Err(e) => {
                error!(count = batch.len(), error = %e, "flush retries exhausted, spilling to dead-letter");
                if let Err(spill_err) = self.spill(&batch) {
                    // Both the store and the spill disk failed; this is the
                    // one path where data loss is possible, so shout.
                    error!(error = %spill_err, count = batch.len(), "DEAD-LETTER SPILL FAILED, batch lost");
                }
            }
        }
    }

    /// Append with bounded exponential backoff and jitter. Returns the number
    /// of attempts used. Fatal store errors skip the remaining retries.
    async fn append_with_retry(&self, batch: &[Event]) -> Result<u32> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.sink.append(batch).await {
                Ok(()) => return Ok(attempt),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let backoff = backoff_delay(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient store error, retrying flush"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(anyhow::anyhow!(e)),
            }
        }
    }

    /// Persist a failed batch as one JSON-lines file under
    /// `{data_dir}/dead_letter/`.
    fn spill(&self, batch: &[Event]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.spill_dir)
            .with_context(|| format!("creating spill dir {}", self.spill_dir.display()))?;
        let path = self
            .spill_dir
            .join(format!("batch-{}.jsonl", uuid::Uuid::new_v4()));
        let mut lines = String::new();
        for event in batch {
            lines.push_str(&serde_json::to_string(event)?);
            lines.push('\n');
        }
        std::fs::write(&path, lines)
            .with_context(|| format!("writing dead-letter file {}", path.display()))?;
        info!(path = %path.display(), count = batch.len(), "batch spilled to dead-letter");
        Ok(path)
    }

    /// Replay every dead-letter file through the sink, deleting files that
    /// replay cleanly. Safe to run on every startup: the store's idempotent
    /// append absorbs events that made it in before the original failure.
    ///
    /// Returns the number of events replayed.
    pub async fn replay_dead_letters(&self) -> Result<usize> {
        if !self.spill_dir.exists() {
            return Ok(0);
        }
        let mut replayed = 0;
        for entry in std::fs::read_dir(&self.spill_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let mut batch = Vec::new();
            let mut parse_failed = false;
            for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<Event>(line) {
                    Ok(event) => batch.push(event),
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "corrupt dead-letter line, keeping file");
                        parse_failed = true;
                        break;
                    }
                }
            }
            if parse_failed {
                continue;
            }
            match self.sink.append(&batch).await {
                Ok(()) => {
                    replayed += batch.len();
                    std::fs::remove_file(&path)?;
                    info!(path = %path.display(), count = batch.len(), "dead-letter batch replayed");
                }
                Err(e) => {
                    // Leave the file for the next replay pass.
                    warn!(path = %path.display(), error = %e, "dead-letter replay failed, will retry later");
                }
            }
        }
        Ok(replayed)
    }

    /// Background loop: flush on a fixed interval, or sooner when `submit`
    /// crosses the batch threshold. Spawned from `main.rs`.
    pub async fn run_flush_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.flush_signal.notified() => {}
            }
            self.flush().await;
        }
    }
}

/// 100ms * 2^(attempt-1), capped at 5s, plus up to 50ms of jitter.
fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let base = Duration::from_millis(100)
        .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
        .min(Duration::from_secs(5));
    base + Duration::from_millis(rand::thread_rng().gen_range(0..50))
}
