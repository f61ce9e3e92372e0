//! Drainer (spec §4.6): periodically, and on reconnect, batch-forwards
//! queued events; also runs the one-minute maintenance tick.

use crate::config::AgentConfig;
use crate::forwarder::Forwarder;
use crate::health::Counters;
use crate::queue::DurableQueue;
use crate::supervisor::{ConnectivitySignal, ConnectivitySupervisor};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Entries older than this are evicted by the maintenance tick regardless
/// of retry count (spec §4.6).
const MAINTENANCE_MAX_AGE: ChronoDuration = ChronoDuration::days(7);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Queue fill fraction at which the maintenance tick records a warning
/// (spec §4.6, and SPEC_FULL.md §11's named-constant supplement).
pub const QUEUE_WARNING_THRESHOLD: f64 = 0.8;

pub struct Drainer {
    forwarder: Arc<Forwarder>,
    queue: Arc<DurableQueue>,
    supervisor: Arc<ConnectivitySupervisor>,
    counters: Arc<Counters>,
    batch_size: u32,
    flush_interval: Duration,
    max_retries: u32,
    max_cached_events: u32,
}

impl Drainer {
    pub fn new(
        config: &AgentConfig,
        forwarder: Arc<Forwarder>,
        queue: Arc<DurableQueue>,
        supervisor: Arc<ConnectivitySupervisor>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            forwarder,
            queue,
            supervisor,
            counters,
            batch_size: config.batch_size,
            flush_interval: Duration::from_secs(config.flush_interval_sec as u64),
            max_retries: config.max_retries,
            max_cached_events: config.max_cached_events,
        }
    }

    /// Runs the flush-ticker and the `ConnectionUp`-triggered drain loop
    /// until `shutdown` fires; performs one final bounded flush attempt on
    /// shutdown (spec §5 cancellation contract).
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        let mut signals = self.supervisor.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_once().await;
                }
                signal = signals.recv() => {
                    if matches!(signal, Ok(ConnectivitySignal::ConnectionUp)) {
                        self.drain_once().await;
                    }
                }
                _ = shutdown.recv() => {
                    self.drain_once().await;
                    break;
                }
            }
        }
    }

    /// Runs the one-minute maintenance tick (`evictExpired` + queue-depth
    /// warning) until `shutdown` fires.
    pub async fn run_maintenance(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.maintenance_tick().await;
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn maintenance_tick(&self) {
        match self.queue.evict_expired(MAINTENANCE_MAX_AGE).await {
            Ok(evicted) if evicted > 0 => {
                info!(evicted, "evicted expired queue entries");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "maintenance eviction failed"),
        }

        if let Ok(count) = self.queue.count().await {
            let threshold = (self.max_cached_events as f64) * QUEUE_WARNING_THRESHOLD;
            if count as f64 > threshold {
                warn!(
                    count,
                    max_cached_events = self.max_cached_events,
                    "queue depth above warning threshold"
                );
                self.counters.record_warning(format!(
                    "queue depth {count} exceeds {QUEUE_WARNING_THRESHOLD} of max {}",
                    self.max_cached_events
                ));
            }
        }
    }

    async fn drain_once(&self) {
        if !self.supervisor.is_connected() {
            return;
        }
        let batch = match self.queue.peek_batch(self.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "failed to peek queue batch");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }

        let ids: Vec<uuid::Uuid> = batch.iter().map(|e| e.event.id).collect();
        let events: Vec<_> = batch.into_iter().map(|e| e.event).collect();

        match self.forwarder.forward_batch(&events).await {
            Ok(()) => {
                if let Err(err) = self.queue.remove(&ids).await {
                    warn!(error = %err, "failed to remove drained batch from queue");
                }
                self.counters.forwarded.add(events.len() as u64);
            }
            Err(err) => {
                warn!(
                    category = err.category(),
                    severity = %err.severity(),
                    error = %err,
                    "batch forward failed"
                );
                self.counters.record_error(format!("{}: {err}", err.category()));

                if !err.is_retryable() {
                    if let Err(err) = self.queue.remove(&ids).await {
                        warn!(error = %err, "failed to drop non-retryable batch from queue");
                        return;
                    }
                    self.counters.dropped_by_retry.add(ids.len() as u64);
                    return;
                }

                if let Err(err) = self.queue.bump_retry(&ids).await {
                    warn!(error = %err, "failed to bump retry counts");
                    return;
                }
                self.evict_exhausted_retries(&ids).await;
            }
        }
    }

    async fn evict_exhausted_retries(&self, ids: &[uuid::Uuid]) {
        let counts = match self.queue.retry_counts(ids).await {
            Ok(counts) => counts,
            Err(err) => {
                warn!(error = %err, "failed to read retry counts");
                return;
            }
        };
        let exhausted: Vec<uuid::Uuid> = counts
            .into_iter()
            .filter(|(_, count)| *count > self.max_retries)
            .map(|(id, _)| id)
            .collect();
        if exhausted.is_empty() {
            return;
        }
        if let Err(err) = self.queue.remove(&exhausted).await {
            warn!(error = %err, "failed to remove retry-exhausted entries");
            return;
        }
        self.counters.dropped_by_retry.add(exhausted.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::QUEUE_WARNING_THRESHOLD;

    #[test]
    fn warning_threshold_matches_spec() {
        assert!((QUEUE_WARNING_THRESHOLD - 0.8).abs() < f64::EPSILON);
    }
}
