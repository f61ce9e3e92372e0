//! Health Reporter (spec §4.7): resource sampling, counters, and status
//! derivation into a `HealthSnapshot` pushed to the remote on the health
//! interval.

use crate::forwarder::Forwarder;
use crate::supervisor::ConnectivitySupervisor;
use crate::types::AgentStatus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::sync::broadcast;
use tracing::warn;

const RING_BUFFER_CAPACITY: usize = 50;
const CONFIG_STALE_AFTER: chrono::Duration = chrono::Duration::hours(1);
const CPU_WARNING_PCT: f32 = 80.0;
const MEM_WARNING_BYTES: u64 = 1024 * 1024 * 1024;

/// A single monotonically-increasing counter, updated via atomic
/// increments (spec §5 "concurrent mutable counters").
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Timestamped message for the errors/warnings ring buffers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedMessage {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// All of the health snapshot's counters plus the errors/warnings ring
/// buffers, shared across the dispatcher/drainer/sources via `Arc`.
#[derive(Default)]
pub struct Counters {
    pub collected: Counter,
    pub forwarded: Counter,
    pub cached: Counter,
    pub filtered: Counter,
    pub dropped_by_retry: Counter,
    pub dropped_by_age: Counter,
    pub dropped_by_capacity: Counter,
    errors: Mutex<VecDeque<TimestampedMessage>>,
    warnings: Mutex<VecDeque<TimestampedMessage>>,
    last_config_update: Mutex<Option<DateTime<Utc>>>,
}

impl Counters {
    pub fn record_error(&self, message: impl Into<String>) {
        push_bounded(
            &self.errors,
            TimestampedMessage {
                timestamp: Utc::now(),
                message: message.into(),
            },
        );
    }

    pub fn record_warning(&self, message: impl Into<String>) {
        push_bounded(
            &self.warnings,
            TimestampedMessage {
                timestamp: Utc::now(),
                message: message.into(),
            },
        );
    }

    pub fn set_last_config_update(&self, at: DateTime<Utc>) {
        *self.last_config_update.lock() = Some(at);
    }

    pub fn last_config_update(&self) -> Option<DateTime<Utc>> {
        *self.last_config_update.lock()
    }

    fn errors_snapshot(&self) -> Vec<TimestampedMessage> {
        self.errors.lock().iter().cloned().collect()
    }

    fn warnings_snapshot(&self) -> Vec<TimestampedMessage> {
        self.warnings.lock().iter().cloned().collect()
    }
}

fn push_bounded(buffer: &Mutex<VecDeque<TimestampedMessage>>, message: TimestampedMessage) {
    let mut buffer = buffer.lock();
    buffer.push_back(message);
    while buffer.len() > RING_BUFFER_CAPACITY {
        buffer.pop_front();
    }
}

/// Resource samples taken over a 1-second window (spec §4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub cpu_pct: f32,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
}

/// Health snapshot forwarded to the remote and exposed via the admin
/// surface (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: AgentStatus,
    pub collected: u64,
    pub forwarded: u64,
    pub cached: u64,
    pub filtered: u64,
    pub dropped_by_retry: u64,
    pub dropped_by_age: u64,
    pub connected: bool,
    pub last_successful_connect: Option<DateTime<Utc>>,
    pub last_config_update: Option<DateTime<Utc>>,
    pub cpu_pct: f32,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
    pub errors: Vec<TimestampedMessage>,
    pub warnings: Vec<TimestampedMessage>,
}

/// Samples process resource usage and pushes health snapshots on the
/// configured interval.
pub struct HealthReporter {
    counters: Arc<Counters>,
    supervisor: Arc<ConnectivitySupervisor>,
    forwarder: Arc<Forwarder>,
    working_dir: std::path::PathBuf,
    interval: Duration,
    system: Mutex<System>,
    pid: Pid,
}

impl HealthReporter {
    pub fn new(
        counters: Arc<Counters>,
        supervisor: Arc<ConnectivitySupervisor>,
        forwarder: Arc<Forwarder>,
        working_dir: std::path::PathBuf,
        interval_sec: u32,
    ) -> Self {
        let pid = Pid::from_u32(std::process::id());
        Self {
            counters,
            supervisor,
            forwarder,
            working_dir,
            interval: Duration::from_secs(interval_sec as u64),
            system: Mutex::new(System::new()),
            pid,
        }
    }

    /// Samples CPU/memory over a 1-second window (spec §4.7: "elapsed
    /// process CPU time / elapsed wall time / cores").
    pub async fn sample_resources(&self) -> ResourceSample {
        {
            let mut system = self.system.lock();
            system.refresh_process(self.pid);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        let (cpu_pct, mem_bytes) = {
            let mut system = self.system.lock();
            system.refresh_process(self.pid);
            match system.process(self.pid) {
                Some(process) => (process.cpu_usage() / num_cpus::get() as f32, process.memory()),
                None => (0.0, 0),
            }
        };
        let disk_bytes = directory_size(&self.working_dir).unwrap_or(0);
        ResourceSample {
            cpu_pct,
            mem_bytes,
            disk_bytes,
        }
    }

    /// Derives `status` per spec §4.7's decision table.
    pub fn derive_status(&self, sample: &ResourceSample, connected: bool, errors_nonempty: bool, warnings_nonempty: bool) -> AgentStatus {
        let config_stale = self
            .counters
            .last_config_update()
            .map(|at| Utc::now() - at > CONFIG_STALE_AFTER)
            .unwrap_or(false);

        if errors_nonempty {
            AgentStatus::Error
        } else if !connected {
            AgentStatus::Warning
        } else if config_stale {
            AgentStatus::Warning
        } else if sample.cpu_pct > CPU_WARNING_PCT || sample.mem_bytes > MEM_WARNING_BYTES {
            AgentStatus::Warning
        } else if warnings_nonempty {
            AgentStatus::Warning
        } else {
            AgentStatus::Running
        }
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let sample = self.sample_resources().await;
        let errors = self.counters.errors_snapshot();
        let warnings = self.counters.warnings_snapshot();
        let connected = self.supervisor.is_connected();
        let status = self.derive_status(&sample, connected, !errors.is_empty(), !warnings.is_empty());

        HealthSnapshot {
            status,
            collected: self.counters.collected.get(),
            forwarded: self.counters.forwarded.get(),
            cached: self.counters.cached.get(),
            filtered: self.counters.filtered.get(),
            dropped_by_retry: self.counters.dropped_by_retry.get(),
            dropped_by_age: self.counters.dropped_by_age.get(),
            connected,
            last_successful_connect: self.supervisor.last_successful_connect(),
            last_config_update: self.counters.last_config_update(),
            cpu_pct: sample.cpu_pct,
            mem_bytes: sample.mem_bytes,
            disk_bytes: sample.disk_bytes,
            errors,
            warnings,
        }
    }

    /// Runs the health ticker until `shutdown` fires; pushes a snapshot to
    /// the remote only while connected.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.snapshot().await;
                    if snapshot.connected {
                        if let Err(err) = self.forwarder.send_health(&snapshot).await {
                            warn!(error = %err, "failed to push health snapshot");
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

fn directory_size(path: &std::path::Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                total += directory_size(&entry.path())?;
            } else {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_atomically() {
        let counter = Counter::default();
        counter.increment();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn ring_buffer_caps_at_capacity() {
        let counters = Counters::default();
        for i in 0..(RING_BUFFER_CAPACITY + 10) {
            counters.record_warning(format!("warning {i}"));
        }
        assert_eq!(counters.warnings_snapshot().len(), RING_BUFFER_CAPACITY);
    }

    #[test]
    fn directory_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("b.txt"), b"world!").unwrap();
        assert_eq!(directory_size(dir.path()).unwrap(), 5 + 6);
    }
}
