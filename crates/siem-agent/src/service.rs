//! Composition root (spec §9 "globally shared service singletons" ->
//! "replace with explicit construction"): builds the queue, forwarder,
//! supervisor, dispatcher, drainer, health reporter, config manager and
//! source runners, and injects them into each other. No process-wide
//! state.

use crate::admin::{self, AdminState};
use crate::config::AgentConfig;
use crate::config_manager::{ConfigManager, ConfigUpdateSource};
use crate::dispatcher::Dispatcher;
use crate::drainer::Drainer;
use crate::error::{AgentError, Result};
use crate::forwarder::Forwarder;
use crate::health::{Counters, HealthReporter};
use crate::queue::DurableQueue;
use crate::sources::SourceRunner;
use crate::supervisor::ConnectivitySupervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Back-pressure capacity for the shared event channel: `2 * batchSize`
/// (spec §5).
fn channel_capacity(batch_size: u32) -> usize {
    (2 * batch_size).max(1) as usize
}

/// Per-worker shutdown budget (spec:165, "10 s overall shutdown budget per
/// worker"). Each worker's join is bounded independently so one hung task
/// can't consume the whole shutdown window and starve the others.
const WORKER_SHUTDOWN_BUDGET: std::time::Duration = std::time::Duration::from_secs(10);

/// Awaits `handle` within the per-worker shutdown budget, logging (but not
/// failing the overall shutdown on) a timeout.
async fn join_with_budget(name: &str, handle: tokio::task::JoinHandle<()>) {
    match tokio::time::timeout(WORKER_SHUTDOWN_BUDGET, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(worker = name, error = %err, "worker task panicked during shutdown"),
        Err(_) => warn!(worker = name, "worker exceeded its shutdown budget, abandoning its join"),
    }
}

pub struct AgentService {
    config_manager: Arc<ConfigManager>,
    queue: Arc<DurableQueue>,
    supervisor: Arc<ConnectivitySupervisor>,
    forwarder: Arc<Forwarder>,
    counters: Arc<Counters>,
    health_reporter: Arc<HealthReporter>,
    working_dir: PathBuf,
    admin_bind_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl AgentService {
    pub async fn new(config: AgentConfig, working_dir: PathBuf, admin_bind_addr: SocketAddr) -> Result<Self> {
        std::fs::create_dir_all(&working_dir)?;

        let queue_path = working_dir.join("queue.sqlite");
        let queue = Arc::new(DurableQueue::init(&queue_path).await?);

        let supervisor = Arc::new(ConnectivitySupervisor::new());
        let forwarder = Arc::new(Forwarder::new(&config, Arc::clone(&supervisor))?);
        let counters = Arc::new(Counters::default());
        let health_reporter = Arc::new(HealthReporter::new(
            Arc::clone(&counters),
            Arc::clone(&supervisor),
            Arc::clone(&forwarder),
            working_dir.clone(),
            config.health_check_interval_sec,
        ));
        let config_manager = Arc::new(ConfigManager::new(config, &working_dir));

        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            config_manager,
            queue,
            supervisor,
            forwarder,
            counters,
            health_reporter,
            working_dir,
            admin_bind_addr,
            shutdown_tx,
        })
    }

    /// Runs every worker until `stop()` is called or a shutdown signal is
    /// received; returns once shutdown has fully drained (spec §5).
    pub async fn run(&self) -> Result<()> {
        let config = self.config_manager.current();
        let (event_tx, event_rx) = mpsc::channel(channel_capacity(config.batch_size));

        let dispatcher = Dispatcher::new(
            &config,
            Arc::clone(&self.forwarder),
            Arc::clone(&self.queue),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.counters),
        );
        let drainer = Drainer::new(
            &config,
            Arc::clone(&self.forwarder),
            Arc::clone(&self.queue),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.counters),
        );

        let mut runners: Vec<SourceRunner> = Vec::new();
        for source_config in config.sources.clone() {
            let Some(mut runner) = SourceRunner::build(source_config, Arc::clone(&self.counters)) else {
                warn!("skipping source with unrecognized type");
                continue;
            };
            if !runner.enabled() {
                continue;
            }
            match runner.initialize().await {
                Ok(true) => runners.push(runner),
                Ok(false) => {
                    info!(source = runner.name(), "source unsupported on this host, disabling");
                }
                Err(err) => {
                    warn!(source = runner.name(), error = %err, "source initialization failed, disabling");
                    self.counters.record_warning(format!("source '{}' failed to initialize: {err}", runner.name()));
                }
            }
        }

        let admin_state = AdminState {
            config_manager: Arc::clone(&self.config_manager),
            health_reporter: Arc::clone(&self.health_reporter),
            api_key: config.api_key.clone(),
        };
        let admin_router = admin::router(admin_state);
        let listener = tokio::net::TcpListener::bind(self.admin_bind_addr)
            .await
            .map_err(|e| AgentError::AdminBind {
                message: format!("failed to bind {}: {e}", self.admin_bind_addr),
            })?;

        let mut source_cancels = Vec::new();
        let mut source_handles = Vec::new();
        for mut runner in runners {
            let cancel = tokio_util::sync::CancellationToken::new();
            source_cancels.push(cancel.clone());
            let tx = event_tx.clone();
            source_handles.push(tokio::spawn(async move {
                runner.run(tx, cancel).await;
                runner.stop().await;
            }));
        }
        drop(event_tx);

        let dispatcher_handle = tokio::spawn(async move {
            dispatcher.run(event_rx).await;
        });

        let drainer_flush_shutdown = self.shutdown_tx.subscribe();
        let drainer_maintenance_shutdown = self.shutdown_tx.subscribe();
        let drainer_for_flush = Arc::new(drainer);
        let drainer_for_maintenance = Arc::clone(&drainer_for_flush);
        let drain_handle = tokio::spawn(async move {
            drainer_for_flush.run(drainer_flush_shutdown).await;
        });
        let maintenance_handle = tokio::spawn(async move {
            drainer_for_maintenance.run_maintenance(drainer_maintenance_shutdown).await;
        });

        let health_shutdown = self.shutdown_tx.subscribe();
        let health_reporter = Arc::clone(&self.health_reporter);
        let health_handle = tokio::spawn(async move {
            health_reporter.run(health_shutdown).await;
        });

        let refresh_shutdown = self.shutdown_tx.subscribe();
        let refresh_handle = tokio::spawn(run_config_refresh(
            Arc::clone(&self.config_manager),
            Arc::clone(&self.forwarder),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.counters),
            refresh_shutdown,
        ));

        let probe_shutdown = self.shutdown_tx.subscribe();
        let probe_interval = config.health_check_interval_sec;
        let forwarder = Arc::clone(&self.forwarder);
        let probe_handle = tokio::spawn(run_probe_ticker(forwarder, probe_interval, probe_shutdown));

        let server_shutdown = self.shutdown_tx.subscribe();
        axum::serve(listener, admin_router)
            .with_graceful_shutdown(wait_for_shutdown(server_shutdown))
            .await
            .map_err(|e| AgentError::AdminBind {
                message: format!("admin server error: {e}"),
            })?;

        for cancel in &source_cancels {
            cancel.cancel();
        }
        for handle in source_handles {
            join_with_budget("source", handle).await;
        }
        join_with_budget("dispatcher", dispatcher_handle).await;
        join_with_budget("drainer", drain_handle).await;
        join_with_budget("maintenance", maintenance_handle).await;
        join_with_budget("health", health_handle).await;
        join_with_budget("config_refresh", refresh_handle).await;
        join_with_budget("probe", probe_handle).await;

        Ok(())
    }

    /// Cancels the shared context; every worker completes its current
    /// unit, the drainer performs a final flush, durable state is
    /// persisted (sqlite fsyncs on write already).
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn working_dir(&self) -> &std::path::Path {
        &self.working_dir
    }
}

async fn wait_for_shutdown(mut shutdown: broadcast::Receiver<()>) {
    let _ = shutdown.recv().await;
}

async fn run_config_refresh(
    config_manager: Arc<ConfigManager>,
    forwarder: Arc<Forwarder>,
    supervisor: Arc<ConnectivitySupervisor>,
    counters: Arc<Counters>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval_sec = config_manager.current().config_refresh_interval_sec;
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_sec as u64));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !supervisor.is_connected() {
                    continue;
                }
                match forwarder.fetch_config().await {
                    Ok(Some(candidate)) => {
                        match config_manager.apply(candidate, ConfigUpdateSource::RemoteRefresh).await {
                            Ok(_) => counters.set_last_config_update(chrono::Utc::now()),
                            Err(err) => warn!(error = %err, "remote config refresh failed validation/apply"),
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "failed to fetch remote configuration"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn run_probe_ticker(forwarder: Arc<Forwarder>, interval_sec: u32, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_sec.max(1) as u64));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = forwarder.probe().await;
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_capacity_is_twice_batch_size() {
        assert_eq!(channel_capacity(100), 200);
        assert_eq!(channel_capacity(0), 1);
    }
}
