//! End-to-end scenario tests against a real `Forwarder`/`DurableQueue`
//! pair driven through a `wiremock` stand-in for the remote collector.
//! Named after the scenarios they exercise.

use siem_agent::config::AgentConfig;
use siem_agent::dispatcher::Dispatcher;
use siem_agent::drainer::Drainer;
use siem_agent::event::Event;
use siem_agent::forwarder::Forwarder;
use siem_agent::health::Counters;
use siem_agent::queue::DurableQueue;
use siem_agent::supervisor::ConnectivitySupervisor;
use siem_agent::types::EventType;
use chrono::Utc;
use siem_agent_shared::Severity;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(base_url: &str) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.api_base_url = base_url.to_string();
    config.api_key = "test-key".to_string();
    config.batch_size = 10;
    config.flush_interval_sec = 1;
    config.max_retries = 2;
    config.max_cached_events = 3;
    config
}

fn sample_event(description: &str) -> Event {
    Event::new("host-1", EventType::FileLog, Severity::High, description, description, Utc::now())
}

async fn harness(config: &AgentConfig) -> (Arc<Forwarder>, Arc<DurableQueue>, Arc<ConnectivitySupervisor>, Arc<Counters>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let queue = Arc::new(DurableQueue::init(&dir.path().join("queue.sqlite")).await.unwrap());
    let supervisor = Arc::new(ConnectivitySupervisor::new());
    let forwarder = Arc::new(Forwarder::new(config, Arc::clone(&supervisor)).unwrap());
    let counters = Arc::new(Counters::default());
    (forwarder, queue, supervisor, counters, dir)
}

/// S1 — connected forward: one event goes straight through, queue stays empty.
#[tokio::test]
async fn s1_connected_forward() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/siem/events"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let (forwarder, queue, supervisor, counters, _dir) = harness(&config).await;
    supervisor.report_success().await;

    let dispatcher = Dispatcher::new(&config, forwarder, Arc::clone(&queue), supervisor, Arc::clone(&counters));
    let (tx, rx) = mpsc::channel(8);
    tx.send(sample_event("ERROR foo")).await.unwrap();
    drop(tx);
    dispatcher.run(rx).await;

    assert_eq!(counters.collected.get(), 1);
    assert_eq!(counters.forwarded.get(), 1);
    assert_eq!(counters.cached.get(), 0);
    assert_eq!(queue.count().await.unwrap(), 0);
}

/// S2 — disconnected enqueue, then drain on reconnect.
#[tokio::test]
async fn s2_disconnected_enqueue_then_drain() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/siem/events"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/siem/events/batch"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let (forwarder, queue, supervisor, counters, _dir) = harness(&config).await;

    let dispatcher = Dispatcher::new(&config, Arc::clone(&forwarder), Arc::clone(&queue), Arc::clone(&supervisor), Arc::clone(&counters));
    let (tx, rx) = mpsc::channel(8);
    tx.send(sample_event("ERROR foo")).await.unwrap();
    drop(tx);
    dispatcher.run(rx).await;

    assert_eq!(counters.collected.get(), 1);
    assert_eq!(counters.cached.get(), 1);
    assert_eq!(queue.count().await.unwrap(), 1);
    assert!(!supervisor.is_connected());

    // Reconnect and let the drainer pick up the queued batch.
    forwarder.probe().await.unwrap();
    assert!(supervisor.is_connected());

    let drainer = Drainer::new(&config, forwarder, Arc::clone(&queue), Arc::clone(&supervisor), Arc::clone(&counters));
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let drain_handle = tokio::spawn(async move { drainer.run(shutdown_rx).await });
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let _ = shutdown_tx.send(());
    drain_handle.await.unwrap();

    assert_eq!(queue.count().await.unwrap(), 0);
    assert_eq!(counters.forwarded.get(), 1);
}

/// S3 — retry exhaustion: three flush-tick attempts, then evicted with
/// `droppedByRetry` incremented.
#[tokio::test]
async fn s3_retry_exhaustion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/siem/events/batch"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let (forwarder, queue, supervisor, counters, _dir) = harness(&config).await;
    queue.enqueue(sample_event("perma failure"), config.max_cached_events).await.unwrap();

    let drainer = Drainer::new(&config, forwarder, Arc::clone(&queue), Arc::clone(&supervisor), Arc::clone(&counters));
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    supervisor.report_success().await;
    let drain_handle = tokio::spawn(async move { drainer.run(shutdown_rx).await });

    // Three flush ticks (1s each) plus slack for the third failed attempt
    // to be observed and evicted.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let _ = shutdown_tx.send(());
    drain_handle.await.unwrap();

    assert_eq!(queue.count().await.unwrap(), 0);
    assert_eq!(counters.dropped_by_retry.get(), 1);
}

/// S4 — capacity eviction: queue caps at `maxCachedEvents`, oldest evicted,
/// `droppedByCapacity` incremented; on reconnect the retained events drain.
#[tokio::test]
async fn s4_capacity_eviction() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/siem/events"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/siem/events/batch"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let config = test_config(&server.uri());
    let (forwarder, queue, supervisor, counters, _dir) = harness(&config).await;

    let dispatcher = Dispatcher::new(&config, forwarder, Arc::clone(&queue), Arc::clone(&supervisor), Arc::clone(&counters));
    let (tx, rx) = mpsc::channel(8);
    for i in 0..4 {
        tx.send(sample_event(&format!("event {i}"))).await.unwrap();
    }
    drop(tx);
    dispatcher.run(rx).await;

    assert_eq!(queue.count().await.unwrap(), 3);
    assert_eq!(counters.dropped_by_capacity.get(), 1);
}

/// S5 — config apply + rollback.
#[tokio::test]
async fn s5_config_apply_and_rollback() {
    use siem_agent::config_manager::{ConfigManager, ConfigUpdateSource};

    let dir = tempdir().unwrap();
    let manager = ConfigManager::new(AgentConfig::default(), dir.path());

    let mut candidate = AgentConfig::default();
    candidate.batch_size = 500;
    let update = manager.apply(candidate, ConfigUpdateSource::AdminPush).await.unwrap();
    assert!(!update.restart_required);
    assert_eq!(manager.current().batch_size, 500);

    let on_disk = AgentConfig::from_file(&dir.path().join("agent-config.json")).unwrap();
    assert_eq!(on_disk.batch_size, 500);

    // Simulate a write failure by making the config file path unwritable,
    // then confirm the in-memory config still equals the prior applied value.
    let config_path = dir.path().join("agent-config.json");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(dir.path()).unwrap().permissions();
        perms.set_mode(0o500);
        std::fs::set_permissions(dir.path(), perms).unwrap();

        let mut second = AgentConfig::default();
        second.batch_size = 900;
        let result = manager.apply(second, ConfigUpdateSource::AdminPush).await;
        assert!(result.is_err());
        assert_eq!(manager.current().batch_size, 500);

        let mut perms = std::fs::metadata(dir.path()).unwrap().permissions();
        perms.set_mode(0o700);
        std::fs::set_permissions(dir.path(), perms).unwrap();
    }
    let _ = config_path;
}
