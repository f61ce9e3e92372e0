//! Source runner contract (spec §4.3). The variants {FileLog, OsEvent,
//! Syslog} form a closed set (spec §9 redesign note): modeled as tagged
//! variants with a common operation set rather than a base-class/interface
//! hierarchy, with a registry mapping `type` strings to constructors.

pub mod file_log;
pub mod os_event;
pub mod syslog;

use crate::config::SourceConfig;
use crate::error::Result;
use crate::event::Event;
use crate::health::Counters;
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Operations every source runner implements (spec §4.3).
#[async_trait]
pub trait SourceRunnerOps: Send + Sync {
    fn name(&self) -> &str;
    fn source_type(&self) -> &'static str;
    fn enabled(&self) -> bool;

    /// Binds sockets / opens subscriptions / seeds file positions to EOF.
    /// Returns `Ok(false)` when the source is unsupported on this host
    /// (e.g. OsEvent off Windows) — the caller disables it without error.
    async fn initialize(&mut self) -> Result<bool>;

    /// Long-lived; emits events onto `output` until `cancel` fires.
    async fn run(&mut self, output: mpsc::Sender<Event>, cancel: CancellationToken);

    /// Idempotent teardown.
    async fn stop(&mut self);
}

/// Tagged-variant closed set standing in for a trait object registry: each
/// concrete runner type is still a full `SourceRunnerOps` implementor, but
/// the agent holds them behind this enum so `run_all` can be written once
/// without dynamic dispatch.
pub enum SourceRunner {
    FileLog(file_log::FileLogRunner),
    OsEvent(os_event::OsEventRunner),
    Syslog(syslog::SyslogRunner),
}

impl SourceRunner {
    /// Registry: maps a `SourceConfig.type` string to a constructor.
    /// Returns `None` for an unrecognized type (spec §3: "usable only when
    /// its own type is recognized by the runtime").
    pub fn build(config: SourceConfig, counters: Arc<Counters>) -> Option<Self> {
        match config.source_type.as_str() {
            "FileLog" => Some(SourceRunner::FileLog(file_log::FileLogRunner::new(config, counters))),
            "OsEvent" => Some(SourceRunner::OsEvent(os_event::OsEventRunner::new(config))),
            "Syslog" => Some(SourceRunner::Syslog(syslog::SyslogRunner::new(config, counters))),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SourceRunner::FileLog(r) => r.name(),
            SourceRunner::OsEvent(r) => r.name(),
            SourceRunner::Syslog(r) => r.name(),
        }
    }

    pub fn source_type(&self) -> &'static str {
        match self {
            SourceRunner::FileLog(r) => r.source_type(),
            SourceRunner::OsEvent(r) => r.source_type(),
            SourceRunner::Syslog(r) => r.source_type(),
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            SourceRunner::FileLog(r) => r.enabled(),
            SourceRunner::OsEvent(r) => r.enabled(),
            SourceRunner::Syslog(r) => r.enabled(),
        }
    }

    pub async fn initialize(&mut self) -> Result<bool> {
        match self {
            SourceRunner::FileLog(r) => r.initialize().await,
            SourceRunner::OsEvent(r) => r.initialize().await,
            SourceRunner::Syslog(r) => r.initialize().await,
        }
    }

    pub async fn run(&mut self, output: mpsc::Sender<Event>, cancel: CancellationToken) {
        match self {
            SourceRunner::FileLog(r) => r.run(output, cancel).await,
            SourceRunner::OsEvent(r) => r.run(output, cancel).await,
            SourceRunner::Syslog(r) => r.run(output, cancel).await,
        }
    }

    pub async fn stop(&mut self) {
        match self {
            SourceRunner::FileLog(r) => r.stop().await,
            SourceRunner::OsEvent(r) => r.stop().await,
            SourceRunner::Syslog(r) => r.stop().await,
        }
    }
}

/// Filtering applied by every runner before emit (spec §4.3). Returns
/// `true` when the event should be dropped (filtered out).
pub fn should_filter(
    event: &Event,
    severity_filter: Option<siem_agent_shared::Severity>,
    include_patterns: &[String],
    exclude_patterns: &[String],
) -> bool {
    if let Some(filter) = severity_filter {
        if event.severity != filter {
            return true;
        }
    }
    if !include_patterns.is_empty() {
        let haystack = format!("{} {}", event.description, event.raw_payload);
        let matches_any = include_patterns.iter().any(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(&haystack))
                .unwrap_or(false)
        });
        if !matches_any {
            return true;
        }
    }
    if !exclude_patterns.is_empty() {
        let haystack = format!("{} {}", event.description, event.raw_payload);
        let matches_any = exclude_patterns.iter().any(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(&haystack))
                .unwrap_or(false)
        });
        if matches_any {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use chrono::Utc;
    use siem_agent_shared::Severity;

    fn event(description: &str, severity: Severity) -> Event {
        Event::new("host", EventType::FileLog, severity, description, description, Utc::now())
    }

    #[test]
    fn severity_filter_drops_mismatched_severity() {
        let e = event("hello", Severity::Low);
        assert!(should_filter(&e, Some(Severity::High), &[], &[]));
        assert!(!should_filter(&e, Some(Severity::Low), &[], &[]));
    }

    #[test]
    fn include_patterns_require_a_match() {
        let e = event("connection refused", Severity::Medium);
        assert!(should_filter(&e, None, &["timeout".to_string()], &[]));
        assert!(!should_filter(&e, None, &["refused".to_string()], &[]));
    }

    #[test]
    fn exclude_patterns_drop_on_match() {
        let e = event("healthcheck ok", Severity::Low);
        assert!(should_filter(&e, None, &[], &["healthcheck".to_string()]));
    }

    #[test]
    fn registry_rejects_unrecognized_type() {
        let config = SourceConfig {
            name: "x".to_string(),
            source_type: "Bogus".to_string(),
            enabled: true,
            collection_interval_sec: 5,
            settings: Default::default(),
            include_patterns: vec![],
            exclude_patterns: vec![],
            severity_filter: None,
        };
        assert!(SourceRunner::build(config, Arc::new(Counters::default())).is_none());
    }
}
