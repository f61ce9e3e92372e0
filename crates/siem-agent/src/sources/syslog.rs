//! Syslog source runner (spec §4.3, §6, scenario S6): binds UDP or TCP,
//! parses RFC3164/RFC5424-shaped messages (leading `<priority>`, then
//! timestamp/hostname/tag), and maps `syslogSeverity = pri % 8` per the
//! severity table in spec §6.

use crate::config::SourceConfig;
use crate::error::Result;
use crate::event::{clamp_description, extract_timestamp, Event};
use crate::health::Counters;
use crate::sources::{should_filter, SourceRunnerOps};
use crate::types::EventType;
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use siem_agent_shared::Severity;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bound on a single TCP syslog line (spec §4.3).
const MAX_TCP_LINE_BYTES: usize = 4096;
const DEFAULT_PORT: u16 = 514;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSyslog {
    pub facility: u8,
    pub syslog_severity: u8,
    pub hostname: Option<String>,
    pub tag: Option<String>,
    pub message: String,
}

static PRIORITY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<(\d{1,3})>").expect("static regex is valid"));
static RFC3164_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(\S+)\s+([^:\[\s]+)(?:\[\d+\])?:\s?(.*)$")
        .expect("static regex is valid")
});

/// Parses a raw syslog datagram/line into facility/severity/hostname/tag
/// and the trailing message. Never fails: when the head doesn't parse as
/// RFC3164/RFC5424, the whole payload becomes `message` with facility 1
/// (user-level) and severity derived from the default priority 13.
pub fn parse_syslog(raw: &str) -> ParsedSyslog {
    let (pri, rest) = match PRIORITY_RE.captures(raw) {
        Some(caps) => {
            let pri: u16 = caps[1].parse().unwrap_or(13);
            (pri, raw[caps.get(0).unwrap().end()..].to_string())
        }
        None => (13, raw.to_string()),
    };
    let facility = (pri / 8) as u8;
    let syslog_severity = (pri % 8) as u8;

    if let Some(caps) = RFC3164_HEADER_RE.captures(rest.trim_start()) {
        return ParsedSyslog {
            facility,
            syslog_severity,
            hostname: Some(caps[2].to_string()),
            tag: Some(caps[3].to_string()),
            message: caps[4].to_string(),
        };
    }

    ParsedSyslog {
        facility,
        syslog_severity,
        hostname: None,
        tag: None,
        message: rest.trim().to_string(),
    }
}

fn severity_from_syslog(value: u8) -> Severity {
    match value {
        0..=2 => Severity::Critical,
        3 => Severity::High,
        4 => Severity::Medium,
        _ => Severity::Low,
    }
}

pub struct SyslogRunner {
    config: SourceConfig,
    counters: Arc<Counters>,
}

impl SyslogRunner {
    pub fn new(config: SourceConfig, counters: Arc<Counters>) -> Self {
        Self { config, counters }
    }

    fn protocol(&self) -> Protocol {
        match self.config.settings.get("protocol").and_then(|v| v.as_str()) {
            Some("tcp") | Some("TCP") => Protocol::Tcp,
            _ => Protocol::Udp,
        }
    }

    fn port(&self) -> u16 {
        self.config
            .settings
            .get("port")
            .and_then(|v| v.as_u64())
            .map(|p| p as u16)
            .unwrap_or(DEFAULT_PORT)
    }

    fn build_event(config: &SourceConfig, peer: &str, protocol: &str, raw: &str, counters: &Counters) -> Option<Event> {
        let parsed = parse_syslog(raw);
        let severity = severity_from_syslog(parsed.syslog_severity);
        let timestamp = extract_timestamp(raw).unwrap_or_else(Utc::now);
        let source_system = parsed.hostname.clone().unwrap_or_else(|| peer.to_string());

        let mut event = Event::new(
            source_system,
            EventType::Syslog,
            severity,
            clamp_description(&parsed.message),
            raw,
            timestamp,
        );
        event = event.with_custom_field("sourcePort", peer.to_string());
        event = event.with_custom_field("protocol", protocol.to_string());
        event = event.with_custom_field("facility", parsed.facility as i64);
        event = event.with_custom_field("syslogSeverity", parsed.syslog_severity as i64);
        if let Some(tag) = parsed.tag {
            event = event.with_custom_field("tag", tag);
        }

        if should_filter(&event, config.severity_filter, &config.include_patterns, &config.exclude_patterns) {
            counters.filtered.increment();
            None
        } else {
            Some(event)
        }
    }

    async fn run_udp(
        config: SourceConfig,
        counters: Arc<Counters>,
        port: u16,
        output: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) {
        let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => socket,
            Err(err) => {
                warn!(port, error = %err, "failed to bind syslog UDP socket");
                return;
            }
        };
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, peer)) => {
                            let raw = String::from_utf8_lossy(&buf[..n]).to_string();
                            if let Some(event) = Self::build_event(&config, &peer.to_string(), "udp", &raw, &counters) {
                                if output.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => debug!(error = %err, "syslog UDP recv error"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    async fn run_tcp(
        config: SourceConfig,
        counters: Arc<Counters>,
        port: u16,
        output: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(port, error = %err, "failed to bind syslog TCP listener");
                return;
            }
        };
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let config = config.clone();
                            let counters = Arc::clone(&counters);
                            let output = output.clone();
                            let child_cancel = cancel.clone();
                            tokio::spawn(async move {
                                Self::handle_tcp_connection(config, counters, peer.to_string(), stream, output, child_cancel).await;
                            });
                        }
                        Err(err) => debug!(error = %err, "syslog TCP accept error"),
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    async fn handle_tcp_connection(
        config: SourceConfig,
        counters: Arc<Counters>,
        peer: String,
        stream: tokio::net::TcpStream,
        output: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) {
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = Vec::new();
            tokio::select! {
                result = reader.read_until(b'\n', &mut line) => {
                    match result {
                        Ok(0) => break,
                        Ok(_) => {
                            line.truncate(MAX_TCP_LINE_BYTES.min(line.len()));
                            let raw = String::from_utf8_lossy(&line).trim_end().to_string();
                            if raw.is_empty() {
                                continue;
                            }
                            if let Some(event) = Self::build_event(&config, &peer, "tcp", &raw, &counters) {
                                if output.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            debug!(error = %err, "syslog TCP read error");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

#[async_trait]
impl SourceRunnerOps for SyslogRunner {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn source_type(&self) -> &'static str {
        "Syslog"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    async fn initialize(&mut self) -> Result<bool> {
        Ok(true)
    }

    async fn run(&mut self, output: mpsc::Sender<Event>, cancel: CancellationToken) {
        let port = self.port();
        let counters = Arc::clone(&self.counters);
        match self.protocol() {
            Protocol::Udp => Self::run_udp(self.config.clone(), counters, port, output, cancel).await,
            Protocol::Tcp => Self::run_tcp(self.config.clone(), counters, port, output, cancel).await,
        }
    }

    async fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3164_with_priority() {
        let parsed = parse_syslog("<13>Oct 11 22:14:15 myhost sshd: accepted");
        assert_eq!(parsed.facility, 1);
        assert_eq!(parsed.syslog_severity, 5);
        assert_eq!(parsed.hostname, Some("myhost".to_string()));
        assert_eq!(parsed.tag, Some("sshd".to_string()));
        assert_eq!(parsed.message, "accepted");
    }

    #[test]
    fn severity_13_mod_8_maps_to_low() {
        // 13 % 8 == 5, which the spec's table maps to Low.
        assert_eq!(severity_from_syslog(5), Severity::Low);
    }

    #[test]
    fn missing_priority_defaults_to_13() {
        let parsed = parse_syslog("Oct 11 22:14:15 myhost sshd: accepted");
        assert_eq!(parsed.facility, 1);
        assert_eq!(parsed.syslog_severity, 5);
    }

    #[test]
    fn severity_table_matches_spec() {
        assert_eq!(severity_from_syslog(0), Severity::Critical);
        assert_eq!(severity_from_syslog(2), Severity::Critical);
        assert_eq!(severity_from_syslog(3), Severity::High);
        assert_eq!(severity_from_syslog(4), Severity::Medium);
        assert_eq!(severity_from_syslog(5), Severity::Low);
        assert_eq!(severity_from_syslog(7), Severity::Low);
    }

    #[test]
    fn scenario_s6_end_to_end_fields() {
        let config = SourceConfig {
            name: "syslog".to_string(),
            source_type: "Syslog".to_string(),
            enabled: true,
            collection_interval_sec: 1,
            settings: Default::default(),
            include_patterns: vec![],
            exclude_patterns: vec![],
            severity_filter: None,
        };
        let counters = Counters::default();
        let event = SyslogRunner::build_event(&config, "10.0.0.5:5000", "udp", "<13>Oct 11 22:14:15 myhost sshd: accepted", &counters)
            .expect("event should not be filtered");
        assert_eq!(event.severity, Severity::Low);
        assert_eq!(event.source_system, "myhost");
        assert_eq!(event.description, "accepted");
        assert_eq!(
            event.custom_fields.get("tag").and_then(|v| v.as_str()),
            Some("sshd")
        );
        assert_eq!(event.custom_fields.get("facility").and_then(|v| v.as_i64()), Some(1));
    }
}
