//! Event model and the normalizer's pure helper functions (spec §3, §4.1).

use crate::types::EventType;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use siem_agent_shared::Severity;
use std::collections::HashMap;
use uuid::Uuid;

/// Maximum code points kept in `description` before ellipsis continuation
/// (spec §3).
pub const MAX_DESCRIPTION_CODEPOINTS: usize = 500;

/// The normalized event record forwarded to the remote collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_system: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_ip: Option<String>,
    pub raw_payload: String,
    pub custom_fields: HashMap<String, Value>,
    pub agent_id: String,
    pub agent_version: String,
    pub retry_count: u32,
    pub cached: bool,
}

impl Event {
    /// Builds a new event with envelope fields left at their at-rest
    /// defaults; the dispatcher fills in `agent_id`/`agent_version` before
    /// the first forward attempt.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_system: impl Into<String>,
        event_type: EventType,
        severity: Severity,
        description: impl Into<String>,
        raw_payload: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            source_system: source_system.into(),
            event_type,
            severity,
            description: clamp_description(&description.into()),
            source_ip: None,
            destination_ip: None,
            raw_payload: raw_payload.into(),
            custom_fields: HashMap::new(),
            agent_id: String::new(),
            agent_version: String::new(),
            retry_count: 0,
            cached: false,
        }
    }

    pub fn with_custom_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom_fields.insert(key.into(), value.into());
        self
    }

    pub fn with_ips(mut self, source_ip: Option<String>, destination_ip: Option<String>) -> Self {
        self.source_ip = source_ip;
        self.destination_ip = destination_ip;
        self
    }
}

/// Wraps an `Event` with durable-queue bookkeeping (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub event: Event,
    pub cached_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(event: Event, cached_at: DateTime<Utc>) -> Self {
        let retry_count = event.retry_count;
        Self {
            event,
            cached_at,
            retry_count,
            last_retry_at: None,
        }
    }
}

/// `normalizeSeverity` — canonicalizes free-text severity tokens onto the
/// fixed scale (spec §6 "Canonicalization" row).
pub fn normalize_severity(raw: &str) -> Severity {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "low" | "info" => Severity::Low,
        "2" | "medium" | "warn" => Severity::Medium,
        "3" | "high" | "error" => Severity::High,
        "4" | "critical" | "fatal" => Severity::Critical,
        other => Severity::from_keyword(other),
    }
}

/// `clampDescription` — trims to `MAX_DESCRIPTION_CODEPOINTS` code points,
/// appending an ellipsis when truncated.
pub fn clamp_description(text: &str) -> String {
    let mut chars = text.chars();
    let clamped: String = chars.by_ref().take(MAX_DESCRIPTION_CODEPOINTS).collect();
    if chars.next().is_some() {
        format!("{clamped}…")
    } else {
        clamped
    }
}

/// `normalizeIp` — parses and canonicalizes a dotted-quad or IPv6 address,
/// returning `None` when unparseable.
pub fn normalize_ip(text: &str) -> Option<String> {
    text.trim().parse::<std::net::IpAddr>().ok().map(|ip| ip.to_string())
}

static IP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b")
        .expect("static regex is valid")
});

/// `extractIps` — finds dotted-quad IPv4 addresses in `text` in order of
/// appearance. First match becomes `sourceIp`, second `destinationIp`.
pub fn extract_ips(text: &str) -> Vec<String> {
    IP_RE.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

static ISO8601_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%:z"];

/// `extractTimestamp` — tries, in order: ISO-8601, `YYYY-MM-DD HH:MM:SS`,
/// `MM/DD/YYYY HH:MM:SS`, RFC3164 month-day-time. Never fails; returns
/// `None` so the caller can fall back to receipt time.
pub fn extract_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();

    for fmt in ISO8601_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%m/%d/%Y %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    extract_rfc3164_timestamp(text)
}

/// Parses a leading RFC3164 "Mon DD HH:MM:SS" prefix, assuming the current
/// year (RFC3164 carries no year field).
fn extract_rfc3164_timestamp(text: &str) -> Option<DateTime<Utc>> {
    static RFC3164_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^([A-Z][a-z]{2})\s+(\d{1,2})\s+(\d{2}):(\d{2}):(\d{2})")
            .expect("static regex is valid")
    });
    let caps = RFC3164_RE.captures(text.trim())?;
    let month = month_number(&caps[1])?;
    let day: u32 = caps[2].parse().ok()?;
    let hour: u32 = caps[3].parse().ok()?;
    let minute: u32 = caps[4].parse().ok()?;
    let second: u32 = caps[5].parse().ok()?;
    let year = Utc::now().format("%Y").to_string().parse::<i32>().ok()?;
    let naive = chrono::NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn month_number(abbrev: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    MONTHS.iter().position(|m| *m == abbrev).map(|i| i as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_severity_canonicalizes_known_tokens() {
        assert_eq!(normalize_severity("1"), Severity::Low);
        assert_eq!(normalize_severity("WARN"), Severity::Medium);
        assert_eq!(normalize_severity("error"), Severity::High);
        assert_eq!(normalize_severity("Fatal"), Severity::Critical);
    }

    #[test]
    fn clamp_description_truncates_with_ellipsis() {
        let long = "a".repeat(600);
        let clamped = clamp_description(&long);
        assert_eq!(clamped.chars().count(), MAX_DESCRIPTION_CODEPOINTS + 1);
        assert!(clamped.ends_with('…'));
    }

    #[test]
    fn clamp_description_leaves_short_text_untouched() {
        assert_eq!(clamp_description("short"), "short");
    }

    #[test]
    fn normalize_ip_rejects_garbage() {
        assert_eq!(normalize_ip("not-an-ip"), None);
        assert_eq!(normalize_ip("10.0.0.1"), Some("10.0.0.1".to_string()));
    }

    #[test]
    fn extract_ips_finds_first_two_in_order() {
        let ips = extract_ips("conn from 10.0.0.1 to 10.0.0.2 established");
        assert_eq!(ips, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
    }

    #[test]
    fn extract_timestamp_parses_iso8601() {
        let ts = extract_timestamp("2024-01-15T10:30:00Z");
        assert!(ts.is_some());
    }

    #[test]
    fn extract_timestamp_parses_space_separated() {
        let ts = extract_timestamp("2024-01-15 10:30:00");
        assert!(ts.is_some());
    }

    #[test]
    fn extract_timestamp_returns_none_on_garbage() {
        assert_eq!(extract_timestamp("not a timestamp"), None);
    }

    #[test]
    fn extract_timestamp_parses_rfc3164_prefix() {
        let ts = extract_timestamp("Oct 11 22:14:15 myhost sshd: accepted");
        assert!(ts.is_some());
    }
}
