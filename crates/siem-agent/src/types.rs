//! Shared small types used across the agent's modules: status/connectivity
//! enums and the event-type tag. `Severity` itself lives in
//! `siem_agent_shared` since it is genuinely shared outside this crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall agent status reported in the health snapshot (spec §3, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AgentStatus {
    Starting,
    Running,
    Warning,
    Error,
    Stopping,
    Stopped,
}

impl Default for AgentStatus {
    fn default() -> Self {
        AgentStatus::Starting
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Starting => "Starting",
            AgentStatus::Running => "Running",
            AgentStatus::Warning => "Warning",
            AgentStatus::Error => "Error",
            AgentStatus::Stopping => "Stopping",
            AgentStatus::Stopped => "Stopped",
        };
        write!(f, "{s}")
    }
}

/// Connectivity supervisor state (spec §4.5). Two states only — no
/// "connecting" transitional state is modeled, matching the spec's
/// two-state machine exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Connected,
    Disconnected,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        ConnectivityState::Disconnected
    }
}

/// Tag identifying which source runner produced an event (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    FileLog,
    OsEvent,
    Syslog,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::FileLog => "FileLog",
            EventType::OsEvent => "OsEvent",
            EventType::Syslog => "Syslog",
        };
        write!(f, "{s}")
    }
}

/// Minimum log level, configurable per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Information
    }
}

impl LogLevel {
    /// Maps to a `tracing` filter directive string.
    pub fn as_tracing_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Information => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_status_defaults_to_starting() {
        assert_eq!(AgentStatus::default(), AgentStatus::Starting);
    }

    #[test]
    fn connectivity_defaults_to_disconnected() {
        assert_eq!(ConnectivityState::default(), ConnectivityState::Disconnected);
    }

    #[test]
    fn log_level_orders_trace_below_critical() {
        assert!(LogLevel::Trace < LogLevel::Critical);
    }

    #[test]
    fn event_type_display_matches_wire_tag() {
        assert_eq!(EventType::FileLog.to_string(), "FileLog");
        assert_eq!(EventType::OsEvent.to_string(), "OsEvent");
        assert_eq!(EventType::Syslog.to_string(), "Syslog");
    }
}
