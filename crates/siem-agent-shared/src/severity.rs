use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Normalized event severity, shared by the source runners, the queue, and
/// the forwarder. Ordered low to high so a `PartialOrd`/`Ord` comparison
/// reads naturally (`Severity::Low < Severity::Critical`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Medium
    }
}

impl Severity {
    fn rank(self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }

    /// Best-effort mapping from a free-text keyword found in a log line
    /// (e.g. a file-log source's "ERROR"/"WARN" token) onto a normalized
    /// severity. Unrecognized input maps to `Medium`.
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword.to_ascii_uppercase().as_str() {
            "TRACE" | "DEBUG" | "INFO" | "NOTICE" => Severity::Low,
            "WARN" | "WARNING" => Severity::Medium,
            "ERROR" | "ERR" => Severity::High,
            "CRIT" | "CRITICAL" | "FATAL" | "EMERG" | "EMERGENCY" | "ALERT" => Severity::Critical,
            _ => Severity::Medium,
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn keyword_mapping_is_case_insensitive() {
        assert_eq!(Severity::from_keyword("error"), Severity::High);
        assert_eq!(Severity::from_keyword("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::from_keyword("info"), Severity::Low);
        assert_eq!(Severity::from_keyword("unknown-token"), Severity::Medium);
    }

    #[test]
    fn default_is_medium() {
        assert_eq!(Severity::default(), Severity::Medium);
    }
}
