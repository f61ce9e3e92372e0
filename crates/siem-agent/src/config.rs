//! # Configuration Module
//!
//! `AgentConfig` (spec §3) plus the bootstrap loader. This is distinct from
//! the *durable* configuration file the Configuration Manager
//! (`config_manager.rs`) validates/backs-up/applies/rolls back at runtime —
//! `from_env` here is only the first-run / no-file-yet path.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;
use validator::Validate;

use crate::types::LogLevel;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadError(String),
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
    #[error("missing required configuration field: {0}")]
    MissingRequired(String),
    #[error("invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Validated agent settings (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AgentConfig {
    pub agent_id: String,
    pub agent_version: String,

    pub api_base_url: String,
    pub api_key: String,

    /// Local bind address for the admin HTTP surface (spec §4.9).
    pub admin_bind_addr: String,

    #[validate(range(min = 1, max = 10_000))]
    pub batch_size: u32,
    #[validate(range(min = 1, max = 3_600))]
    pub flush_interval_sec: u32,
    #[validate(range(min = 0, max = 10))]
    pub max_retries: u32,
    pub retry_delay_sec: u32,
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_cached_events: u32,
    #[validate(range(min = 10, max = 3_600))]
    pub health_check_interval_sec: u32,
    #[validate(range(min = 60, max = 86_400))]
    pub config_refresh_interval_sec: u32,

    pub enable_local_analysis: bool,
    pub enable_event_filtering: bool,

    pub log_level: LogLevel,

    #[validate]
    pub sources: Vec<SourceConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            api_base_url: "https://collector.example.com".to_string(),
            api_key: String::new(),
            admin_bind_addr: "127.0.0.1:8732".to_string(),
            batch_size: 100,
            flush_interval_sec: 30,
            max_retries: 3,
            retry_delay_sec: 5,
            max_cached_events: 10_000,
            health_check_interval_sec: 60,
            config_refresh_interval_sec: 300,
            enable_local_analysis: false,
            enable_event_filtering: true,
            log_level: LogLevel::Information,
            sources: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Bootstrap load: file (if present), then environment overrides.
    /// Returns defaults when neither a file nor env vars are present — the
    /// Configuration Manager is responsible for the durable on-disk form
    /// thereafter.
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/siem-agent").required(false))
            .add_source(config::File::with_name("config/siem-agent.local").required(false))
            .add_source(
                config::Environment::with_prefix("SIEMAGENT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        if settings.clone().try_deserialize::<AgentConfig>().is_err() {
            // No file/env overrides present at all — fall back to defaults
            // rather than surfacing a spurious parse error on first run.
            return Ok(AgentConfig::default());
        }

        settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Loads the durable on-disk JSON config (spec §4.8, §6 "Persistent
    /// state layout"): a document with top-level `Agent` and `SiemCore`
    /// sections (spec:203). Unlike `from_env`, a missing or unparseable
    /// file is an error — the caller decides whether to fall back to
    /// `from_env`.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;
        let document: Value =
            serde_json::from_str(&text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Self::from_document(&document)
    }

    /// Parses the `Agent`/`SiemCore` wire document into the flat in-memory
    /// struct. Kept separate from `from_file` so `config_manager.rs` can
    /// reuse it after reading a document off disk for merging.
    pub(crate) fn from_document(document: &Value) -> Result<Self, ConfigError> {
        let agent_value = document
            .get("Agent")
            .cloned()
            .ok_or_else(|| ConfigError::MissingRequired("Agent".to_string()))?;
        let siem_core_value = document
            .get("SiemCore")
            .cloned()
            .ok_or_else(|| ConfigError::MissingRequired("SiemCore".to_string()))?;
        let agent: AgentSection = serde_json::from_value(agent_value)
            .map_err(|e| ConfigError::ParseError(format!("Agent section: {e}")))?;
        let siem_core: SiemCoreSection = serde_json::from_value(siem_core_value)
            .map_err(|e| ConfigError::ParseError(format!("SiemCore section: {e}")))?;

        let mut config = AgentConfig::default();
        config.apply_sections(agent, siem_core);
        Ok(config)
    }

    fn apply_sections(&mut self, agent: AgentSection, siem_core: SiemCoreSection) {
        self.agent_id = agent.agent_id;
        self.agent_version = agent.agent_version;
        self.api_base_url = agent.api_base_url;
        self.api_key = agent.api_key;
        self.admin_bind_addr = agent.admin_bind_addr;
        self.log_level = agent.log_level;
        self.sources = agent.sources;

        self.batch_size = siem_core.batch_size;
        self.flush_interval_sec = siem_core.flush_interval_sec;
        self.max_retries = siem_core.max_retries;
        self.retry_delay_sec = siem_core.retry_delay_sec;
        self.max_cached_events = siem_core.max_cached_events;
        self.health_check_interval_sec = siem_core.health_check_interval_sec;
        self.config_refresh_interval_sec = siem_core.config_refresh_interval_sec;
        self.enable_local_analysis = siem_core.enable_local_analysis;
        self.enable_event_filtering = siem_core.enable_event_filtering;
    }

    /// Merges `self` into an existing on-disk document, overwriting only
    /// the keys the `Agent`/`SiemCore` sections recognize (spec:203,
    /// "unknown keys are preserved on rewrite"). `document` is mutated
    /// in place; non-object documents are replaced with an empty object
    /// first.
    pub(crate) fn merge_into_document(&self, document: &mut Value) -> Result<(), ConfigError> {
        if !document.is_object() {
            *document = json!({});
        }
        let agent_updates = serde_json::to_value(AgentSection::from(self))
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let siem_core_updates = serde_json::to_value(SiemCoreSection::from(self))
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let map = document.as_object_mut().expect("document forced to an object above");
        merge_recognized_keys(map.entry("Agent").or_insert_with(|| json!({})), agent_updates);
        merge_recognized_keys(map.entry("SiemCore").or_insert_with(|| json!({})), siem_core_updates);
        Ok(())
    }

    /// Runs field-level validation (`validator` derive) plus the
    /// cross-field checks the derive can't express (source type
    /// recognition, §3 "usable only when its own type is recognized").
    pub fn validate_full(&self) -> Result<Vec<String>, Vec<String>> {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Err(e) = Validate::validate(self) {
            errors.push(e.to_string());
        }
        if self.api_base_url.is_empty() {
            errors.push("apiBaseUrl must not be empty".to_string());
        }
        if self.api_key.is_empty() {
            warnings.push("apiKey is empty; the remote collector will reject requests".to_string());
        }
        for source in &self.sources {
            if !matches!(source.source_type.as_str(), "FileLog" | "OsEvent" | "Syslog") {
                errors.push(format!(
                    "source '{}' has unrecognized type '{}'",
                    source.name, source.source_type
                ));
            }
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(errors)
        }
    }

    /// Whether changing `self` into `other` requires a process restart to
    /// take effect (spec §4.8: apiBaseUrl, apiKey, healthCheckIntervalSec,
    /// configRefreshIntervalSec changing).
    pub fn restart_required_vs(&self, other: &AgentConfig) -> bool {
        self.api_base_url != other.api_base_url
            || self.api_key != other.api_key
            || self.admin_bind_addr != other.admin_bind_addr
            || self.health_check_interval_sec != other.health_check_interval_sec
            || self.config_refresh_interval_sec != other.config_refresh_interval_sec
    }
}

/// Overwrites only the keys present in `updates` on `target`, leaving any
/// other keys already on `target` untouched (spec:203's "unknown keys are
/// preserved on rewrite").
fn merge_recognized_keys(target: &mut Value, updates: Value) {
    if !target.is_object() {
        *target = json!({});
    }
    let (Some(target_map), Value::Object(update_map)) = (target.as_object_mut(), updates) else {
        return;
    };
    for (key, value) in update_map {
        target_map.insert(key, value);
    }
}

/// Wire shape of the durable config file's `Agent` section (spec:203):
/// agent identity, transport endpoint, and the source list.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AgentSection {
    agent_id: String,
    agent_version: String,
    api_base_url: String,
    api_key: String,
    admin_bind_addr: String,
    log_level: LogLevel,
    sources: Vec<SourceConfig>,
}

impl From<&AgentConfig> for AgentSection {
    fn from(config: &AgentConfig) -> Self {
        Self {
            agent_id: config.agent_id.clone(),
            agent_version: config.agent_version.clone(),
            api_base_url: config.api_base_url.clone(),
            api_key: config.api_key.clone(),
            admin_bind_addr: config.admin_bind_addr.clone(),
            log_level: config.log_level,
            sources: config.sources.clone(),
        }
    }
}

/// Wire shape of the durable config file's `SiemCore` section (spec:203):
/// the event pipeline's tuning knobs (batching, retries, health/refresh
/// cadence).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SiemCoreSection {
    batch_size: u32,
    flush_interval_sec: u32,
    max_retries: u32,
    retry_delay_sec: u32,
    max_cached_events: u32,
    health_check_interval_sec: u32,
    config_refresh_interval_sec: u32,
    enable_local_analysis: bool,
    enable_event_filtering: bool,
}

impl From<&AgentConfig> for SiemCoreSection {
    fn from(config: &AgentConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval_sec: config.flush_interval_sec,
            max_retries: config.max_retries,
            retry_delay_sec: config.retry_delay_sec,
            max_cached_events: config.max_cached_events,
            health_check_interval_sec: config.health_check_interval_sec,
            config_refresh_interval_sec: config.config_refresh_interval_sec,
            enable_local_analysis: config.enable_local_analysis,
            enable_event_filtering: config.enable_event_filtering,
        }
    }
}

/// Per-source settings (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: String,
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub collection_interval_sec: u32,
    pub settings: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub severity_filter: Option<siem_agent_shared::Severity>,
}
