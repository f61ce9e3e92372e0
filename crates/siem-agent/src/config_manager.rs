//! Configuration Manager (spec §4.8): validate → backup → apply →
//! rollback, plus a `ConfigUpdated` subscriber broadcast and periodic
//! remote refresh.

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, warn};

/// Published whenever `apply` succeeds (spec §4.8 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdated {
    pub previous: AgentConfig,
    pub new: AgentConfig,
    pub timestamp: DateTime<Utc>,
    pub source: ConfigUpdateSource,
    pub restart_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigUpdateSource {
    AdminPush,
    RemoteRefresh,
    Restoration,
}

pub struct ConfigManager {
    current: RwLock<AgentConfig>,
    config_path: PathBuf,
    backup_path: PathBuf,
    updates_tx: broadcast::Sender<ConfigUpdated>,
}

impl ConfigManager {
    pub fn new(initial: AgentConfig, working_dir: &Path) -> Self {
        let (updates_tx, _) = broadcast::channel(16);
        Self {
            current: RwLock::new(initial),
            config_path: working_dir.join("agent-config.json"),
            backup_path: working_dir.join("agent-config.backup.json"),
            updates_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigUpdated> {
        self.updates_tx.subscribe()
    }

    pub fn current(&self) -> AgentConfig {
        self.current.read().clone()
    }

    /// Structured errors/warnings plus the restart-required flag (spec
    /// §4.8). Does not mutate any state.
    pub fn validate(&self, candidate: &AgentConfig) -> (Vec<String>, Vec<String>, bool) {
        let restart_required = self.current.read().restart_required_vs(candidate);
        match candidate.validate_full() {
            Ok(warnings) => (Vec::new(), warnings, restart_required),
            Err(errors) => (errors, Vec::new(), restart_required),
        }
    }

    /// Runs the validate → backup → atomic-rewrite → swap → publish
    /// sequence (spec §4.8). On any failure from the backup step onward,
    /// restores from the backup slot and propagates the original error.
    pub async fn apply(&self, candidate: AgentConfig, source: ConfigUpdateSource) -> Result<ConfigUpdated> {
        let (errors, _warnings, restart_required) = self.validate(&candidate);
        if !errors.is_empty() {
            return Err(AgentError::configuration(errors.join("; ")));
        }

        let previous = self.current.read().clone();

        if let Err(err) = self.backup().await {
            return Err(err);
        }

        if let Err(err) = self.write_config_file(&candidate).await {
            if let Err(restore_err) = self.restore().await {
                error!(
                    error = %restore_err,
                    "config restore after failed apply also failed; in-memory config is now ahead of disk"
                );
            }
            return Err(err);
        }

        *self.current.write() = candidate.clone();

        let update = ConfigUpdated {
            previous,
            new: candidate,
            timestamp: Utc::now(),
            source,
            restart_required,
        };
        let _ = self.updates_tx.send(update.clone());
        Ok(update)
    }

    /// Copies the current on-disk config to the single backup slot. Exposed
    /// `pub(crate)` so the admin HTTP backup endpoint can call it directly
    /// instead of routing a read-only backup request through `apply`.
    pub(crate) async fn backup(&self) -> Result<()> {
        if tokio::fs::metadata(&self.config_path).await.is_ok() {
            tokio::fs::copy(&self.config_path, &self.backup_path)
                .await
                .map_err(|e| AgentError::configuration(format!("backup failed: {e}")))?;
        }
        Ok(())
    }

    /// Merges `config` into the existing on-disk document and atomically
    /// rewrites it (write-to-temp, rename). Only the `Agent`/`SiemCore`
    /// keys `AgentConfig` recognizes are overwritten — any other content
    /// already in the file survives the rewrite (spec:203).
    async fn write_config_file(&self, config: &AgentConfig) -> Result<()> {
        let mut document = self.read_existing_document().await;
        config
            .merge_into_document(&mut document)
            .map_err(|e| AgentError::configuration(e.to_string()))?;
        let json = serde_json::to_string_pretty(&document)?;
        let tmp_path = self.config_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| AgentError::configuration(format!("failed to write temp config: {e}")))?;
        tokio::fs::rename(&tmp_path, &self.config_path)
            .await
            .map_err(|e| AgentError::configuration(format!("failed to rename temp config into place: {e}")))?;
        set_owner_only_permissions(&self.config_path);
        Ok(())
    }

    /// Reads the current on-disk document for merging, or an empty object
    /// if there is no file yet (first `apply`).
    async fn read_existing_document(&self) -> serde_json::Value {
        match tokio::fs::read_to_string(&self.config_path).await {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!({})),
            Err(_) => serde_json::json!({}),
        }
    }

    /// Copies the backup file back over the current config, reloads, and
    /// emits a restoration event.
    pub async fn restore(&self) -> Result<ConfigUpdated> {
        tokio::fs::copy(&self.backup_path, &self.config_path)
            .await
            .map_err(|e| AgentError::configuration(format!("restore failed: {e}")))?;
        let restored = AgentConfig::from_file(&self.config_path)
            .map_err(|e| AgentError::configuration(e.to_string()))?;
        let previous = self.current.read().clone();
        *self.current.write() = restored.clone();

        let update = ConfigUpdated {
            previous,
            new: restored,
            timestamp: Utc::now(),
            source: ConfigUpdateSource::Restoration,
            restart_required: false,
        };
        let _ = self.updates_tx.send(update.clone());
        Ok(update)
    }
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        if let Err(err) = std::fs::set_permissions(path, perms) {
            warn!(path = %path.display(), error = %err, "failed to restrict config file permissions");
        }
    }
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn apply_writes_file_and_swaps_in_memory_config() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(AgentConfig::default(), dir.path());

        let mut candidate = AgentConfig::default();
        candidate.batch_size = 500;
        let update = manager
            .apply(candidate.clone(), ConfigUpdateSource::AdminPush)
            .await
            .unwrap();

        assert_eq!(manager.current().batch_size, 500);
        assert!(!update.restart_required);

        let on_disk = AgentConfig::from_file(&dir.path().join("agent-config.json")).unwrap();
        assert_eq!(on_disk.batch_size, 500);
    }

    #[tokio::test]
    async fn apply_rejects_invalid_candidate_without_mutating_state() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(AgentConfig::default(), dir.path());

        let mut candidate = AgentConfig::default();
        candidate.batch_size = 0;
        let result = manager.apply(candidate, ConfigUpdateSource::AdminPush).await;

        assert!(result.is_err());
        assert_eq!(manager.current().batch_size, AgentConfig::default().batch_size);
    }

    #[tokio::test]
    async fn restart_required_flagged_when_api_base_url_changes() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(AgentConfig::default(), dir.path());

        let mut candidate = AgentConfig::default();
        candidate.api_base_url = "https://new-collector.example.com".to_string();
        let update = manager
            .apply(candidate, ConfigUpdateSource::AdminPush)
            .await
            .unwrap();
        assert!(update.restart_required);
    }

    #[tokio::test]
    async fn second_apply_backs_up_the_first() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(AgentConfig::default(), dir.path());

        let mut first = AgentConfig::default();
        first.batch_size = 200;
        manager.apply(first, ConfigUpdateSource::AdminPush).await.unwrap();

        let mut second = AgentConfig::default();
        second.batch_size = 300;
        manager.apply(second, ConfigUpdateSource::AdminPush).await.unwrap();

        let backup = AgentConfig::from_file(&dir.path().join("agent-config.backup.json")).unwrap();
        assert_eq!(backup.batch_size, 200);
    }
}
