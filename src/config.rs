//! Engine configuration
//!
//! Loaded from `config.json` in the config directory (or a path given on the
//! command line). Every field has a default, so an empty object or a missing
//! file is a valid configuration.

use crate::core::error::{Error, Result};
use crate::core::render::{BackendKind, RenderSettings};
use crate::utils::{get_config_dir, get_state_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for `timeout_secs`
pub const MAX_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Firewall backend driven by `apply`
    #[serde(default)]
    pub backend: BackendKind,
    /// Where snapshots are stored
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    /// Snapshots kept per backend after a successful apply
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// Budget for one apply transaction and for each native tool call
    ///
    /// Clamped to 1..=3600 seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Cross-process apply lock
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
    #[serde(default = "default_nft_table")]
    pub nft_table: String,
    #[serde(default = "default_firewalld_zone")]
    pub firewalld_zone: String,
    /// Append privileged operations to the JSON-lines audit log
    #[serde(default = "default_true")]
    pub audit_log: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            snapshot_dir: default_snapshot_dir(),
            retention: default_retention(),
            timeout_secs: default_timeout(),
            lock_path: default_lock_path(),
            nft_table: default_nft_table(),
            firewalld_zone: default_firewalld_zone(),
            audit_log: true,
        }
    }
}

fn state_path(name: &str) -> PathBuf {
    get_state_dir()
        .unwrap_or_else(|| std::env::temp_dir().join("hostwall"))
        .join(name)
}

fn default_snapshot_dir() -> PathBuf {
    state_path("snapshots")
}

fn default_lock_path() -> PathBuf {
    state_path("apply.lock")
}

fn default_retention() -> usize {
    5
}

fn default_timeout() -> u64 {
    30
}

fn default_nft_table() -> String {
    "hostwall".to_string()
}

fn default_firewalld_zone() -> String {
    "public".to_string()
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.clamp(1, MAX_TIMEOUT_SECS))
    }

    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            nft_table: self.nft_table.clone(),
            firewalld_zone: self.firewalld_zone.clone(),
        }
    }

    /// Checks names that end up in native object names and file paths.
    pub fn validate(&self) -> Result<()> {
        crate::validators::validate_identifier(&self.nft_table)
            .map_err(|e| Error::Config(format!("nft_table: {e}")))?;
        crate::validators::validate_identifier(&self.firewalld_zone)
            .map_err(|e| Error::Config(format!("firewalld_zone: {e}")))?;
        if self.retention == 0 {
            return Err(Error::Config("retention must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Default location of the configuration file
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the configuration, or the defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists but cannot be read, parsed or
/// validated.
pub async fn load_config(path: &Path) -> Result<EngineConfig> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(EngineConfig::default());
        }
        Err(e) => return Err(Error::Config(format!("{}: {e}", path.display()))),
    };

    let config: EngineConfig = serde_json::from_str(&json)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Saves the configuration using an atomic write pattern.
/// 1. Writes to a temporary file created with mode 0600.
/// 2. Syncs it to disk.
/// 3. Atomically renames it over the target path.
pub async fn save_config(config: &EngineConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        crate::utils::ensure_dir(parent)?;
    }
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || crate::utils::write_atomic(&path, json.as_bytes()))
        .await
        .map_err(|e| Error::Internal(format!("config writer panicked: {e}")))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.json")).await.unwrap();
        assert_eq!(config.backend, BackendKind::Nftables);
        assert_eq!(config.retention, 5);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.nft_table, "hostwall");
        assert_eq!(config.firewalld_zone, "public");
        assert!(config.audit_log);
    }

    #[tokio::test]
    async fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config(&path).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_table_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"nft_table": "bad name; flush ruleset"}"#).unwrap();
        assert!(matches!(load_config(&path).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let config = EngineConfig {
            backend: BackendKind::Ufw,
            retention: 2,
            ..EngineConfig::default()
        };
        save_config(&config, &path).await.unwrap();
        assert_eq!(load_config(&path).await.unwrap(), config);
    }

    #[test]
    fn test_timeout_is_clamped() {
        let mut config = EngineConfig {
            timeout_secs: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.timeout(), Duration::from_secs(1));
        config.timeout_secs = u64::MAX;
        assert_eq!(config.timeout(), Duration::from_secs(MAX_TIMEOUT_SECS));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"backend": "iptables"}"#).unwrap();
        assert_eq!(config.backend, BackendKind::Iptables);
        assert_eq!(config.retention, 5);
    }
}
