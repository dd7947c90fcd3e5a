//! Configuration management for agent-sync

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub timeline: TimelineConfig,
    pub hitl: HitlConfig,
    pub workspace: WorkspaceConfig,
    pub conversations: ConversationsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    /// Events fetched per page (initial load and each backward page)
    pub page_size: usize,
    /// Maximum events retained in memory for the live conversation
    pub max_events: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_events: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HitlConfig {
    /// Interval of the timeout checker in milliseconds
    pub check_interval_ms: u64,
    /// Timeout applied when a request does not carry `timeout_seconds`
    pub default_timeout_secs: u64,
    /// Answered/expired requests kept for display
    pub history_capacity: usize,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            default_timeout_secs: 300,
            history_capacity: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Snapshots of inactive conversations kept before LRU eviction
    pub max_cached_conversations: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            max_cached_conversations: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationsConfig {
    /// Page size for listing conversations
    pub list_limit: usize,
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self { list_limit: 50 }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config {}", path.display()))?;
            tracing::debug!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "agent-sync") {
            let config_dir = proj_dirs.config_dir();
            std::fs::create_dir_all(config_dir)?;
            Ok(config_dir.join("config.toml"))
        } else {
            Ok(PathBuf::from("config.toml"))
        }
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let config = Config::load_from(&temp.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.timeline.page_size, 50);
        assert_eq!(config.timeline.max_events, 2000);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[timeline]\nmax_events = 100\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.timeline.max_events, 100);
        assert_eq!(config.timeline.page_size, 50);
        assert_eq!(config.hitl.check_interval_ms, 1000);
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let mut config = Config::default();
        config.hitl.history_capacity = 5;
        config.save_to(&path).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "timeline = 3").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
