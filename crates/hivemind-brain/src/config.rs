// ABOUTME: Configuration for the brain hub: socket location, timeouts, and capacity limits.
// ABOUTME: Loaded from a TOML file where every field has a default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    /// Unix socket the hub listens on. `~` is expanded.
    pub socket_path: String,
    /// Seconds a relayed action may wait for the supervising process.
    pub action_timeout_secs: u64,
    /// Outstanding actions allowed before relays fail fast.
    pub action_queue_capacity: usize,
    /// Events buffered per subscriber before the oldest are dropped.
    pub event_buffer_capacity: usize,
    /// Subscribers that have not polled for this many seconds are pruned.
    pub subscriber_max_age_secs: u64,
    /// Seconds between subscriber pruning passes.
    pub prune_interval_secs: u64,
    /// Agents whose status is older than this many seconds are dropped.
    pub stale_agent_secs: u64,
    /// Messages kept per repository.
    pub max_messages: usize,
    /// Socket I/O deadline for one connection, measured from accept.
    pub connection_timeout_secs: u64,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            socket_path: "~/.hivemind/hivemind.sock".to_string(),
            action_timeout_secs: 30,
            action_queue_capacity: 16,
            event_buffer_capacity: 1000,
            subscriber_max_age_secs: 300,
            prune_interval_secs: 60,
            stale_agent_secs: 3600,
            max_messages: 50,
            connection_timeout_secs: 35,
        }
    }
}

impl BrainConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: BrainConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Default config file path (~/.config/hivemind/brain.toml)
    pub fn default_path() -> PathBuf {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("hivemind")
            .join("brain.toml")
    }

    pub fn socket_path_expanded(&self) -> PathBuf {
        shellexpand::tilde(&self.socket_path).into_owned().into()
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn subscriber_max_age(&self) -> Duration {
        Duration::from_secs(self.subscriber_max_age_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }

    pub fn stale_agent_age(&self) -> Duration {
        Duration::from_secs(self.stale_agent_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}
