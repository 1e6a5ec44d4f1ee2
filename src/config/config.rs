//! Conductor configuration management
//! Handles loading and saving the YAML config file

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Conductor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Database path
    #[serde(default = "default_db_path")]
    pub database_path: String,

    /// Tool server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Session engine tuning
    #[serde(default)]
    pub engine: EngineConfig,

    /// Claude CLI backend settings
    #[serde(default)]
    pub claude: ClaudeConfig,
}

fn default_db_path() -> String {
    "~/.conductor/conductor.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            server: ServerConfig::default(),
            engine: EngineConfig::default(),
            claude: ClaudeConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9091
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Timings and limits of the session engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// How long streaming text is buffered before one delta notification
    pub delta_flush_interval_ms: u64,
    /// Hard deadline for a stopped backend to finish draining
    pub stop_timeout_ms: u64,
    /// How long delete waits for an aborted turn to tear down
    pub delete_grace_ms: u64,
    /// Period of the missed-completion watchdog on waiting orchestrators
    pub watchdog_interval_ms: u64,
    /// Delay before the single retry of a failed orchestrator resume
    pub resume_retry_delay_ms: u64,
    /// Debounce window of the persistence queue
    pub persist_debounce_ms: u64,
    /// Tool results longer than this many characters are truncated
    pub max_tool_result_chars: usize,
    /// Child output is cut to this many characters in completion records
    pub child_summary_chars: usize,
    /// Capacity of the notification broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delta_flush_interval_ms: 50,
            stop_timeout_ms: 5000,
            delete_grace_ms: 1000,
            watchdog_interval_ms: 5000,
            resume_retry_delay_ms: 1000,
            persist_debounce_ms: 500,
            max_tool_result_chars: 60_000,
            child_summary_chars: 500,
            event_capacity: 2048,
        }
    }
}

impl EngineConfig {
    pub fn delta_flush_interval(&self) -> Duration {
        Duration::from_millis(self.delta_flush_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn delete_grace(&self) -> Duration {
        Duration::from_millis(self.delete_grace_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn resume_retry_delay(&self) -> Duration {
        Duration::from_millis(self.resume_retry_delay_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

/// Claude CLI backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ClaudeConfig {
    /// Path to the `claude` executable; looked up on PATH when unset
    #[serde(default)]
    pub path: Option<String>,
    /// Working directory for spawned agents
    #[serde(default)]
    pub work_dir: Option<String>,
}

impl Config {
    /// Load config from the default location or specified path
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = Self::config_path(path)?;

        if !config_path.exists() {
            info!("Config file not found, creating default at {:?}", config_path);
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = serde_yaml::from_str(&raw).context("Failed to parse config file")?;

        debug!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self, path: Option<&str>) -> Result<()> {
        let config_path = Self::config_path(path)?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(&self)?;
        fs::write(&config_path, content).context("Failed to write config file")?;

        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Get the config file path
    pub fn config_path(path: Option<&str>) -> Result<PathBuf> {
        // Check env override first
        if let Ok(env_path) = std::env::var("CONDUCTOR_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        if let Some(p) = path {
            return Ok(PathBuf::from(p));
        }

        let home = dirs::home_dir().context("Cannot find home directory")?;
        Ok(home.join(".conductor").join("config.yml"))
    }

    /// Resolve database path (expand ~)
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        let raw = &self.database_path;
        if let Some(rest) = raw.strip_prefix('~') {
            let home = dirs::home_dir().context("Cannot find home directory")?;
            return Ok(PathBuf::from(format!("{}{}", home.to_string_lossy(), rest)));
        }
        Ok(PathBuf::from(raw))
    }
}
