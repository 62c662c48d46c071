// SPDX-License-Identifier: MIT
//! Daemon configuration.
//!
//! Priority: CLI / env var  >  `{data_dir}/config.toml`  >  built-in default.

use crate::sync::backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_PORT: u16 = 4400;
const DEFAULT_LEASE_TTL_SECS: u64 = 30;
const DEFAULT_IDLE_TASK_SECS: u64 = 300;
const DEFAULT_IDLE_CONN_SECS: u64 = 900;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── StorageConfig ────────────────────────────────────────────────────────────

/// Durable backend selection (`[storage]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "local" (default) | "http" | "memory".
    /// "memory" keeps nothing across restarts — tests and demos only.
    pub backend: String,
    /// Base URL of the blob service when `backend = "http"`.
    pub http_url: Option<String>,
    /// Bearer token for the blob service. None = unauthenticated.
    pub http_token: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            http_url: None,
            http_token: None,
        }
    }
}

// ─── SnapshotConfig ───────────────────────────────────────────────────────────

/// Snapshot cadence and retry policy (`[snapshot]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Seconds between snapshot passes over a dirty task. Default: 10.
    pub interval_secs: u64,
    /// Snapshots retained per task; older ones are pruned. Default: 5.
    pub keep: usize,
    /// First retry delay after a failed durable write (milliseconds). Default: 500.
    pub backoff_initial_ms: u64,
    /// Cap on any single retry delay (seconds). Default: 30.
    pub backoff_max_secs: u64,
    /// Retries per snapshot pass before deferring to the next cycle.
    /// Default: 6.
    pub backoff_max_retries: u32,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            keep: 5,
            backoff_initial_ms: 500,
            backoff_max_secs: 30,
            backoff_max_retries: 6,
        }
    }
}

impl SnapshotConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            max_delay: Duration::from_secs(self.backoff_max_secs),
            multiplier: 2.0,
            max_retries: Some(self.backoff_max_retries),
        }
    }
}

// ─── BotConfig ────────────────────────────────────────────────────────────────

/// Model-driven labeling bot (`[bot]` in config.toml). When enabled, every
/// opened task gets one bot session talking to `endpoint`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BotConfig {
    pub enabled: bool,
    /// Model inference endpoint: POST task state, receive proposed actions.
    pub endpoint: String,
    /// User id the bot's sessions are recorded under. Default: "bot".
    pub user_id: String,
    /// Quiet period after editor activity before one model call covers the
    /// burst (milliseconds). Default: 500.
    pub debounce_ms: u64,
    /// Model call timeout (seconds). Default: 60.
    pub timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            user_id: "bot".to_string(),
            debounce_ms: 500,
            timeout_secs: 60,
        }
    }
}

impl BotConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 4400).
    port: Option<u16>,
    /// Bind address (default: "127.0.0.1"; use "0.0.0.0" for LAN access).
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,labeld=trace".
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json".
    log_format: Option<String>,
    /// Shared secret for identity-token verification. Empty = no verification.
    auth_secret: Option<String>,
    /// Write-lease TTL in seconds (default: 30).
    lease_ttl_secs: Option<u64>,
    /// Idle window before a sessionless task is snapshotted and evicted
    /// (seconds, default: 300).
    idle_task_secs: Option<u64>,
    /// Idle timeout for a silent Live connection (seconds, default: 900).
    idle_connection_secs: Option<u64>,
    /// Durable backend (`[storage]`).
    storage: Option<StorageConfig>,
    /// Snapshot cadence and retries (`[snapshot]`).
    snapshot: Option<SnapshotConfig>,
    /// Labeling bot (`[bot]`).
    bot: Option<BotConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── DaemonConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" | "json".
    pub log_format: String,
    /// Shared secret for identity tokens (LABELD_SECRET env var).
    /// Empty disables verification — local development only.
    pub auth_secret: String,
    pub lease_ttl_secs: u64,
    pub idle_task_secs: u64,
    pub idle_connection_secs: u64,
    pub storage: StorageConfig,
    pub snapshot: SnapshotConfig,
    pub bot: BotConfig,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let auth_secret = std::env::var("LABELD_SECRET")
            .ok()
            .or(toml.auth_secret)
            .unwrap_or_default();

        Self {
            port: port.or(toml.port).unwrap_or(DEFAULT_PORT),
            bind_address: bind_address
                .or(toml.bind_address)
                .unwrap_or_else(default_bind_address),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            log_format: toml.log_format.unwrap_or_else(|| "pretty".to_string()),
            auth_secret,
            lease_ttl_secs: toml.lease_ttl_secs.unwrap_or(DEFAULT_LEASE_TTL_SECS),
            idle_task_secs: toml.idle_task_secs.unwrap_or(DEFAULT_IDLE_TASK_SECS),
            idle_connection_secs: toml
                .idle_connection_secs
                .unwrap_or(DEFAULT_IDLE_CONN_SECS),
            storage: toml.storage.unwrap_or_default(),
            snapshot: toml.snapshot.unwrap_or_default(),
            bot: toml.bot.unwrap_or_default(),
            data_dir,
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(1))
    }

    pub fn idle_task_window(&self) -> Duration {
        Duration::from_secs(self.idle_task_secs.max(1))
    }

    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_secs.max(1))
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("labeld");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("labeld");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("labeld");
        }
    }
    PathBuf::from(".").join("labeld-data")
}
