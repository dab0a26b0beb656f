use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::db::default_database_path;
use crate::replica::ReplicaSettings;
use crate::source::{DumpFilter, PoolSettings};
use crate::transport::{BackoffPolicy, TransportSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub version: String,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub replica: ReplicaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

impl DatabaseConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            url: self.url.clone(),
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsConfig {
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_channel() -> String {
    "config_changes".to_string()
}

fn default_health_check_interval_ms() -> u64 {
    15_000
}

fn default_health_check_timeout_ms() -> u64 {
    3_000
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            backoff: BackoffConfig::default(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl NotificationsConfig {
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            backoff: self.backoff.policy(),
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            health_check_timeout: Duration::from_millis(self.health_check_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            ..TransportSettings::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_ms() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            multiplier: default_multiplier(),
            max_ms: default_max_ms(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_ms),
            multiplier: self.multiplier,
            max: Duration::from_millis(self.max_ms),
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaMode {
    /// Refetch notified variants, reload everything periodically.
    #[default]
    Polling,
    /// Follow a local event log; resume from the checkpoint on restart.
    Durable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaConfig {
    #[serde(default)]
    pub mode: ReplicaMode,
    #[serde(default = "default_full_refresh_interval_ms")]
    pub full_refresh_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
    /// Local SQLite file of the durable mode.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    #[serde(default = "default_log_retention_ms")]
    pub log_retention_ms: u64,
    /// Replicate a single project instead of all of them.
    #[serde(default)]
    pub project_id: Option<String>,
}

fn default_full_refresh_interval_ms() -> u64 {
    60_000
}

fn default_batch_size() -> usize {
    100
}

fn default_idle_interval_ms() -> u64 {
    1_000
}

fn default_bus_capacity() -> usize {
    256
}

fn default_log_retention_ms() -> u64 {
    86_400_000
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            mode: ReplicaMode::default(),
            full_refresh_interval_ms: default_full_refresh_interval_ms(),
            batch_size: default_batch_size(),
            idle_interval_ms: default_idle_interval_ms(),
            bus_capacity: default_bus_capacity(),
            cache_path: None,
            log_retention_ms: default_log_retention_ms(),
            project_id: None,
        }
    }
}

impl ReplicaConfig {
    /// The configured cache path, else the per-user default.
    pub fn resolved_cache_path(&self) -> Option<PathBuf> {
        self.cache_path.clone().or_else(default_database_path)
    }

    pub fn log_retention(&self) -> Duration {
        Duration::from_millis(self.log_retention_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    pub fn replica_settings(&self) -> ReplicaSettings {
        ReplicaSettings {
            channel: self.notifications.channel.clone(),
            full_refresh_interval: Duration::from_millis(self.replica.full_refresh_interval_ms),
            batch_size: self.replica.batch_size,
            idle_interval: Duration::from_millis(self.replica.idle_interval_ms),
            filter: DumpFilter {
                project_id: self.replica.project_id.clone(),
            },
        }
    }
}
