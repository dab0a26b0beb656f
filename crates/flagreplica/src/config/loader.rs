use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.database.url.trim().is_empty() {
        return Err(invalid("database.url must not be empty"));
    }

    let backoff = &config.notifications.backoff;
    if backoff.multiplier < 1.0 {
        return Err(invalid(format!(
            "notifications.backoff.multiplier must be >= 1, got {}",
            backoff.multiplier
        )));
    }
    if !(0.0..=1.0).contains(&backoff.jitter) {
        return Err(invalid(format!(
            "notifications.backoff.jitter must be within [0, 1], got {}",
            backoff.jitter
        )));
    }
    if backoff.base_ms > backoff.max_ms {
        return Err(invalid(format!(
            "notifications.backoff.baseMs ({}) exceeds maxMs ({})",
            backoff.base_ms, backoff.max_ms
        )));
    }

    let notifications = &config.notifications;
    if notifications.health_check_timeout_ms >= notifications.health_check_interval_ms {
        return Err(invalid(format!(
            "notifications.healthCheckTimeoutMs ({}) must be below healthCheckIntervalMs ({})",
            notifications.health_check_timeout_ms, notifications.health_check_interval_ms
        )));
    }

    let replica = &config.replica;
    if replica.batch_size == 0 {
        return Err(invalid("replica.batchSize must be > 0"));
    }
    if replica.bus_capacity == 0 {
        return Err(invalid("replica.busCapacity must be > 0"));
    }
    if replica.full_refresh_interval_ms == 0 {
        return Err(invalid("replica.fullRefreshIntervalMs must be > 0"));
    }

    Ok(())
}
