use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] crate::source::SourceError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Event log error: {0}")]
    EventLog(#[from] crate::eventlog::EventLogError),

    #[error("Replication error: {0}")]
    Replicator(#[from] crate::eventlog::ReplicatorError),

    #[error("Invalid overrides: {0}")]
    Validation(#[from] crate::model::ValidationError),

    #[error("Replica is already running")]
    AlreadyStarted,

    #[error("Replica has been stopped and cannot be restarted")]
    Stopped,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

pub type Result<T> = std::result::Result<T, ReplicaError>;
