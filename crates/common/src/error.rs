//! Error types for ghostrunner-common

use thiserror::Error;

/// Result type alias using the common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by connections, signals and session auth
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection '{alias}' was created in thread {owner} and cannot be used from thread {current} unless thread sharing is allowed")]
    ThreadSharing {
        alias: String,
        owner: String,
        current: String,
    },

    #[error("Connection '{alias}' uses unsupported engine: {engine}")]
    Unsupported { alias: String, engine: String },

    #[error("Connection not found: {0}")]
    UnknownAlias(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
