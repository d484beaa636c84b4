//! Error types for the live-server harness

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Could not bind live server on {host} (tried {attempted} port(s)): {reason}")]
    Bind {
        host: String,
        attempted: usize,
        reason: String,
    },

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Login failed for user '{0}'")]
    Authentication(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Unsupported script: {0}")]
    Script(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Browser has exited")]
    BrowserClosed,

    #[error("Cannot revoke connection sharing while the live server is running")]
    SharingInUse,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] ghostrunner_common::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
