//! Ghostrunner Common Library
//!
//! The application-side collaborators the live-server harness works with:
//! named SQLite connections that know whether they may cross threads, the
//! request-completion signal, and username/password sessions.

pub mod auth;
pub mod db;
pub mod error;
pub mod signals;

// Re-export commonly used types
pub use auth::{AuthSession, Authenticator, SessionAuth, User, SESSION_COOKIE_NAME};
pub use db::{Connections, Database, DatabaseSettings, Engine, ThreadSharing, DEFAULT_ALIAS};
pub use error::{Error, Result};
pub use signals::RequestFinished;

/// Ghostrunner version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything an application is assembled from on one thread
#[derive(Clone)]
pub struct AppContext {
    pub connections: Connections,
    pub request_finished: RequestFinished,
}

impl AppContext {
    /// Lazy connections for `settings`, with the default signal receivers
    pub fn new(settings: &[DatabaseSettings]) -> Self {
        Self {
            connections: Connections::from_settings(settings),
            request_finished: RequestFinished::with_defaults(),
        }
    }
}
