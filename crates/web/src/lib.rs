//! Ghostrunner Web
//!
//! Small notes application used to exercise the live-server harness: a
//! landing page, username/password login backed by server-side sessions,
//! and a notes form.

pub mod error;
pub mod notes;
pub mod server;

pub use error::WebError;
pub use notes::{Note, NoteStore};
pub use server::{app, install_schema, WebServer};
