//! Ghostrunner E2E Harness
//!
//! Runs a web application on a background thread of the test process and
//! drives it with a browser client from the test thread:
//! - Negotiates a free port from a `host:ranges` address spec
//! - Shares the test thread's SQLite connections with the server thread, so
//!   fixtures and assertions see what the browser wrote
//! - Bridges sessions by logging in on the test thread and handing the
//!   browser the session cookie
//! - Fills forms in bulk, falling back field by field
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Test thread (TestEnvironment)               │
//! │    ├── AddressSpec::parse(addr) -> candidates               │
//! │    ├── SharedConnectionSet::enable(connections)             │
//! │    ├── ServerThread::start() -> ServerHandle::wait_ready()  │
//! │    ├── Browser::launch(options)                             │
//! │    ├── test(|env| ...)   open / evaluate / fill_form        │
//! │    └── stop()            join, disable sharing, exit        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 Server thread ("live-server")               │
//! │    ├── bind first free candidate                            │
//! │    ├── current-thread tokio runtime                         │
//! │    └── accept loop: hyper-util connection -> axum Router    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod address;
pub mod browser;
pub mod config;
pub mod environment;
pub mod error;
pub mod form;
pub mod logging;
pub mod server;
pub mod session;
pub mod shared;

pub use address::{AddressSpec, PortRange, DEFAULT_ADDRESS};
pub use browser::{Browser, BrowserCookie, BrowserOptions, CookieJar, DocumentBrowser, FillOutcome, HttpResource, Page};
pub use config::HarnessConfig;
pub use environment::{EnvironmentBuilder, TestEnvironment};
pub use error::{E2eError, E2eResult};
pub use form::{fill_form, FillReport, FillStrategy, FormFillRequest};
pub use server::{AppFactory, ServerHandle, ServerPhase, ServerThread};
pub use session::bridge_session;
pub use shared::SharedConnectionSet;
