//! Browser client capability
//!
//! The harness drives the browser exclusively through [`Browser`]. The
//! shipped adapter is [`DocumentBrowser`], a scriptless document client.

mod cookies;
mod document;
pub(crate) mod script;

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tracing::level_filters::LevelFilter;

use crate::error::E2eResult;

pub use cookies::{BrowserCookie, CookieJar};
pub use document::DocumentBrowser;

/// Launch parameters for a browser client
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Show the window before each test
    pub display: bool,

    /// Bound on every browser call
    pub wait_timeout: Duration,

    /// Verbosity of the client's own request logging
    pub log_level: LevelFilter,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            display: false,
            wait_timeout: Duration::from_secs(10),
            log_level: LevelFilter::ERROR,
        }
    }
}

/// A loaded document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub url: String,
    pub http_status: u16,
    pub headers: BTreeMap<String, String>,
    pub content: String,
}

/// One HTTP exchange performed by a browser call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResource {
    pub url: String,
    pub http_status: u16,
}

/// Field names a bulk fill could not resolve
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FillOutcome {
    pub unresolved: Vec<String>,
}

impl FillOutcome {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// What the harness needs from a browser
pub trait Browser {
    fn launch(options: &BrowserOptions) -> E2eResult<Self>
    where
        Self: Sized;

    /// Navigate to `url` and wait for the document
    fn open(&mut self, url: &str) -> E2eResult<(Page, Vec<HttpResource>)>;

    /// Evaluate a script expression in the current page
    fn evaluate(&mut self, script: &str) -> E2eResult<(Value, Vec<HttpResource>)>;

    fn wait_for_page_loaded(&mut self) -> E2eResult<()>;

    /// Fill the form matched by `selector` in one call.
    ///
    /// Names that match no fillable control are reported back rather than
    /// failing the whole call.
    fn fill(&mut self, selector: &str, fields: &BTreeMap<String, String>) -> E2eResult<FillOutcome>;

    /// Set the value of the first element matched by `selector`; `false` when
    /// nothing matches
    fn set_field_value(&mut self, selector: &str, value: &str) -> E2eResult<bool>;

    fn load_cookies(&mut self, jar: &CookieJar) -> E2eResult<()>;

    fn delete_cookies(&mut self) -> E2eResult<()>;

    fn clear_alert_message(&mut self) -> E2eResult<()>;

    fn show(&mut self) -> E2eResult<()>;

    fn exit(&mut self) -> E2eResult<()>;
}
