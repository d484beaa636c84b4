//! Class-level test environment: live server, shared connections, browser

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use ghostrunner_common::signals::{Receiver, CLOSE_CONNECTIONS};
use ghostrunner_common::{AppContext, AuthSession, Authenticator, Connections, Database};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::browser::{Browser, DocumentBrowser, HttpResource, Page};
use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::form::{fill_form, FillReport, FormFillRequest};
use crate::server::{AppFactory, ServerHandle, ServerThread};
use crate::session::bridge_session;
use crate::shared::SharedConnectionSet;

/// Global that base templates fill with uncaught script errors
pub const JS_ERRORS_GLOBAL: &str = "window.__webdriver_javascript_errors";

/// Savepoint wrapped around each test on every shared connection
const TEST_SAVEPOINT: &str = "ghostrunner_test";

/// Builder for a [`TestEnvironment`]
pub struct EnvironmentBuilder<B: Browser = DocumentBrowser> {
    config: HarnessConfig,
    context: AppContext,
    app: AppFactory,
    authenticator: Option<Arc<dyn Authenticator>>,
    _browser: PhantomData<B>,
}

impl<B: Browser> EnvironmentBuilder<B> {
    pub fn new(context: AppContext, app: AppFactory) -> Self {
        Self {
            config: HarnessConfig::default(),
            context,
            app,
            authenticator: None,
            _browser: PhantomData,
        }
    }

    pub fn config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    /// Login path used by [`TestEnvironment::set_session_cookie`]
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Drive the environment with a different browser client
    pub fn browser<C: Browser>(self) -> EnvironmentBuilder<C> {
        EnvironmentBuilder {
            config: self.config,
            context: self.context,
            app: self.app,
            authenticator: self.authenticator,
            _browser: PhantomData,
        }
    }

    /// Start the live server and launch the browser.
    ///
    /// On failure everything already started is torn down before the error
    /// is returned.
    pub fn start(self) -> E2eResult<TestEnvironment<B>> {
        let spec = self.config.address_spec()?;

        // Closing connections after each request would close the shared ones.
        let close_connections = self.context.request_finished.disconnect(CLOSE_CONNECTIONS);
        let shared = SharedConnectionSet::enable(&self.context.connections);
        let thread = ServerThread::new(&spec.host, spec.candidates(), &self.context, &shared, self.app);

        let mut live = LiveServer {
            context: self.context,
            close_connections,
            shared: Some(shared),
            server: None,
        };

        let addr = match thread.start().and_then(|server| {
            let ready = server.wait_ready(self.config.startup_timeout);
            live.server = Some(server);
            ready
        }) {
            Ok(addr) => addr,
            Err(e) => {
                error!("Live server failed to start on {}: {}", spec, e);
                if let Err(teardown) = live.teardown() {
                    warn!("Teardown after failed start: {}", teardown);
                }
                return Err(e);
            }
        };

        let live_server_url = format!("http://{}:{}", spec.host, addr.port());
        let browser = B::launch(&self.config.browser_options())?;
        info!("Test environment ready at {}", live_server_url);

        Ok(TestEnvironment {
            config: self.config,
            host: spec.host,
            live_server_url,
            authenticator: self.authenticator,
            live,
            browser,
            stopped: false,
        })
    }
}

/// Server-side half of the environment, torn down in reverse order of setup
struct LiveServer {
    context: AppContext,
    close_connections: Option<Receiver>,
    shared: Option<SharedConnectionSet>,
    server: Option<ServerHandle>,
}

impl LiveServer {
    /// Join the server, stop sharing, re-attach the connection-closing
    /// receiver. Safe to call repeatedly and after partial setup.
    fn teardown(&mut self) -> E2eResult<()> {
        let mut result = Ok(());

        if let Some(server) = self.server.as_mut() {
            if let Err(e) = server.stop() {
                warn!("Live server did not stop cleanly: {}", e);
                result = Err(e);
            }
        }

        if let Some(mut shared) = self.shared.take() {
            if let Err(e) = shared.disable() {
                result = result.and(Err(e));
            }
        }
        self.server = None;

        if let Some(receiver) = self.close_connections.take() {
            self.context.request_finished.connect(CLOSE_CONNECTIONS, receiver);
        }
        result
    }
}

impl Drop for LiveServer {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

/// A running live server plus the browser that tests drive against it.
///
/// One environment serves every test of a class; run each test through
/// [`TestEnvironment::test`] so per-test cleanup happens.
pub struct TestEnvironment<B: Browser = DocumentBrowser> {
    config: HarnessConfig,
    host: String,
    live_server_url: String,
    authenticator: Option<Arc<dyn Authenticator>>,
    live: LiveServer,
    browser: B,
    stopped: bool,
}

impl TestEnvironment {
    pub fn builder(context: AppContext, app: AppFactory) -> EnvironmentBuilder {
        EnvironmentBuilder::new(context, app)
    }
}

impl<B: Browser> TestEnvironment<B> {
    /// Run one test between the per-test hooks.
    ///
    /// Database writes made during `body`, by the test or by the live server,
    /// are rolled back afterwards. Cookies and pending alerts are cleared. All
    /// of this happens even if `body` panics; the panic is resumed afterwards.
    pub fn test<R>(&mut self, body: impl FnOnce(&mut Self) -> R) -> R {
        if self.config.display {
            if let Err(e) = self.browser.show() {
                warn!("Could not show browser: {}", e);
            }
        }

        let savepoints = self.open_test_savepoints();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));

        if let Err(e) = self.browser.delete_cookies() {
            warn!("Could not delete cookies: {}", e);
        }
        if let Err(e) = self.browser.clear_alert_message() {
            warn!("Could not clear alert: {}", e);
        }
        for db in savepoints {
            if let Err(e) = db.rollback_to_savepoint(TEST_SAVEPOINT) {
                warn!("Could not roll back '{}' after test: {}", db.alias(), e);
            }
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    fn open_test_savepoints(&self) -> Vec<Database> {
        let Some(shared) = self.live.shared.as_ref() else {
            return Vec::new();
        };
        shared
            .databases()
            .filter(|db| match db.savepoint(TEST_SAVEPOINT) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Could not isolate '{}' for the test: {}", db.alias(), e);
                    false
                }
            })
            .cloned()
            .collect()
    }

    /// Open `path` on the live server
    pub fn open(&mut self, path: &str) -> E2eResult<(Page, Vec<HttpResource>)> {
        let url = format!("{}{}", self.live_server_url, path);
        self.browser.open(&url)
    }

    pub fn evaluate(&mut self, script: &str) -> E2eResult<Value> {
        self.browser.evaluate(script).map(|(value, _)| value)
    }

    /// Current path including the fragment
    pub fn path(&mut self) -> E2eResult<String> {
        match self.evaluate("location.pathname + location.hash")? {
            Value::String(path) => Ok(path),
            other => Ok(other.to_string()),
        }
    }

    /// Script errors recorded by the page; empty when the page records none.
    ///
    /// Browsers that do not run page scripts return [`E2eError::Script`].
    pub fn js_errors(&mut self) -> E2eResult<Vec<String>> {
        let errors = match self.evaluate(JS_ERRORS_GLOBAL)? {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            Value::String(s) => vec![s],
            other => vec![other.to_string()],
        };
        Ok(errors)
    }

    pub fn fill_form(&mut self, request: &FormFillRequest) -> E2eResult<FillReport> {
        fill_form(&mut self.browser, request)
    }

    /// Log in on this thread and give the browser the session cookie
    pub fn set_session_cookie(&mut self, username: &str, password: &str) -> E2eResult<AuthSession> {
        let auth = self
            .authenticator
            .clone()
            .ok_or_else(|| E2eError::Configuration("no authenticator configured".to_string()))?;
        bridge_session(&mut self.browser, auth.as_ref(), &self.host, username, password)
    }

    pub fn live_server_url(&self) -> &str {
        &self.live_server_url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn browser(&self) -> &B {
        &self.browser
    }

    pub fn browser_mut(&mut self) -> &mut B {
        &mut self.browser
    }

    /// Connections of the test thread, shared with the live server where the
    /// engine allows it
    pub fn connections(&self) -> &Connections {
        &self.live.context.connections
    }

    /// Aliases currently shared with the live server
    pub fn shared_aliases(&self) -> Vec<String> {
        self.live
            .shared
            .as_ref()
            .map(|s| s.aliases().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn server(&self) -> Option<&ServerHandle> {
        self.live.server.as_ref()
    }

    /// Stop the server, stop sharing, exit the browser. Idempotent.
    pub fn stop(&mut self) -> E2eResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        info!("Tearing down test environment at {}", self.live_server_url);
        let result = self.live.teardown();
        if let Err(e) = self.browser.exit() {
            warn!("Browser did not exit cleanly: {}", e);
        }
        result
    }
}

impl<B: Browser> Drop for TestEnvironment<B> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
