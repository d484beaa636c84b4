//! Harness configuration, read from the environment

use std::time::Duration;
use tracing::level_filters::LevelFilter;

use crate::address::{AddressSpec, DEFAULT_ADDRESS};
use crate::browser::BrowserOptions;
use crate::error::{E2eError, E2eResult};

pub const ADDRESS_ENV: &str = "GHOSTRUNNER_LIVE_SERVER_ADDRESS";
pub const DISPLAY_ENV: &str = "GHOSTRUNNER_DISPLAY";
pub const LOG_LEVEL_ENV: &str = "GHOSTRUNNER_LOG_LEVEL";
pub const WAIT_TIMEOUT_ENV: &str = "GHOSTRUNNER_WAIT_TIMEOUT";
pub const STARTUP_TIMEOUT_ENV: &str = "GHOSTRUNNER_STARTUP_TIMEOUT";

/// Configuration for one test environment
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Live-server address spec (`host:ranges`); parsed at start
    pub address: String,

    /// Show the browser window before each test
    pub display: bool,

    /// Verbosity of the browser client's own logging
    pub log_level: LevelFilter,

    /// Timeout applied to every browser call
    pub wait_timeout: Duration,

    /// Upper bound on the wait for the server thread's readiness
    pub startup_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            display: false,
            log_level: LevelFilter::ERROR,
            wait_timeout: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

impl HarnessConfig {
    /// Defaults overridden by `GHOSTRUNNER_*` variables
    pub fn from_env() -> E2eResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> E2eResult<Self> {
        let mut cfg = Self::default();
        let var = |key: &str| {
            lookup(key).and_then(|v| {
                let v = v.trim().to_string();
                if v.is_empty() { None } else { Some(v) }
            })
        };

        if let Some(address) = var(ADDRESS_ENV) {
            cfg.address = address;
        }
        if let Some(display) = var(DISPLAY_ENV) {
            cfg.display = parse_flag(DISPLAY_ENV, &display)?;
        }
        if let Some(level) = var(LOG_LEVEL_ENV) {
            cfg.log_level = parse_level(&level)?;
        }
        if let Some(secs) = var(WAIT_TIMEOUT_ENV) {
            cfg.wait_timeout = parse_secs(WAIT_TIMEOUT_ENV, &secs)?;
        }
        if let Some(secs) = var(STARTUP_TIMEOUT_ENV) {
            cfg.startup_timeout = parse_secs(STARTUP_TIMEOUT_ENV, &secs)?;
        }
        Ok(cfg)
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn address_spec(&self) -> E2eResult<AddressSpec> {
        AddressSpec::parse(&self.address)
    }

    pub fn browser_options(&self) -> BrowserOptions {
        BrowserOptions {
            display: self.display,
            wait_timeout: self.wait_timeout,
            log_level: self.log_level,
        }
    }
}

fn parse_flag(key: &str, value: &str) -> E2eResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(E2eError::Configuration(format!("{} must be a boolean, got '{}'", key, value))),
    }
}

fn parse_secs(key: &str, value: &str) -> E2eResult<Duration> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| E2eError::Configuration(format!("{} must be whole seconds, got '{}'", key, value)))
}

fn parse_level(value: &str) -> E2eResult<LevelFilter> {
    match value.to_ascii_lowercase().as_str() {
        "critical" => Ok(LevelFilter::ERROR),
        other => other.parse::<LevelFilter>().map_err(|_| {
            E2eError::Configuration(format!("{} must be a log level, got '{}'", LOG_LEVEL_ENV, value))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = HarnessConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.address, "localhost:9000-9200");
        assert!(!cfg.display);
        assert_eq!(cfg.log_level, LevelFilter::ERROR);
        assert_eq!(cfg.wait_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let cfg = HarnessConfig::from_lookup(lookup(&[
            (ADDRESS_ENV, "127.0.0.1:8090-9000"),
            (DISPLAY_ENV, "yes"),
            (LOG_LEVEL_ENV, "debug"),
            (WAIT_TIMEOUT_ENV, "3"),
            (STARTUP_TIMEOUT_ENV, " "),
        ]))
        .unwrap();

        assert_eq!(cfg.address_spec().unwrap().host, "127.0.0.1");
        assert!(cfg.display);
        assert_eq!(cfg.log_level, LevelFilter::DEBUG);
        assert_eq!(cfg.wait_timeout, Duration::from_secs(3));
        assert_eq!(cfg.startup_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_malformed_values() {
        for (key, value) in [
            (DISPLAY_ENV, "maybe"),
            (LOG_LEVEL_ENV, "loud"),
            (WAIT_TIMEOUT_ENV, "ten"),
        ] {
            let err = HarnessConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(matches!(err, E2eError::Configuration(_)), "{key}={value}");
        }
    }
}
