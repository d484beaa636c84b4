//! Two-tier form filling: one bulk call, then per-field fallback

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::browser::script::submit_expression;
use crate::browser::Browser;
use crate::error::E2eResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormFillRequest {
    /// CSS selector of the form
    pub selector: String,
    pub fields: BTreeMap<String, String>,
    pub submit: bool,
}

impl FormFillRequest {
    /// A request for the form at `selector`. The form is submitted after
    /// filling unless [`FormFillRequest::submit`] turns it off.
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            fields: BTreeMap::new(),
            submit: true,
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn submit(mut self, submit: bool) -> Self {
        self.submit = submit;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStrategy {
    Bulk,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillReport {
    pub strategy: FillStrategy,
    pub filled: Vec<String>,
    pub skipped: Vec<String>,
}

/// Fill `request.fields` into the form, submitting it afterwards when asked.
///
/// Only submission errors propagate. A field that matches neither an `input`
/// nor a `textarea` is skipped.
pub fn fill_form<B: Browser + ?Sized>(browser: &mut B, request: &FormFillRequest) -> E2eResult<FillReport> {
    let report = match browser.fill(&request.selector, &request.fields) {
        Ok(outcome) if outcome.is_complete() => FillReport {
            strategy: FillStrategy::Bulk,
            filled: request.fields.keys().cloned().collect(),
            skipped: Vec::new(),
        },
        Ok(outcome) => {
            debug!(
                "Bulk fill of {} left {:?} unresolved, filling field by field",
                request.selector, outcome.unresolved
            );
            fill_each(browser, request)
        }
        Err(e) => {
            debug!("Bulk fill of {} failed ({}), filling field by field", request.selector, e);
            fill_each(browser, request)
        }
    };

    if !report.skipped.is_empty() {
        warn!("Skipped fields {:?} in {}", report.skipped, request.selector);
    }

    if request.submit {
        browser.evaluate(&submit_expression(&request.selector))?;
        browser.wait_for_page_loaded()?;
    }
    Ok(report)
}

fn fill_each<B: Browser + ?Sized>(browser: &mut B, request: &FormFillRequest) -> FillReport {
    let mut report = FillReport {
        strategy: FillStrategy::Fallback,
        filled: Vec::new(),
        skipped: Vec::new(),
    };

    for (name, value) in &request.fields {
        let found = ["input", "textarea"].iter().any(|tag| {
            let selector = format!("{}[name=\"{}\"]", tag, escape_attr(name));
            browser.set_field_value(&selector, value).unwrap_or_else(|e| {
                debug!("Could not set {}: {}", selector, e);
                false
            })
        });

        if found {
            report.filled.push(name.clone());
        } else {
            report.skipped.push(name.clone());
        }
    }
    report
}

fn escape_attr(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
