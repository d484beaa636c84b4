//! Scriptless document client: blocking HTTP plus an HTML parser

use std::collections::{BTreeMap, HashMap};

use reqwest::blocking::Client;
use reqwest::header::{COOKIE, LOCATION, SET_COOKIE};
use reqwest::{Method, StatusCode};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::{debug, Level};
use url::Url;

use super::script::{self, Access, LocationPart, Term};
use super::{Browser, BrowserOptions, CookieJar, FillOutcome, HttpResource, Page};
use crate::error::{E2eError, E2eResult};

const MAX_REDIRECTS: usize = 10;

/// Client-side state of one form control
#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldState {
    Value(String),
    Checked(bool),
}

struct LoadedPage {
    url: Url,
    status: u16,
    headers: BTreeMap<String, String>,
    source: String,
    /// Keyed by the control's position in document order
    fields: HashMap<usize, FieldState>,
}

impl LoadedPage {
    fn document(&self) -> Html {
        Html::parse_document(&self.source)
    }

    fn to_page(&self) -> Page {
        Page {
            url: self.url.to_string(),
            http_status: self.status,
            headers: self.headers.clone(),
            content: self.source.clone(),
        }
    }

    fn term_value(&self, doc: &Html, term: &Term) -> E2eResult<Value> {
        let value = match term {
            Term::Literal(s) => Value::String(s.clone()),
            Term::Title => Value::String(title(doc)),
            Term::Global(name) => {
                return Err(E2eError::Script(format!(
                    "window.{} is only set by running page scripts, which this browser does not do",
                    name
                )))
            }
            Term::Location(part) => Value::String(match part {
                LocationPart::Href => self.url.to_string(),
                LocationPart::Pathname => self.url.path().to_string(),
                LocationPart::Hash => self.url.fragment().map(|f| format!("#{}", f)).unwrap_or_default(),
                LocationPart::Search => self.url.query().map(|q| format!("?{}", q)).unwrap_or_default(),
            }),
            Term::Query { selector, access } => {
                let query = parse_selector(selector)?;
                let el = doc
                    .select(&query)
                    .next()
                    .ok_or_else(|| E2eError::ElementNotFound(selector.clone()))?;
                match access {
                    Access::InnerHtml => Value::String(el.inner_html()),
                    Access::TextContent => Value::String(el.text().collect()),
                    Access::Value => control_value(el, node_index(doc, el), &self.fields)
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                    Access::Attribute(name) => el
                        .value()
                        .attr(name)
                        .map(|v| Value::String(v.to_string()))
                        .unwrap_or(Value::Null),
                    Access::Submit => return Err(E2eError::Script(format!("{}.submit() has no value", selector))),
                }
            }
        };
        Ok(value)
    }
}

/// Browser that fetches documents over HTTP and parses them without running
/// scripts
pub struct DocumentBrowser {
    client: Client,
    options: BrowserOptions,
    cookies: CookieJar,
    page: Option<LoadedPage>,
    closed: bool,
}

impl DocumentBrowser {
    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn current_url(&self) -> Option<&Url> {
        self.page.as_ref().map(|p| &p.url)
    }

    fn ensure_open(&self) -> E2eResult<()> {
        if self.closed {
            return Err(E2eError::BrowserClosed);
        }
        Ok(())
    }

    fn page(&self) -> E2eResult<&LoadedPage> {
        self.page
            .as_ref()
            .ok_or_else(|| E2eError::Browser("no page loaded".to_string()))
    }

    fn page_mut(&mut self) -> E2eResult<&mut LoadedPage> {
        self.page
            .as_mut()
            .ok_or_else(|| E2eError::Browser("no page loaded".to_string()))
    }

    fn request_error(&self, err: reqwest::Error, url: &Url) -> E2eError {
        if err.is_timeout() {
            E2eError::Timeout(format!("{} after {:?}", url, self.options.wait_timeout))
        } else {
            E2eError::Http(err)
        }
    }

    /// Perform a request, following redirects by hand so every hop's
    /// `Set-Cookie` lands in the jar
    fn navigate(
        &mut self,
        method: Method,
        url: Url,
        form: Option<Vec<(String, String)>>,
    ) -> E2eResult<(Page, Vec<HttpResource>)> {
        let mut method = method;
        let mut url = url;
        let mut form = form;
        let mut resources = Vec::new();

        for _ in 0..=MAX_REDIRECTS {
            let mut wire_url = url.clone();
            wire_url.set_fragment(None);
            let mut request = self.client.request(method.clone(), wire_url);
            if let Some(cookie) = self.cookies.header_for(&url) {
                request = request.header(COOKIE, cookie);
            }
            if let Some(pairs) = &form {
                request = request.form(pairs);
            }

            let response = request.send().map_err(|e| self.request_error(e, &url))?;
            let status = response.status();
            if self.options.log_level >= Level::DEBUG {
                debug!("{} {} -> {}", method, url, status.as_u16());
            }
            resources.push(HttpResource {
                url: url.to_string(),
                http_status: status.as_u16(),
            });

            for value in response.headers().get_all(SET_COOKIE) {
                if let Ok(header) = value.to_str() {
                    self.cookies.store_set_cookie(header, &url);
                }
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if let (true, Some(location)) = (status.is_redirection(), location) {
                url = url
                    .join(&location)
                    .map_err(|e| E2eError::Browser(format!("bad redirect '{}': {}", location, e)))?;
                if status != StatusCode::TEMPORARY_REDIRECT && status != StatusCode::PERMANENT_REDIRECT {
                    method = Method::GET;
                    form = None;
                }
                continue;
            }

            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                .collect();
            let source = response.text().map_err(|e| self.request_error(e, &url))?;

            let loaded = LoadedPage {
                url,
                status: status.as_u16(),
                headers,
                source,
                fields: HashMap::new(),
            };
            let page = loaded.to_page();
            self.page = Some(loaded);
            return Ok((page, resources));
        }

        Err(E2eError::Browser(format!(
            "more than {} redirects starting from {}",
            MAX_REDIRECTS,
            resources.first().map(|r| r.url.as_str()).unwrap_or_default()
        )))
    }

    /// Native form submission: successful controls sent to the form's action
    fn submit(&mut self, selector: &str) -> E2eResult<(Page, Vec<HttpResource>)> {
        let (method, target, pairs) = {
            let query = parse_selector(selector)?;
            let page = self.page()?;
            let doc = page.document();
            let form = doc
                .select(&query)
                .next()
                .ok_or_else(|| E2eError::ElementNotFound(selector.to_string()))?;
            if form.value().name() != "form" {
                return Err(E2eError::Browser(format!("'{}' is not a form", selector)));
            }

            let pairs = successful_controls(&doc, form, &page.fields);
            let method = form.value().attr("method").unwrap_or("get").to_ascii_lowercase();
            let action = form.value().attr("action").unwrap_or_default();
            let mut target = page
                .url
                .join(action)
                .map_err(|e| E2eError::Browser(format!("bad form action '{}': {}", action, e)))?;
            target.set_fragment(None);
            (method, target, pairs)
        };

        debug!("Submitting {} ({} field(s)) to {}", selector, pairs.len(), target);
        if method == "post" {
            self.navigate(Method::POST, target, Some(pairs))
        } else {
            let mut target = target;
            if pairs.is_empty() {
                target.set_query(None);
            } else {
                target.query_pairs_mut().clear().extend_pairs(&pairs);
            }
            self.navigate(Method::GET, target, None)
        }
    }

    #[cfg(test)]
    fn load_source(&mut self, url: &str, source: &str) {
        self.page = Some(LoadedPage {
            url: Url::parse(url).unwrap(),
            status: 200,
            headers: BTreeMap::new(),
            source: source.to_string(),
            fields: HashMap::new(),
        });
    }
}

impl Browser for DocumentBrowser {
    fn launch(options: &BrowserOptions) -> E2eResult<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(options.wait_timeout)
            .user_agent(concat!("ghostrunner/", env!("CARGO_PKG_VERSION")))
            .build()?;

        debug!("Launched document browser (timeout {:?})", options.wait_timeout);
        Ok(Self {
            client,
            options: options.clone(),
            cookies: CookieJar::new(),
            page: None,
            closed: false,
        })
    }

    fn open(&mut self, url: &str) -> E2eResult<(Page, Vec<HttpResource>)> {
        self.ensure_open()?;
        let url = Url::parse(url).map_err(|e| E2eError::Browser(format!("invalid url '{}': {}", url, e)))?;
        self.navigate(Method::GET, url, None)
    }

    fn evaluate(&mut self, script: &str) -> E2eResult<(Value, Vec<HttpResource>)> {
        self.ensure_open()?;
        let terms = script::parse(script)?;

        if let [Term::Query {
            selector,
            access: Access::Submit,
        }] = terms.as_slice()
        {
            let (_, resources) = self.submit(selector)?;
            return Ok((Value::Null, resources));
        }

        let page = self.page()?;
        let doc = page.document();
        let mut values = terms
            .iter()
            .map(|term| page.term_value(&doc, term))
            .collect::<E2eResult<Vec<_>>>()?;

        let value = if values.len() == 1 {
            values.remove(0)
        } else {
            Value::String(values.iter().map(concat_string).collect())
        };
        Ok((value, Vec::new()))
    }

    fn wait_for_page_loaded(&mut self) -> E2eResult<()> {
        self.ensure_open()?;
        // Navigation returns only once the document is parsed.
        self.page().map(|_| ())
    }

    fn fill(&mut self, selector: &str, fields: &BTreeMap<String, String>) -> E2eResult<FillOutcome> {
        self.ensure_open()?;
        let query = parse_selector(selector)?;
        let page = self.page_mut()?;
        let doc = page.document();
        let form = doc
            .select(&query)
            .next()
            .ok_or_else(|| E2eError::ElementNotFound(selector.to_string()))?;
        let controls: Vec<ElementRef> = form_controls(form).collect();

        let mut outcome = FillOutcome::default();
        for (name, value) in fields {
            match resolve_bulk(&doc, &controls, name, value) {
                Some(changes) => page.fields.extend(changes),
                None => outcome.unresolved.push(name.clone()),
            }
        }
        Ok(outcome)
    }

    fn set_field_value(&mut self, selector: &str, value: &str) -> E2eResult<bool> {
        self.ensure_open()?;
        let query = parse_selector(selector)?;
        let page = self.page_mut()?;
        let doc = page.document();
        let Some(el) = doc.select(&query).next() else {
            return Ok(false);
        };

        let state = match (el.value().name(), input_type(el).as_str()) {
            ("input", "checkbox" | "radio") => FieldState::Checked(parse_bool(value).unwrap_or(!value.is_empty())),
            _ => FieldState::Value(value.to_string()),
        };
        page.fields.insert(node_index(&doc, el), state);
        Ok(true)
    }

    fn load_cookies(&mut self, jar: &CookieJar) -> E2eResult<()> {
        self.ensure_open()?;
        self.cookies.extend(jar);
        Ok(())
    }

    fn delete_cookies(&mut self) -> E2eResult<()> {
        self.ensure_open()?;
        self.cookies.clear();
        Ok(())
    }

    fn clear_alert_message(&mut self) -> E2eResult<()> {
        // Without scripts no alert can be pending.
        self.ensure_open()
    }

    fn show(&mut self) -> E2eResult<()> {
        self.ensure_open()?;
        debug!("Document browser has no window to show");
        Ok(())
    }

    fn exit(&mut self) -> E2eResult<()> {
        if !self.closed {
            self.closed = true;
            self.page = None;
            self.cookies.clear();
            debug!("Document browser exited");
        }
        Ok(())
    }
}

fn parse_selector(selector: &str) -> E2eResult<Selector> {
    Selector::parse(selector).map_err(|e| E2eError::Browser(format!("invalid selector '{}': {:?}", selector, e)))
}

fn node_index(doc: &Html, el: ElementRef) -> usize {
    doc.tree
        .root()
        .descendants()
        .position(|node| node.id() == el.id())
        .unwrap_or(usize::MAX)
}

fn title(doc: &Html) -> String {
    doc.root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "title")
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

fn form_controls(form: ElementRef<'_>) -> impl Iterator<Item = ElementRef<'_>> {
    form.descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| matches!(el.value().name(), "input" | "select" | "textarea"))
}

fn options(select: ElementRef<'_>) -> impl Iterator<Item = ElementRef<'_>> {
    select
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "option")
}

fn input_type(el: ElementRef) -> String {
    el.value().attr("type").unwrap_or("text").to_ascii_lowercase()
}

fn option_value(option: ElementRef) -> String {
    option
        .value()
        .attr("value")
        .map(str::to_string)
        .unwrap_or_else(|| option.text().collect::<String>().trim().to_string())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" | "" => Some(false),
        _ => None,
    }
}

fn is_checked(el: ElementRef, index: usize, fields: &HashMap<usize, FieldState>) -> bool {
    match fields.get(&index) {
        Some(FieldState::Checked(checked)) => *checked,
        _ => el.value().attr("checked").is_some(),
    }
}

/// Current value of an `input`, `textarea` or `select`
fn control_value(el: ElementRef, index: usize, fields: &HashMap<usize, FieldState>) -> Option<String> {
    if let Some(FieldState::Value(v)) = fields.get(&index) {
        return Some(v.clone());
    }
    match el.value().name() {
        "input" => Some(el.value().attr("value").unwrap_or_default().to_string()),
        "textarea" => Some(el.text().collect()),
        "select" => {
            let all: Vec<ElementRef> = options(el).collect();
            all.iter()
                .find(|o| o.value().attr("selected").is_some())
                .or(all.first())
                .map(|o| option_value(*o))
        }
        _ => None,
    }
}

/// Changes filling `name` with `value` in one pass, or `None` when no
/// bulk-fillable control carries that name
fn resolve_bulk(
    doc: &Html,
    controls: &[ElementRef],
    name: &str,
    value: &str,
) -> Option<Vec<(usize, FieldState)>> {
    let named: Vec<ElementRef> = controls
        .iter()
        .copied()
        .filter(|c| c.value().name() != "textarea" && c.value().attr("name") == Some(name))
        .collect();
    let first = *named.first()?;
    let index = node_index(doc, first);

    match (first.value().name(), input_type(first).as_str()) {
        ("input", "file") => None,
        ("input", "checkbox") => Some(vec![(index, FieldState::Checked(parse_bool(value)?))]),
        ("input", "radio") => {
            let checked = parse_bool(value)?;
            if !checked {
                return Some(vec![(index, FieldState::Checked(false))]);
            }
            // Checking one radio unchecks the rest of its group.
            Some(
                named
                    .iter()
                    .enumerate()
                    .map(|(i, radio)| (node_index(doc, *radio), FieldState::Checked(i == 0)))
                    .collect(),
            )
        }
        ("select", _) => options(first)
            .any(|o| option_value(o) == value)
            .then(|| vec![(index, FieldState::Value(value.to_string()))]),
        _ => Some(vec![(index, FieldState::Value(value.to_string()))]),
    }
}

/// Name/value pairs a native submission of `form` would send
fn successful_controls(
    doc: &Html,
    form: ElementRef,
    fields: &HashMap<usize, FieldState>,
) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for control in form_controls(form) {
        let Some(name) = control.value().attr("name").filter(|n| !n.is_empty()) else {
            continue;
        };
        if control.value().attr("disabled").is_some() {
            continue;
        }

        let index = node_index(doc, control);
        match (control.value().name(), input_type(control).as_str()) {
            ("input", "submit" | "button" | "reset" | "image" | "file") => {}
            ("input", "checkbox" | "radio") => {
                if is_checked(control, index, fields) {
                    let value = control.value().attr("value").unwrap_or("on");
                    pairs.push((name.to_string(), value.to_string()));
                }
            }
            _ => {
                if let Some(value) = control_value(control, index, fields) {
                    pairs.push((name.to_string(), value));
                }
            }
        }
    }
    pairs
}

fn concat_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTE_PAGE: &str = r#"
        <html><head><title> Notes </title></head><body>
        <h1 class="title">Hello, twisted world.</h1>
        <form id="note-form" method="post" action="/notes/">
            <input type="text" name="title" value="draft">
            <textarea name="body">old body</textarea>
            <select name="color">
                <option value="red">Red</option>
                <option value="blue" selected>Blue</option>
            </select>
            <input type="checkbox" name="pinned" value="yes">
            <input type="file" name="attachment">
            <input type="hidden" name="csrf" value="t0k">
            <input type="text" name="disabled" value="x" disabled>
            <input type="submit" name="save" value="Save">
        </form>
        </body></html>
    "#;

    fn browser() -> DocumentBrowser {
        let mut browser = DocumentBrowser::launch(&BrowserOptions::default()).unwrap();
        browser.load_source("http://localhost:9000/notes/#top", NOTE_PAGE);
        browser
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn submitted(browser: &DocumentBrowser) -> Vec<(String, String)> {
        let page = browser.page().unwrap();
        let doc = page.document();
        let form = doc.select(&parse_selector("#note-form").unwrap()).next().unwrap();
        successful_controls(&doc, form, &page.fields)
    }

    #[test]
    fn test_evaluate_document_terms() {
        let mut browser = browser();
        let eval = |b: &mut DocumentBrowser, s: &str| b.evaluate(s).unwrap().0;

        assert_eq!(eval(&mut browser, "document.title"), Value::from("Notes"));
        assert_eq!(
            eval(&mut browser, "document.querySelector('.title').innerHTML"),
            Value::from("Hello, twisted world.")
        );
        assert_eq!(eval(&mut browser, "location.pathname + location.hash"), Value::from("/notes/#top"));
        assert_eq!(eval(&mut browser, "document.querySelector('select').value"), Value::from("blue"));
        assert_eq!(
            eval(&mut browser, "document.querySelector('form').getAttribute('missing')"),
            Value::Null
        );
        assert!(matches!(
            browser.evaluate("window.__webdriver_javascript_errors"),
            Err(E2eError::Script(_))
        ));

        assert!(matches!(
            browser.evaluate("document.querySelector('#nope').textContent"),
            Err(E2eError::ElementNotFound(_))
        ));
    }

    #[test]
    fn test_bulk_fill_reports_unresolved_fields() {
        let mut browser = browser();
        let outcome = browser
            .fill(
                "#note-form",
                &fields(&[
                    ("title", "Groceries"),
                    ("body", "eggs"),
                    ("color", "red"),
                    ("pinned", "true"),
                    ("attachment", "/tmp/x"),
                    ("nonexistent", "?"),
                ]),
            )
            .unwrap();

        assert_eq!(outcome.unresolved, vec!["attachment", "body", "nonexistent"]);
        assert_eq!(
            submitted(&browser),
            vec![
                ("title".to_string(), "Groceries".to_string()),
                ("body".to_string(), "old body".to_string()),
                ("color".to_string(), "red".to_string()),
                ("pinned".to_string(), "yes".to_string()),
                ("csrf".to_string(), "t0k".to_string()),
            ]
        );
    }

    #[test]
    fn test_fill_rejects_unknown_option_and_non_boolean_checkbox() {
        let mut browser = browser();
        let outcome = browser
            .fill("#note-form", &fields(&[("color", "green"), ("pinned", "sure")]))
            .unwrap();
        assert_eq!(outcome.unresolved, vec!["color", "pinned"]);
    }

    #[test]
    fn test_fill_missing_form_is_an_error() {
        let mut browser = browser();
        let err = browser.fill("#login-form", &fields(&[("a", "b")])).unwrap_err();
        assert!(matches!(err, E2eError::ElementNotFound(_)));
    }

    #[test]
    fn test_set_field_value_reaches_textarea() {
        let mut browser = browser();
        assert!(browser.set_field_value("textarea[name=\"body\"]", "new body").unwrap());
        assert!(!browser.set_field_value("textarea[name=\"title\"]", "x").unwrap());

        let (value, _) = browser.evaluate("document.querySelector('textarea').value").unwrap();
        assert_eq!(value, Value::from("new body"));
    }

    #[test]
    fn test_exit_closes_browser() {
        let mut browser = browser();
        browser.exit().unwrap();
        browser.exit().unwrap();
        assert!(matches!(browser.evaluate("document.title"), Err(E2eError::BrowserClosed)));
        assert!(matches!(browser.delete_cookies(), Err(E2eError::BrowserClosed)));
    }
}
