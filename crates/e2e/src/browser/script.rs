//! Script expressions understood by the document client

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationPart {
    Href,
    Pathname,
    Hash,
    Search,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    InnerHtml,
    TextContent,
    Value,
    Attribute(String),
    Submit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Literal(String),
    Title,
    Location(LocationPart),
    Query { selector: String, access: Access },
    /// Global variable set by page scripts
    Global(String),
}

fn query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^document\.querySelector\(\s*("(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')\s*\)\.(.+)$"#)
            .expect("valid regex")
    })
}

fn attribute_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^getAttribute\(\s*("(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')\s*\)$"#).expect("valid regex")
    })
}

fn global_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:window\.)?([A-Za-z_$][A-Za-z0-9_$]*)$").expect("valid regex"))
}

/// Parse `script` into `+`-joined terms
pub fn parse(script: &str) -> E2eResult<Vec<Term>> {
    let mut body = script.trim();
    body = body.strip_prefix("return ").unwrap_or(body).trim();
    body = body.trim_end_matches(';').trim();
    if body.is_empty() {
        return Err(E2eError::Script(script.to_string()));
    }

    let terms = split_concatenation(body)
        .into_iter()
        .map(|token| parse_term(token.trim()).ok_or_else(|| E2eError::Script(script.to_string())))
        .collect::<E2eResult<Vec<_>>>()?;

    let submits = terms
        .iter()
        .filter(|t| matches!(t, Term::Query { access: Access::Submit, .. }))
        .count();
    if submits > 0 && terms.len() > 1 {
        return Err(E2eError::Script(script.to_string()));
    }
    Ok(terms)
}

fn parse_term(token: &str) -> Option<Term> {
    if let Some(literal) = unquote(token) {
        return Some(Term::Literal(literal));
    }

    match token.strip_prefix("window.").unwrap_or(token) {
        "document.title" => return Some(Term::Title),
        "location.href" | "document.location.href" => return Some(Term::Location(LocationPart::Href)),
        "location.pathname" => return Some(Term::Location(LocationPart::Pathname)),
        "location.hash" => return Some(Term::Location(LocationPart::Hash)),
        "location.search" => return Some(Term::Location(LocationPart::Search)),
        _ => {}
    }

    if let Some(caps) = query_re().captures(token) {
        let selector = unquote(&caps[1])?;
        let access = match &caps[2] {
            "innerHTML" => Access::InnerHtml,
            "textContent" | "innerText" => Access::TextContent,
            "value" => Access::Value,
            "submit()" => Access::Submit,
            other => Access::Attribute(unquote(&attribute_re().captures(other)?[1])?),
        };
        return Some(Term::Query { selector, access });
    }

    global_re().captures(token).map(|caps| Term::Global(caps[1].to_string()))
}

/// Contents of a single- or double-quoted literal, unescaped
fn unquote(token: &str) -> Option<String> {
    let quote = token.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = token.strip_prefix(quote)?.strip_suffix(quote)?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            c if c == quote => return None,
            c => out.push(c),
        }
    }
    Some(out)
}

/// Split on `+` outside quotes and parentheses
fn split_concatenation(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in body.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '+' if depth == 0 => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

/// `document.querySelector("<selector>").submit()` with the selector escaped
pub fn submit_expression(selector: &str) -> String {
    format!("document.querySelector(\"{}\").submit()", escape(selector))
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
