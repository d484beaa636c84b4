//! Web server implementation

use axum::{
    extract::{Form, Request, State},
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use ghostrunner_common::{auth, AppContext, Authenticator, Database, SessionAuth, User, SESSION_COOKIE_NAME};
use serde::Deserialize;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::WebError;
use crate::notes::NoteStore;

/// Create the account, session and note tables
pub fn install_schema(db: &Database) -> ghostrunner_common::Result<()> {
    auth::install_schema(db)?;
    NoteStore::new(db.clone()).install_schema()
}

/// Build the application router for `ctx`
pub fn app(ctx: AppContext) -> Router {
    WebServer::new(ctx).router()
}

pub struct WebServer {
    ctx: AppContext,
}

impl WebServer {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index_handler))
            .route("/login/", get(login_page_handler).post(login_handler))
            .route("/logout/", get(logout_handler))
            .route("/notes/", get(notes_page_handler).post(create_note_handler))
            .route("/health", get(health_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(middleware::from_fn_with_state(self.ctx.clone(), request_finished)),
            )
            .with_state(self.ctx.clone())
    }

    /// Serve until the process exits
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("Web app starting on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

/// Fire the request-finished signal once the response is ready
async fn request_finished(State(ctx): State<AppContext>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    ctx.request_finished.send(&ctx.connections);
    response
}

fn session_auth(ctx: &AppContext) -> Result<SessionAuth, WebError> {
    Ok(SessionAuth::new(ctx.connections.default_db()?.clone()))
}

fn current_user(ctx: &AppContext, jar: &CookieJar) -> Result<Option<User>, WebError> {
    match jar.get(SESSION_COOKIE_NAME) {
        Some(cookie) => Ok(session_auth(ctx)?.session_user(cookie.value())?),
        None => Ok(None),
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ghostrunner-web"
    }))
}

async fn index_handler(State(ctx): State<AppContext>, jar: CookieJar) -> Result<Html<String>, WebError> {
    let user = current_user(&ctx, &jar)?;
    let welcome = match &user {
        Some(user) => format!(
            "<p class=\"welcome\">Welcome, {}</p>\n<a href=\"/logout/\">Log out</a>",
            escape_html(&user.username)
        ),
        None => "<a href=\"/login/\">Log in</a>".to_string(),
    };
    Ok(Html(page(
        "Home",
        &format!("<h1 class=\"title\">Hello, twisted world.</h1>\n{}", welcome),
    )))
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login_page_handler() -> Html<String> {
    Html(login_page(None))
}

async fn login_handler(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Result<Response, WebError> {
    match session_auth(&ctx)?.login(&form.username, &form.password)? {
        Some(session) => {
            info!("User '{}' logged in", session.user.username);
            let cookie = Cookie::build((SESSION_COOKIE_NAME, session.token))
                .path("/")
                .http_only(true)
                .build();
            Ok((jar.add(cookie), Redirect::to("/")).into_response())
        }
        None => {
            debug!("Rejected login for '{}'", form.username);
            Ok(Html(login_page(Some("Invalid username or password."))).into_response())
        }
    }
}

async fn logout_handler(State(ctx): State<AppContext>, jar: CookieJar) -> Result<Response, WebError> {
    if let Some(cookie) = jar.get(SESSION_COOKIE_NAME) {
        session_auth(&ctx)?.logout(cookie.value())?;
    }
    let removal = Cookie::build((SESSION_COOKIE_NAME, "")).path("/").build();
    Ok((jar.remove(removal), Redirect::to("/")).into_response())
}

#[derive(Debug, Deserialize)]
struct NoteForm {
    title: String,
    #[serde(default)]
    body: String,
}

async fn notes_page_handler(State(ctx): State<AppContext>) -> Result<Html<String>, WebError> {
    let notes = NoteStore::new(ctx.connections.default_db()?.clone()).list()?;

    let items: String = notes
        .iter()
        .map(|note| {
            format!(
                "<li class=\"note\"><h2>{}</h2><p>{}</p></li>\n",
                escape_html(&note.title),
                escape_html(&note.body)
            )
        })
        .collect();

    Ok(Html(page(
        "Notes",
        &format!(
            r#"<h1>Notes</h1>
<ul id="notes">
{}</ul>
<form id="note-form" method="post" action="/notes/">
  <input type="text" name="title">
  <textarea name="body"></textarea>
  <input type="submit" value="Save">
</form>"#,
            items
        ),
    )))
}

async fn create_note_handler(
    State(ctx): State<AppContext>,
    Form(form): Form<NoteForm>,
) -> Result<Redirect, WebError> {
    let title = form.title.trim();
    if title.is_empty() {
        return Err(WebError::BadRequest("title is required".to_string()));
    }

    let note = NoteStore::new(ctx.connections.default_db()?.clone()).create(title, &form.body)?;
    debug!("Created note {}", note.id);
    Ok(Redirect::to("/notes/#saved"))
}

// ============================================================================
// Templates
// ============================================================================

/// Base template; collects uncaught script errors for the test harness
fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{}</title>
<script>
window.__webdriver_javascript_errors = [];
window.onerror = function(errorMsg, url, lineNumber) {{
  window.__webdriver_javascript_errors.push(errorMsg + ' (found at ' + url + ', line ' + lineNumber + ')');
}};
</script>
</head>
<body>
{}
</body>
</html>
"#,
        escape_html(title),
        body
    )
}

fn login_page(error: Option<&str>) -> String {
    let error = error
        .map(|e| format!("<p class=\"error\">{}</p>\n", escape_html(e)))
        .unwrap_or_default();
    page(
        "Log in",
        &format!(
            r#"<h1>Log in</h1>
{}<form id="login-form" method="post" action="/login/">
  <input type="text" name="username">
  <input type="password" name="password">
  <input type="submit" value="Log in">
</form>"#,
            error
        ),
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
