//! Session bridging: log in on the test thread, hand the browser the cookie

use ghostrunner_common::{AuthSession, Authenticator};
use tracing::info;

use crate::browser::{Browser, BrowserCookie, CookieJar};
use crate::error::{E2eError, E2eResult};

/// Authenticate `username` through `auth` and load the resulting session
/// cookie, scoped to `host`, into `browser`.
///
/// No request is sent to the live server.
pub fn bridge_session<B: Browser + ?Sized>(
    browser: &mut B,
    auth: &dyn Authenticator,
    host: &str,
    username: &str,
    password: &str,
) -> E2eResult<AuthSession> {
    let session = auth
        .login(username, password)?
        .ok_or_else(|| E2eError::Authentication(username.to_string()))?;

    let mut jar = CookieJar::new();
    jar.insert(BrowserCookie::session(session.token.clone(), host));
    browser.load_cookies(&jar)?;

    info!("Bridged session for '{}' to {}", username, host);
    Ok(session)
}
