//! Client-side cookie store

use cookie::Cookie;
use ghostrunner_common::SESSION_COOKIE_NAME;
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    /// Dropped when the browser exits
    pub discard: bool,
}

impl BrowserCookie {
    /// Root-path, non-secure cookie discarded on exit
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".to_string(),
            secure: false,
            discard: true,
        }
    }

    /// Session cookie carrying `token` for `domain`
    pub fn session(token: impl Into<String>, domain: impl Into<String>) -> Self {
        Self::new(SESSION_COOKIE_NAME, token, domain)
    }

    /// Whether a request to `url` should carry this cookie
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        if self.secure && url.scheme() != "https" {
            return false;
        }
        domain_matches(host, &self.domain) && path_matches(url.path(), &self.path)
    }

    fn same_key(&self, other: &BrowserCookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{}", domain))
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

/// Ordered cookie store keyed by `(domain, path, name)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: Vec<BrowserCookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `cookie`, replacing one with the same key
    pub fn insert(&mut self, cookie: BrowserCookie) {
        match self.cookies.iter_mut().find(|c| c.same_key(&cookie)) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    pub fn remove(&mut self, name: &str, domain: &str, path: &str) -> Option<BrowserCookie> {
        let index = self
            .cookies
            .iter()
            .position(|c| c.name == name && c.domain == domain && c.path == path)?;
        Some(self.cookies.remove(index))
    }

    pub fn get(&self, name: &str) -> Option<&BrowserCookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrowserCookie> {
        self.cookies.iter()
    }

    pub fn extend(&mut self, other: &CookieJar) {
        for cookie in other.iter() {
            self.insert(cookie.clone());
        }
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Apply one `Set-Cookie` header received from `url`.
    ///
    /// `Max-Age` of zero or less removes the cookie. Unparseable headers are
    /// ignored.
    pub fn store_set_cookie(&mut self, header: &str, url: &Url) {
        let parsed = match Cookie::parse(header) {
            Ok(parsed) if !parsed.name().is_empty() => parsed,
            Ok(_) => return,
            Err(e) => {
                debug!("Ignoring Set-Cookie from {}: {}", url, e);
                return;
            }
        };

        let mut cookie = BrowserCookie::new(
            parsed.name(),
            parsed.value().trim_matches('"'),
            url.host_str().unwrap_or_default(),
        );
        if let Some(domain) = parsed.domain().filter(|d| !d.is_empty()) {
            cookie.domain = domain.trim_start_matches('.').to_string();
        }
        cookie.path = parsed
            .path()
            .filter(|p| p.starts_with('/'))
            .map(str::to_string)
            .unwrap_or_else(|| default_path(url));
        cookie.secure = parsed.secure().unwrap_or(false);

        let expired = match parsed.max_age() {
            Some(max_age) => max_age.whole_seconds() <= 0,
            None => false,
        };
        cookie.discard = parsed.max_age().is_none() && parsed.expires_datetime().is_none();

        if expired {
            self.remove(&cookie.name, &cookie.domain, &cookie.path);
        } else {
            self.insert(cookie);
        }
    }

    /// `Cookie` request header for `url`, longest paths first
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let mut matching: Vec<&BrowserCookie> = self.cookies.iter().filter(|c| c.matches(url)).collect();
        if matching.is_empty() {
            return None;
        }
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matching
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_session_cookie_shape() {
        let cookie = BrowserCookie::session("abc123", "localhost");
        assert_eq!(cookie.name, "sessionid");
        assert_eq!(cookie.value, "abc123");
        assert_eq!(cookie.path, "/");
        assert!(!cookie.secure);
        assert!(cookie.discard);
    }

    #[test_case("http://localhost:9000/", true ; "root")]
    #[test_case("http://localhost:9001/notes/", true ; "any port")]
    #[test_case("http://app.localhost/", true ; "subdomain")]
    #[test_case("http://example.com/", false ; "other host")]
    #[test_case("http://notlocalhost/", false ; "suffix without dot")]
    fn test_domain_matching(target: &str, expected: bool) {
        assert_eq!(BrowserCookie::session("t", "localhost").matches(&url(target)), expected);
    }

    #[test]
    fn test_path_and_secure_matching() {
        let mut cookie = BrowserCookie::new("k", "v", "localhost");
        cookie.path = "/notes".to_string();
        assert!(cookie.matches(&url("http://localhost/notes")));
        assert!(cookie.matches(&url("http://localhost/notes/1")));
        assert!(!cookie.matches(&url("http://localhost/notesy")));

        cookie.path = "/".to_string();
        cookie.secure = true;
        assert!(!cookie.matches(&url("http://localhost/")));
        assert!(cookie.matches(&url("https://localhost/")));
    }

    #[test]
    fn test_set_cookie_and_removal() {
        let origin = url("http://localhost:9000/login/");
        let mut jar = CookieJar::new();

        jar.store_set_cookie("sessionid=tok; HttpOnly; Path=/; SameSite=Lax", &origin);
        assert_eq!(jar.get("sessionid").unwrap().value, "tok");
        assert_eq!(
            jar.header_for(&url("http://localhost:9000/notes/")).as_deref(),
            Some("sessionid=tok")
        );

        jar.store_set_cookie("sessionid=tok2; Path=/", &origin);
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.get("sessionid").unwrap().value, "tok2");

        jar.store_set_cookie("sessionid=; Path=/; Max-Age=0", &origin);
        assert!(jar.is_empty());
        assert!(jar.header_for(&origin).is_none());
    }

    #[test]
    fn test_set_cookie_attributes() {
        let mut jar = CookieJar::new();
        jar.store_set_cookie(
            "prefs=\"dark\"; Domain=.localhost; Path=/notes; Secure; Max-Age=3600",
            &url("https://app.localhost/notes/1"),
        );

        let cookie = jar.get("prefs").unwrap();
        assert_eq!(cookie.value, "dark");
        assert_eq!(cookie.domain, "localhost");
        assert_eq!(cookie.path, "/notes");
        assert!(cookie.secure);
        assert!(!cookie.discard);
    }

    #[test_case("no-equals-sign" ; "missing value")]
    #[test_case("=orphan; Path=/" ; "empty name")]
    fn test_malformed_set_cookie_is_ignored(header: &str) {
        let mut jar = CookieJar::new();
        jar.store_set_cookie(header, &url("http://localhost/"));
        assert!(jar.is_empty());
    }

    #[test]
    fn test_default_path_is_request_directory() {
        let mut jar = CookieJar::new();
        jar.store_set_cookie("flash=1", &url("http://localhost/notes/new"));
        assert_eq!(jar.get("flash").unwrap().path, "/notes");
    }
}
