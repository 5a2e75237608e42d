//! Site data consulted by the fetch engine
//!
//! - Cookies sent with and received from each request
//! - Stored HTTP authentication credentials
//! - Per-origin acceptance of certificate errors

mod cookies;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use url::Url;

use crate::network::OriginKey;

pub use cookies::{Cookie, CookieJar};

/// Store of per-site data the engine reads before a transfer and updates
/// while one runs
pub trait SiteStore {
    /// `Cookie` header value for a request to `url`
    fn get_cookie(&self, url: &Url, include_secure: bool) -> Option<String>;

    /// Record a raw `Set-Cookie` value received for `url`
    fn set_cookie(&self, url: &Url, header: &str);

    /// Basic auth credentials (`user:password`) for `url`
    fn auth_details(&self, _url: &Url) -> Option<String> {
        None
    }

    /// Whether certificate problems for the origin of `url` were accepted
    fn ignore_certificate_errors(&self, _url: &Url) -> bool {
        false
    }
}

/// In-memory [`SiteStore`]
#[derive(Debug, Default)]
pub struct MemorySiteStore {
    jar: RefCell<CookieJar>,
    credentials: RefCell<HashMap<OriginKey, String>>,
    cert_overrides: RefCell<HashSet<OriginKey>>,
}

impl MemorySiteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `user:password` for the origin of `url`
    pub fn set_auth_details(&self, url: &Url, user: &str, password: &str) {
        if let Some(origin) = OriginKey::from_url(url) {
            self.credentials
                .borrow_mut()
                .insert(origin, format!("{}:{}", user, password));
        }
    }

    /// Accept certificate errors for the origin of `url`
    pub fn accept_certificate_errors(&self, url: &Url) {
        if let Some(origin) = OriginKey::from_url(url) {
            log::info!("accepting certificate errors for {}", origin);
            self.cert_overrides.borrow_mut().insert(origin);
        }
    }

    pub fn cookie_count(&self) -> usize {
        self.jar.borrow().count()
    }

    pub fn clear_cookies(&self) {
        self.jar.borrow_mut().clear_all();
    }
}

impl SiteStore for MemorySiteStore {
    fn get_cookie(&self, url: &Url, include_secure: bool) -> Option<String> {
        self.jar.borrow().cookie_header(url, include_secure)
    }

    fn set_cookie(&self, url: &Url, header: &str) {
        let mut jar = self.jar.borrow_mut();
        jar.cleanup();
        if !jar.set_from_header(url, header) {
            log::debug!("ignored cookie from {}", url);
        }
    }

    fn auth_details(&self, url: &Url) -> Option<String> {
        let origin = OriginKey::from_url(url)?;
        self.credentials.borrow().get(&origin).cloned()
    }

    fn ignore_certificate_errors(&self, url: &Url) -> bool {
        OriginKey::from_url(url).is_some_and(|origin| self.cert_overrides.borrow().contains(&origin))
    }
}
