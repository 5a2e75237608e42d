//! Cookie jar fed from `Set-Cookie` response headers
//!
//! Implements the RFC 6265 subset a fetcher needs: domain and path
//! matching, `Secure`, `Max-Age` expiry and host-only cookies.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use url::Url;

/// A parsed cookie
#[derive(Debug, Clone)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Domain the cookie applies to; unset until stored
    pub domain: Option<String>,
    /// Set when no `Domain` attribute was given
    pub host_only: bool,
    pub path: String,
    /// Max-Age in seconds
    pub max_age: Option<Duration>,
    /// Only send over https
    pub secure: bool,
    pub http_only: bool,
    pub created_at: SystemTime,
}

impl Cookie {
    /// Create a new session cookie
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: None,
            host_only: true,
            path: "/".to_string(),
            max_age: None,
            secure: false,
            http_only: false,
            created_at: SystemTime::now(),
        }
    }

    /// Parse a Set-Cookie header value
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';');
        let name_value = parts.next()?.trim();

        let (name, value) = name_value.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let mut cookie = Self::new(name, value.trim());

        for part in parts {
            let part = part.trim();
            if let Some((attr, val)) = part.split_once('=') {
                let val = val.trim();
                match attr.trim().to_ascii_lowercase().as_str() {
                    "domain" if !val.is_empty() => {
                        cookie.domain = Some(val.trim_start_matches('.').to_ascii_lowercase());
                        cookie.host_only = false;
                    }
                    "path" if val.starts_with('/') => cookie.path = val.to_string(),
                    "max-age" => {
                        // a non-positive max-age expires the cookie at once
                        cookie.max_age = match val.parse::<i64>() {
                            Ok(secs) if secs > 0 => Some(Duration::from_secs(secs as u64)),
                            Ok(_) => Some(Duration::ZERO),
                            Err(_) => cookie.max_age,
                        };
                    }
                    _ => {}
                }
            } else {
                match part.to_ascii_lowercase().as_str() {
                    "secure" => cookie.secure = true,
                    "httponly" => cookie.http_only = true,
                    _ => {}
                }
            }
        }

        Some(cookie)
    }

    /// Check if cookie is expired
    pub fn is_expired(&self) -> bool {
        match self.max_age {
            Some(max_age) => SystemTime::now()
                .duration_since(self.created_at)
                .is_ok_and(|elapsed| elapsed >= max_age),
            None => false,
        }
    }

    fn path_matches(&self, request_path: &str) -> bool {
        if request_path == self.path {
            return true;
        }
        request_path.starts_with(&self.path)
            && (self.path.ends_with('/') || request_path[self.path.len()..].starts_with('/'))
    }

    /// Check if cookie should be sent for a request to `url`
    pub fn should_send(&self, url: &Url, include_secure: bool) -> bool {
        if self.is_expired() {
            return false;
        }
        if self.secure && (!include_secure || url.scheme() != "https") {
            return false;
        }
        self.path_matches(url.path())
    }
}

/// Cookie jar for storing and managing cookies
#[derive(Debug)]
pub struct CookieJar {
    /// Cookies indexed by domain
    cookies: HashMap<String, Vec<Cookie>>,
    /// Maximum cookies per domain
    max_per_domain: usize,
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieJar {
    /// Create a new cookie jar
    pub fn new() -> Self {
        Self {
            cookies: HashMap::new(),
            max_per_domain: 50,
        }
    }

    /// Store a cookie received from `request_host`.
    ///
    /// Returns false if the cookie was rejected.
    pub fn set(&mut self, mut cookie: Cookie, request_host: &str) -> bool {
        let request_host = request_host.to_ascii_lowercase();
        let domain = cookie
            .domain
            .clone()
            .unwrap_or_else(|| request_host.clone());

        // prevent cookie injection into unrelated domains
        if !Self::domain_matches(&domain, &request_host) {
            log::debug!("rejecting cookie {} for {} from {}", cookie.name, domain, request_host);
            return false;
        }
        cookie.domain = Some(domain.clone());

        let domain_cookies = self.cookies.entry(domain).or_default();
        domain_cookies.retain(|c| c.name != cookie.name || c.path != cookie.path);

        if cookie.is_expired() {
            return true;
        }

        if domain_cookies.len() >= self.max_per_domain {
            if let Some(oldest_idx) = domain_cookies
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.created_at)
                .map(|(i, _)| i)
            {
                domain_cookies.remove(oldest_idx);
            }
        }

        domain_cookies.push(cookie);
        true
    }

    /// Parse and store a raw `Set-Cookie` value received for `url`
    pub fn set_from_header(&mut self, url: &Url, header: &str) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        match Cookie::parse(header) {
            Some(cookie) => self.set(cookie, host),
            None => false,
        }
    }

    /// Build the `Cookie` header value for a request to `url`
    pub fn cookie_header(&self, url: &Url, include_secure: bool) -> Option<String> {
        let host = url.host_str()?.to_ascii_lowercase();
        let host = host.as_str();

        let mut cookies: Vec<&Cookie> = self
            .cookies
            .iter()
            .filter(|(domain, _)| Self::domain_matches(domain, host))
            .flat_map(|(domain, cookies)| {
                cookies
                    .iter()
                    .filter(move |c| !c.host_only || domain.as_str() == host)
            })
            .filter(|c| c.should_send(url, include_secure))
            .collect();

        if cookies.is_empty() {
            return None;
        }

        // longer paths first, then oldest first
        cookies.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then(a.created_at.cmp(&b.created_at))
        });

        Some(
            cookies
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Remove expired cookies
    pub fn cleanup(&mut self) {
        for cookies in self.cookies.values_mut() {
            cookies.retain(|c| !c.is_expired());
        }
        self.cookies.retain(|_, v| !v.is_empty());
    }

    /// Clear all cookies
    pub fn clear_all(&mut self) {
        self.cookies.clear();
    }

    /// Check if cookie domain matches request host
    fn domain_matches(cookie_domain: &str, request_host: &str) -> bool {
        request_host == cookie_domain
            || request_host
                .strip_suffix(cookie_domain)
                .is_some_and(|prefix| prefix.ends_with('.'))
    }

    /// Get total cookie count
    pub fn count(&self) -> usize {
        self.cookies.values().map(|v| v.len()).sum()
    }
}
