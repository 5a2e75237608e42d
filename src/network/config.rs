//! Fetch engine configuration

use std::path::PathBuf;
use std::time::Duration;

/// Maximum progress notifications per second for a single fetch
pub const UPDATES_PER_SECOND: u32 = 2;

/// TLS 1.3 suites the engine is prepared to use
pub const DEFAULT_TLS13_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_AES_128_GCM_SHA256",
];

/// TLS 1.2 suites the engine is prepared to use (forward secret AEAD only)
pub const DEFAULT_TLS12_CIPHER_SUITES: &[&str] = &[
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
];

/// Proxy authentication scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyAuth {
    #[default]
    None,
    Basic,
    Ntlm,
}

/// HTTP proxy settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy host name
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Authentication scheme used against the proxy
    pub auth: ProxyAuth,
    /// Proxy user name
    pub user: String,
    /// Proxy password
    pub password: String,
    /// Hosts that bypass the proxy
    pub no_proxy: Vec<String>,
}

impl ProxyConfig {
    /// Create an unauthenticated proxy entry
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth: ProxyAuth::None,
            user: String::new(),
            password: String::new(),
            no_proxy: Vec::new(),
        }
    }
}

/// Fetch engine configuration
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Maximum simultaneous transfers
    pub max_fetchers: usize,
    /// Maximum simultaneous transfers to one host
    pub max_fetchers_per_host: usize,
    /// Maximum idle connection handles kept in the pool
    pub max_cached_fetch_handles: usize,
    /// Optional HTTP proxy
    pub proxy: Option<ProxyConfig>,
    /// CA bundle file
    pub ca_bundle: Option<PathBuf>,
    /// Directory of CA certificates
    pub ca_path: Option<PathBuf>,
    /// Accepted suites for TLS 1.2 and below
    pub tls12_cipher_suites: Vec<String>,
    /// Accepted suites for TLS 1.3
    pub tls13_cipher_suites: Vec<String>,
    /// Preferred languages for `Accept-Language`
    pub accept_language: Option<String>,
    /// Preferred charsets for `Accept-Charset`
    pub accept_charset: Option<String>,
    /// Send `DNT: 1`
    pub do_not_track: bool,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Bytes per second under which a transfer counts as stalled
    pub low_speed_limit: u64,
    /// How long a transfer may stay stalled before timing out
    pub low_speed_time: Duration,
    /// User agent string
    pub user_agent: String,
    /// Log transport debug output
    pub verbose: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_fetchers: 24,
            max_fetchers_per_host: 5,
            max_cached_fetch_handles: 6,
            proxy: None,
            ca_bundle: None,
            ca_path: None,
            tls12_cipher_suites: DEFAULT_TLS12_CIPHER_SUITES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tls13_cipher_suites: DEFAULT_TLS13_CIPHER_SUITES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            accept_language: None,
            accept_charset: None,
            do_not_track: false,
            connect_timeout: Duration::from_secs(30),
            low_speed_limit: 1,
            low_speed_time: Duration::from_secs(180),
            user_agent: format!("{}/{}", crate::NAME, crate::VERSION),
            verbose: false,
        }
    }
}

impl FetchConfig {
    /// Delay between two progress notifications of one fetch
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(UPDATES_PER_SECOND))
    }
}
