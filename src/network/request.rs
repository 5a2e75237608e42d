//! Per-fetch state tracked by the engine

use std::fmt;
use std::time::Duration;

use url::Url;

use super::certs::{CertCapture, OriginKey};
use super::message::FetchSink;
use super::postdata::{MultipartField, PostData, Upload};
use super::progress::ProgressThrottle;

/// Identity of a fetch inside one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchId(pub(crate) u64);

impl FetchId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FetchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Request parameters supplied when a fetch is set up
#[derive(Debug, Clone, Default)]
pub struct FetchParams {
    /// Treat any non-2xx response as an error
    pub only_2xx: bool,
    /// Avoid TLS 1.3 for servers that cannot cope with it
    pub downgrade_tls: bool,
    /// Already url-encoded POST body
    pub post_urlenc: Option<String>,
    /// Multipart POST body, ignored when `post_urlenc` is set
    pub post_multipart: Option<Vec<MultipartField>>,
    /// Extra request header lines (`Name: value`)
    pub headers: Vec<String>,
}

impl FetchParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only_2xx(mut self, only_2xx: bool) -> Self {
        self.only_2xx = only_2xx;
        self
    }

    pub fn downgrade_tls(mut self, downgrade: bool) -> Self {
        self.downgrade_tls = downgrade;
        self
    }

    pub fn post_urlenc(mut self, body: impl Into<String>) -> Self {
        self.post_urlenc = Some(body.into());
        self
    }

    pub fn post_multipart(mut self, fields: Vec<MultipartField>) -> Self {
        self.post_multipart = Some(fields);
        self
    }

    pub fn header(mut self, line: impl Into<String>) -> Self {
        self.headers.push(line.into());
        self
    }
}

/// Where a fetch is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Set up, no transfer yet (or the last start attempt was refused)
    Created,
    /// A connection handle is attached and owned by the transport
    Active,
    /// The transfer is over and the engine no longer drives it
    Released,
}

/// State of one fetch
pub(crate) struct FetchRequest {
    pub id: FetchId,
    pub url: Url,
    pub host: String,
    pub origin: Option<OriginKey>,
    pub headers: Vec<String>,
    pub post: PostData,
    pub upload: Upload,
    pub only_2xx: bool,
    pub downgrade_tls: bool,
    pub phase: RequestPhase,
    /// Taken out while a message is being delivered
    pub sink: Option<Box<dyn FetchSink>>,
    pub http_code: u16,
    /// The sink has been told the status of this transfer
    pub code_reported: bool,
    /// Certificate problems were not overridden for this transfer
    pub verify_peer: bool,
    pub location: Option<String>,
    pub content_length: Option<u64>,
    pub cookie: Option<String>,
    pub realm: Option<String>,
    pub had_headers: bool,
    /// Set once, never cleared
    pub abort: bool,
    /// The engine stopped the transfer itself
    pub stopped: bool,
    pub capture: CertCapture,
    pub certs_sent: bool,
    pub progress: ProgressThrottle,
}

impl FetchRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: FetchId,
        url: Url,
        host: String,
        headers: Vec<String>,
        post: PostData,
        upload: Upload,
        params: &FetchParams,
        sink: Box<dyn FetchSink>,
        progress_interval: Duration,
    ) -> Self {
        let origin = OriginKey::from_url(&url);
        Self {
            id,
            url,
            host,
            origin,
            headers,
            post,
            upload,
            only_2xx: params.only_2xx,
            downgrade_tls: params.downgrade_tls,
            phase: RequestPhase::Created,
            sink: Some(sink),
            http_code: 0,
            code_reported: false,
            verify_peer: true,
            location: None,
            content_length: None,
            cookie: None,
            realm: None,
            had_headers: false,
            abort: false,
            stopped: false,
            capture: CertCapture::new(),
            certs_sent: false,
            progress: ProgressThrottle::new(progress_interval),
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase == RequestPhase::Active
    }

    pub fn mark_aborted(&mut self) {
        self.abort = true;
    }

    /// Whether the URL is an http(s) one, for the 2xx-only check
    pub fn is_http(&self) -> bool {
        self.url.scheme().starts_with("http")
    }

    /// Drop per-transfer response state before a (re)start
    pub fn reset_response(&mut self) {
        self.http_code = 0;
        self.code_reported = false;
        self.location = None;
        self.content_length = None;
        self.realm = None;
        self.had_headers = false;
        self.stopped = false;
        self.capture = CertCapture::new();
        self.certs_sent = false;
    }
}
