//! Transport library boundary
//!
//! The engine drives transfers through a [`Transport`]: a multiplexed context
//! that owns the connection handles of active transfers and, when asked to
//! [`perform`](Transport::perform), reports what happened through
//! [`TransferEvents`] callbacks on the calling thread.

mod http;
mod verifier;

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use super::certs::CertError;
use super::config::{FetchConfig, ProxyConfig};
use super::message::Flow;
use super::postdata::Upload;
use super::request::FetchId;
use crate::utils::TransportError;

pub use http::{HttpHandle, HttpTransport};

/// Raw file descriptor number
pub type Fd = i32;

/// Descriptor sets a caller can wait on before the next poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdSets {
    pub read: Vec<Fd>,
    pub write: Vec<Fd>,
    pub except: Vec<Fd>,
}

impl FdSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.except.is_empty()
    }

    /// `(read, write, except)` flags for one descriptor
    pub fn state(&self, fd: Fd) -> (bool, bool, bool) {
        (
            self.read.contains(&fd),
            self.write.contains(&fd),
            self.except.contains(&fd),
        )
    }
}

/// Options shared by every connection handle, set on the template
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateOptions {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub low_speed_limit: u64,
    pub low_speed_time: Duration,
    pub ca_bundle: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub tls12_cipher_suites: Vec<String>,
    pub tls13_cipher_suites: Vec<String>,
    pub verbose: bool,
}

impl TemplateOptions {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            connect_timeout: config.connect_timeout,
            low_speed_limit: config.low_speed_limit,
            low_speed_time: config.low_speed_time,
            ca_bundle: config.ca_bundle.clone(),
            ca_path: config.ca_path.clone(),
            tls12_cipher_suites: config.tls12_cipher_suites.clone(),
            tls13_cipher_suites: config.tls13_cipher_suites.clone(),
            verbose: config.verbose,
        }
    }
}

/// Options applied to a handle for one transfer
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub url: Url,
    /// Header lines; `Name:` with no value suppresses a default header
    pub headers: Vec<String>,
    pub cookie: Option<String>,
    /// Basic auth credentials as `user:password`
    pub auth: Option<String>,
    pub proxy: Option<ProxyConfig>,
    /// Verify the peer certificate chain and host name
    pub verify_peer: bool,
    /// Stay below TLS 1.3
    pub downgrade_tls: bool,
    pub upload: Upload,
}

/// Transport-neutral outcome of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    /// The whole response was received
    Complete,
    /// The body was shorter than announced, or a compressed stream was cut
    PartialBody,
    /// A data or header callback refused to take more
    WriteAborted,
    /// The peer certificate failed verification
    PeerCertificate,
    /// The issuing CA could not be verified
    CaCertificate,
    /// The TLS handshake failed for another reason
    TlsConnect,
    TimedOut(String),
    Failed(String),
}

/// Callbacks made by a transport while it performs pending work
pub trait TransferEvents {
    /// One raw response header line (status line and final blank line included)
    fn header(&mut self, id: FetchId, status: u16, line: &[u8]) -> Flow;

    /// A chunk of response body
    fn data(&mut self, id: FetchId, status: u16, chunk: &[u8]) -> Flow;

    /// Download progress in bytes; `total` is 0 when unknown
    fn progress(&mut self, id: FetchId, total: u64, now: u64);

    /// One certificate of the presented chain, deepest first.
    ///
    /// Returns whether verification may carry on.
    fn verify_certificate(&mut self, id: FetchId, depth: usize, der: &[u8], err: CertError)
    -> bool;

    /// Chain verification finished with outcome `ok`.
    ///
    /// Returns the final verdict, which is false if the chain could not
    /// be recorded.
    fn chain_verified(&mut self, id: FetchId, ok: bool) -> bool;

    /// Transport debug text
    fn debug(&mut self, id: FetchId, text: &str);
}

/// A multiplexed transfer library
pub trait Transport {
    /// A connection handle: reusable per-host connection state
    type Handle;

    /// One-time global setup
    fn initialise(&mut self, config: &FetchConfig) -> Result<(), TransportError>;

    /// Global teardown; every handle has been dropped by now
    fn cleanup(&mut self);

    /// Human readable library version
    fn version(&self) -> String {
        "unknown".to_string()
    }

    /// Whether the library already keeps connections alive on its own
    fn reuses_connections(&self) -> bool {
        false
    }

    /// Build the template handle carrying the shared options
    fn template(&mut self, options: &TemplateOptions) -> Result<Self::Handle, TransportError>;

    /// Fresh handle with the template's baseline options
    fn duplicate(&mut self, template: &Self::Handle) -> Result<Self::Handle, TransportError>;

    /// Apply per-transfer options; on failure the handle must be discarded
    fn configure(
        &mut self,
        handle: &mut Self::Handle,
        options: &TransferOptions,
    ) -> Result<(), TransportError>;

    /// Start driving `handle` as the transfer for `id`
    fn add(&mut self, id: FetchId, handle: Self::Handle) -> Result<(), TransportError>;

    /// Stop driving the transfer for `id` and give its handle back
    fn remove(&mut self, id: FetchId) -> Option<Self::Handle>;

    /// Do whatever work is ready without blocking; returns the number of
    /// transfers still running
    fn perform(&mut self, events: &mut dyn TransferEvents) -> Result<usize, TransportError>;

    /// Next finished transfer, if any
    fn next_completion(&mut self) -> Option<(FetchId, TransferResult)>;

    /// HTTP status of the transfer for `id`, once known
    fn status_code(&self, id: FetchId) -> Option<u16>;

    /// Fill `sets` with the descriptors worth waiting on; returns the highest
    fn fdset(&self, sets: &mut FdSets) -> Option<Fd>;
}
