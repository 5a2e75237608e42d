//! Error types for netfetch

use std::path::PathBuf;

use thiserror::Error;

use crate::network::FetchId;

/// Main error type for fetch engine operations
#[derive(Debug, Error)]
pub enum FetchError {
    /// One-time transport initialisation failed
    #[error("fetcher initialisation failed: {0}")]
    InitFailed(String),
    /// A buffer could not be allocated
    #[error("out of memory")]
    OutOfMemory,
    /// The URL has no host component
    #[error("url has no host: {0}")]
    NoHost(String),
    /// POST body could not be encoded
    #[error("postdata encoding failed: {0}")]
    PostData(#[from] PostDataError),
    /// Operation needs an initialised engine
    #[error("fetch engine not initialised")]
    NotInitialised,
    /// No fetch with this identity is known to the engine
    #[error("unknown fetch {0}")]
    UnknownFetch(FetchId),
    /// The fetch still owns a transfer inside the transport
    #[error("fetch {0} is still active")]
    StillActive(FetchId),
    /// The transport library reported a failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// No fetcher is registered for this scheme
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

/// Errors produced by a transport backend
#[derive(Debug, Error)]
pub enum TransportError {
    /// Global setup of the transport failed
    #[error("transport init: {0}")]
    Init(String),
    /// A per-handle option was rejected
    #[error("option rejected: {0}")]
    Option(String),
    /// Driving pending work failed
    #[error("perform failed: {0}")]
    Perform(String),
    /// TLS configuration could not be built
    #[error("tls: {0}")]
    Tls(String),
    /// I/O error
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rustls::Error> for TransportError {
    fn from(err: rustls::Error) -> Self {
        Self::Tls(err.to_string())
    }
}

/// POST body encoding errors
#[derive(Debug, Error)]
pub enum PostDataError {
    /// A file-backed field points at nothing readable
    #[error("file not found: {}", .0.display())]
    MissingFile(PathBuf),
    /// A field cannot be represented in a multipart body
    #[error("bad field: {0}")]
    Field(String),
    /// Memory for the encoded body could not be reserved
    #[error("out of memory")]
    OutOfMemory,
}

/// Convenience Result type for fetch operations
pub type Result<T> = std::result::Result<T, FetchError>;
