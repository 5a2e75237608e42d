//! HTTP(S) fetch engine
//!
//! Multiplexes many fetches over a bounded pool of reusable connection
//! handles, captures and caches TLS certificate chains per origin, and
//! reports each fetch's progress to its owner as a stream of messages.

mod certs;
mod config;
mod engine;
mod fetcher;
mod headers;
mod message;
mod pool;
mod postdata;
mod progress;
mod request;
pub mod transport;

pub use certs::{
    CertCapture, CertChain, CertChainCache, CertError, Certificate, MAX_CERT_DEPTH, OriginKey,
};
pub use config::{
    DEFAULT_TLS12_CIPHER_SUITES, DEFAULT_TLS13_CIPHER_SUITES, FetchConfig, ProxyAuth, ProxyConfig,
    UPDATES_PER_SECOND,
};
pub use engine::{EnginePhase, FetchEngine, NOT_2XX};
pub use fetcher::{Fetcher, FetcherRegistry, HTTP_SCHEMES, register_http};
pub use headers::{SpecialHeader, build_request_headers, parse_special, split_request_header};
pub use message::{FetchMsg, FetchSink, Flow};
pub use pool::{ConnectionPool, PoolStats};
pub use postdata::{
    FieldValue, MemoryReader, MimeForm, MimePart, MultipartField, PartSource, PostData, Upload,
    encode as encode_postdata, guess_mime_type,
};
pub use progress::{ProgressThrottle, progress_text};
pub use request::{FetchId, FetchParams, RequestPhase};
pub use transport::{HttpTransport, Transport};
