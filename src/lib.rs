//! # netfetch - asynchronous HTTP(S) fetch engine
//!
//! Turns a URL plus request parameters into a stream of response messages
//! (headers, body chunks, redirects, certificate chains, completion or
//! error) while many transfers share a bounded pool of reusable
//! connections.
//!
//! ## Architecture
//!
//! - **network**: the transfer engine, connection pool, certificate chain
//!   cache, postdata encoder, scheme registry and the reqwest/rustls
//!   transport
//! - **security**: cookies, stored credentials and certificate overrides
//! - **utils**: shared utilities and error types

pub mod network;
pub mod security;
pub mod utils;

// Re-export main types for convenience
pub use network::{FetchConfig, FetchEngine, FetchId, FetchMsg, FetchParams, FetchSink, Flow};
pub use utils::error::{FetchError, Result};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "netfetch";
