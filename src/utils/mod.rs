//! Shared utilities and error types

pub mod error;

pub use error::{FetchError, PostDataError, Result, TransportError};

const BYTE_UNITS: [&str; 4] = ["Bytes", "kBytes", "MBytes", "GBytes"];

/// Format a byte count for display, e.g. `1.50kBytes`.
///
/// Sizes are scaled by 1024 until they fit the largest unit below them.
pub fn human_friendly_bytesize(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = 0;

    while size > 1024.0 && unit < BYTE_UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:3.2}{}", size, BYTE_UNITS[unit])
}
