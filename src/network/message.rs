//! Messages delivered from the engine to the fetch that owns a transfer
//!
//! For one fetch the engine delivers, in order, any number of `Header`
//! messages, then either `Data` chunks or one of `Redirect`, `Auth`,
//! `NotModified`, and finally at most one terminal message. `Certificates`
//! may arrive once at any point before the terminal message.

use super::certs::CertChain;

/// Message sent to the owner of a fetch
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FetchMsg<'a> {
    /// Human readable transfer progress
    Progress(&'a str),
    /// One raw response header line, including its line ending
    Header(&'a [u8]),
    /// A chunk of response body
    Data(&'a [u8]),
    /// Transfer completed
    Finished,
    /// Transfer timed out
    Timeout(&'a str),
    /// Transfer failed
    Error(&'a str),
    /// Server sent a replacement location
    Redirect(&'a str),
    /// Conditional GET was answered with 304
    NotModified,
    /// Server requires authentication
    Auth { realm: Option<&'a str> },
    /// Certificate chain most recently seen for the origin
    Certificates(&'a CertChain),
    /// Certificate chain failed verification
    CertificateError,
    /// TLS handshake failed
    TlsError,
}

impl FetchMsg<'_> {
    /// Short name of the message kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Header(_) => "header",
            Self::Data(_) => "data",
            Self::Finished => "finished",
            Self::Timeout(_) => "timeout",
            Self::Error(_) => "error",
            Self::Redirect(_) => "redirect",
            Self::NotModified => "not-modified",
            Self::Auth { .. } => "auth",
            Self::Certificates(_) => "certificates",
            Self::CertificateError => "certificate-error",
            Self::TlsError => "tls-error",
        }
    }

    /// Whether the message ends the fetch
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished
                | Self::Timeout(_)
                | Self::Error(_)
                | Self::Redirect(_)
                | Self::NotModified
                | Self::Auth { .. }
                | Self::CertificateError
                | Self::TlsError
        )
    }
}

/// Whether a consumer wants a transfer to carry on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flow {
    #[default]
    Continue,
    Abort,
}

impl Flow {
    pub fn is_abort(self) -> bool {
        self == Self::Abort
    }
}

/// Receiver of the messages for one fetch.
///
/// Returning [`Flow::Abort`] from [`FetchSink::deliver`] has the same
/// effect as calling `abort` on the engine for this fetch.
pub trait FetchSink {
    /// Deliver one message
    fn deliver(&mut self, msg: FetchMsg<'_>) -> Flow;

    /// The HTTP status became known
    fn set_http_code(&mut self, _code: u16) {}
}

impl<F> FetchSink for F
where
    F: FnMut(FetchMsg<'_>) -> Flow,
{
    fn deliver(&mut self, msg: FetchMsg<'_>) -> Flow {
        self(msg)
    }
}
