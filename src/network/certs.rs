//! Certificate chain capture and the per-origin chain cache
//!
//! While a TLS handshake is verified, each presented certificate is recorded
//! into a [`CertCapture`] at its chain depth (0 is the leaf). Once verification
//! is over the captured chain is copied into the [`CertChainCache`] for the
//! request's origin and shared with the fetch owner from there.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use url::Url;

use crate::utils::{FetchError, Result};

/// Deepest certificate chain that will be captured
pub const MAX_CERT_DEPTH: usize = 10;

/// Default port used for origins without an explicit or known one
const DEFAULT_TLS_PORT: u16 = 443;

/// Verification outcome for one certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CertError {
    #[default]
    Ok,
    BadIssuer,
    BadSignature,
    TooYoung,
    TooOld,
    SelfSigned,
    ChainSelfSigned,
    Revoked,
    HostnameMismatch,
    Missing,
    Unknown,
}

impl CertError {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::BadIssuer => "bad-issuer",
            Self::BadSignature => "bad-signature",
            Self::TooYoung => "too-young",
            Self::TooOld => "too-old",
            Self::SelfSigned => "self-signed",
            Self::ChainSelfSigned => "chain-self-signed",
            Self::Revoked => "revoked",
            Self::HostnameMismatch => "hostname-mismatch",
            Self::Missing => "missing",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One certificate of a chain together with its verification outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Bytes,
    err: CertError,
}

impl Certificate {
    pub fn new(der: impl Into<Bytes>, err: CertError) -> Self {
        Self {
            der: der.into(),
            err,
        }
    }

    /// Placeholder for a depth the handshake never presented
    pub fn missing() -> Self {
        Self::new(Bytes::new(), CertError::Missing)
    }

    /// DER encoding
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn err(&self) -> CertError {
        self.err
    }

    /// PEM rendering of the DER bytes
    pub fn pem(&self) -> String {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let body = STANDARD.encode(&self.der);
        let mut pem = String::with_capacity(body.len() + body.len() / 64 + 64);
        pem.push_str("-----BEGIN CERTIFICATE-----\n");
        for line in body.as_bytes().chunks(64) {
            // base64 output is ASCII
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }

    /// SHA-256 fingerprint as colon separated hex
    pub fn fingerprint(&self) -> String {
        use ring::digest;

        let hash = digest::digest(&digest::SHA256, &self.der);
        hash.as_ref()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn try_clone(&self) -> Result<Self> {
        let mut der = Vec::new();
        der.try_reserve_exact(self.der.len())
            .map_err(|_| FetchError::OutOfMemory)?;
        der.extend_from_slice(&self.der);
        Ok(Self {
            der: Bytes::from(der),
            err: self.err,
        })
    }
}

/// Ordered certificate chain, leaf first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertChain {
    certs: Vec<Certificate>,
}

impl CertChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_certs(certs: Vec<Certificate>) -> Self {
        Self { certs }
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Certificate at `depth` (0 is the leaf)
    pub fn get(&self, depth: usize) -> Option<&Certificate> {
        self.certs.get(depth)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.certs.iter()
    }

    /// Whether any certificate failed verification
    pub fn has_errors(&self) -> bool {
        self.certs.iter().any(|c| !c.err.is_ok())
    }
}

/// Per-transfer capture buffer indexed by chain depth
#[derive(Debug, Clone, Default)]
pub struct CertCapture {
    slots: [Option<Certificate>; MAX_CERT_DEPTH],
    depth: usize,
}

impl CertCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of depths spanned by what was captured so far
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }

    /// Record the certificate seen at `depth`; the first sighting wins.
    ///
    /// Returns false when the chain is deeper than can be captured.
    pub fn record(&mut self, depth: usize, der: &[u8], err: CertError) -> bool {
        if depth >= MAX_CERT_DEPTH {
            return false;
        }
        if self.slots[depth].is_none() {
            self.slots[depth] = Some(Certificate::new(Bytes::copy_from_slice(der), err));
        }
        self.depth = self.depth.max(depth + 1);
        true
    }

    /// Record one certificate and decide whether verification may go on.
    ///
    /// Non-leaf depths always continue so the full chain gets captured.
    /// The leaf decision fails if anything captured so far carries an error.
    pub fn verify(&mut self, depth: usize, der: &[u8], err: CertError) -> bool {
        if !self.record(depth, der, err) {
            return false;
        }
        if depth > 0 {
            return true;
        }
        self.chain_ok()
    }

    /// True when every captured certificate verified cleanly
    pub fn chain_ok(&self) -> bool {
        self.slots[..self.depth]
            .iter()
            .flatten()
            .all(|c| c.err.is_ok())
    }

    /// Copy the capture into an owned chain, filling gaps with
    /// [`CertError::Missing`] entries
    pub fn to_chain(&self) -> Result<CertChain> {
        let mut certs = Vec::new();
        certs
            .try_reserve_exact(self.depth)
            .map_err(|_| FetchError::OutOfMemory)?;
        for slot in &self.slots[..self.depth] {
            certs.push(match slot {
                Some(cert) => cert.try_clone()?,
                None => Certificate::missing(),
            });
        }
        Ok(CertChain { certs })
    }
}

/// Certificate cache key: lower cased host and a port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginKey {
    host: String,
    port: u16,
}

impl OriginKey {
    pub fn new(host: &str, port: Option<u16>) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            port: port.unwrap_or(DEFAULT_TLS_PORT),
        }
    }

    /// Origin of a URL; an absent port becomes the scheme's default
    pub fn from_url(url: &Url) -> Option<Self> {
        let host = url.host_str()?;
        Some(Self::new(host, url.port_or_known_default()))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Most recently verified certificate chain per origin
#[derive(Debug, Default)]
pub struct CertChainCache {
    entries: HashMap<OriginKey, Rc<CertChain>>,
}

impl CertChainCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain for `key`, creating an empty entry on first access
    pub fn get_or_create(&mut self, key: &OriginKey) -> Rc<CertChain> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Rc::new(CertChain::new()))
            .clone()
    }

    /// Replace the chain for `key` with a copy of `capture`.
    ///
    /// If the copy fails the entry is dropped rather than left stale.
    pub fn replace(&mut self, key: &OriginKey, capture: &CertCapture) -> Result<Rc<CertChain>> {
        match capture.to_chain() {
            Ok(chain) => {
                let chain = Rc::new(chain);
                self.entries.insert(key.clone(), chain.clone());
                Ok(chain)
            }
            Err(e) => {
                log::debug!("dropping certificate cache entry for {}", key);
                self.entries.remove(key);
                Err(e)
            }
        }
    }

    pub fn lookup(&self, key: &OriginKey) -> Option<Rc<CertChain>> {
        self.entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            log::debug!("clearing {} cached certificate chains", self.entries.len());
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn der(tag: u8) -> Vec<u8> {
        vec![0x30, 0x03, 0x02, 0x01, tag]
    }

    #[test]
    fn test_first_sighting_wins() {
        let mut capture = CertCapture::new();
        assert!(capture.record(1, &der(1), CertError::Ok));
        assert!(capture.record(1, &der(9), CertError::Revoked));

        let chain = capture.to_chain().unwrap();
        assert_eq!(chain.get(1).unwrap().der(), der(1).as_slice());
        assert_eq!(chain.get(1).unwrap().err(), CertError::Ok);
    }

    #[test]
    fn test_leaf_decision_rescans_chain() {
        let mut capture = CertCapture::new();
        // deepest first, as presented during verification
        assert!(capture.verify(4, &der(4), CertError::Ok));
        assert!(capture.verify(3, &der(3), CertError::TooOld));
        assert!(capture.verify(2, &der(2), CertError::Ok));
        assert!(capture.verify(1, &der(1), CertError::Ok));
        assert!(!capture.verify(0, &der(0), CertError::Ok));

        let chain = capture.to_chain().unwrap();
        assert_eq!(chain.len(), 5);
        let errs: Vec<_> = chain.iter().map(|c| c.err()).collect();
        assert_eq!(
            errs,
            vec![
                CertError::Ok,
                CertError::Ok,
                CertError::Ok,
                CertError::TooOld,
                CertError::Ok
            ]
        );
    }

    #[test]
    fn test_too_deep_chain_fails() {
        let mut capture = CertCapture::new();
        assert!(!capture.verify(MAX_CERT_DEPTH, &der(0), CertError::Ok));
        assert!(capture.is_empty());
    }

    #[test]
    fn test_gaps_marked_missing() {
        let mut capture = CertCapture::new();
        capture.record(2, &der(2), CertError::Ok);
        capture.record(0, &der(0), CertError::Ok);

        let chain = capture.to_chain().unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.get(1).unwrap().err(), CertError::Missing);
        assert!(chain.has_errors());
    }

    #[test]
    fn test_origin_key_default_port() {
        let a = Url::parse("https://Example.Test:443/a").unwrap();
        let b = Url::parse("https://example.test/b").unwrap();
        assert_eq!(OriginKey::from_url(&a), OriginKey::from_url(&b));

        let c = Url::parse("https://example.test:8443/").unwrap();
        assert_ne!(OriginKey::from_url(&a), OriginKey::from_url(&c));
        assert_eq!(OriginKey::new("example.test", None).port(), 443);
    }

    #[test]
    fn test_cache_replace_wholesale() {
        let key = OriginKey::new("example.test", Some(443));
        let mut cache = CertChainCache::new();
        assert!(cache.get_or_create(&key).is_empty());

        let mut first = CertCapture::new();
        first.record(1, &der(1), CertError::Ok);
        first.record(0, &der(0), CertError::Ok);
        cache.replace(&key, &first).unwrap();
        assert_eq!(cache.lookup(&key).unwrap().len(), 2);

        let mut second = CertCapture::new();
        second.record(0, &der(7), CertError::SelfSigned);
        cache.replace(&key, &second).unwrap();
        let chain = cache.lookup(&key).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.get(0).unwrap().err(), CertError::SelfSigned);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pem_and_fingerprint() {
        let cert = Certificate::new(der(1), CertError::Ok);
        let pem = cert.pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\nMAMCAQE=\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));

        let fp = cert.fingerprint();
        assert_eq!(fp.len(), 32 * 3 - 1);
        assert!(fp.split(':').all(|b| b.len() == 2));
    }

    proptest! {
        #[test]
        fn prop_explicit_default_port_matches_implicit(host in "[a-z]{1,12}(\\.[a-z]{2,6}){1,2}") {
            let implicit = Url::parse(&format!("https://{}/x", host.to_uppercase())).unwrap();
            let explicit = Url::parse(&format!("https://{}:443/y", host)).unwrap();
            let a = OriginKey::from_url(&implicit).unwrap();
            let b = OriginKey::from_url(&explicit).unwrap();

            let mut cache = CertChainCache::new();
            cache.get_or_create(&a);
            prop_assert!(cache.lookup(&b).is_some());
            prop_assert_eq!(a, b);
        }
    }
}
