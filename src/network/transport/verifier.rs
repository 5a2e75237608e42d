//! Server certificate verification that reports the chain it looked at
//!
//! rustls verifies on the runtime's worker threads, so the outcome for each
//! presented certificate is posted as events for the engine thread to replay.

use std::iter;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use tokio::sync::mpsc::UnboundedSender;

use super::http::Event;
use crate::network::certs::{CertError, MAX_CERT_DEPTH};
use crate::network::request::FetchId;
use crate::utils::TransportError;

/// Slot naming the transfer a handle's handshakes belong to
#[derive(Debug, Clone, Default)]
pub(super) struct CertReporter {
    slot: Arc<Mutex<Option<(FetchId, UnboundedSender<Event>)>>>,
}

impl CertReporter {
    pub(super) fn bind(&self, id: FetchId, events: UnboundedSender<Event>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some((id, events));
    }

    pub(super) fn unbind(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn report(&self, chain: &[&CertificateDer<'_>], errors: &[CertError], ok: bool) {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let Some((id, events)) = slot.as_ref() else {
            log::debug!("handshake with no transfer bound, chain not reported");
            return;
        };
        for depth in (0..chain.len()).rev() {
            let event = Event::Certificate {
                id: *id,
                depth,
                der: Bytes::copy_from_slice(chain[depth].as_ref()),
                err: errors[depth],
            };
            if events.send(event).is_err() {
                return;
            }
        }
        let _ = events.send(Event::ChainVerified { id: *id, ok });
    }
}

/// Web PKI verification plus chain reporting.
///
/// With `accept_invalid` set the handshake goes on whatever the chain
/// looks like and nothing is reported; signatures over the handshake are
/// still checked.
#[derive(Debug)]
pub(super) struct CapturingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    accept_invalid: bool,
    reporter: CertReporter,
}

impl CapturingVerifier {
    pub(super) fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        accept_invalid: bool,
        reporter: CertReporter,
    ) -> Result<Self, TransportError> {
        let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Self {
            inner,
            accept_invalid,
            reporter,
        })
    }
}

impl ServerCertVerifier for CapturingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let chain: Vec<&CertificateDer<'_>> = iter::once(end_entity).chain(intermediates).collect();
        if chain.len() > MAX_CERT_DEPTH {
            log::info!("server presented {} certificates, refusing", chain.len());
            // what fits is still reported; the deepest kept entry stands
            // for the part cut off
            let kept = &chain[..MAX_CERT_DEPTH];
            let mut errors = vec![CertError::Ok; MAX_CERT_DEPTH];
            errors[MAX_CERT_DEPTH - 1] = CertError::Unknown;
            self.reporter.report(kept, &errors, false);
            return Err(Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }

        let verdict =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        if self.accept_invalid {
            if let Err(e) = &verdict {
                log::info!("ignoring certificate problem for {:?}: {}", server_name, e);
            }
            return Ok(ServerCertVerified::assertion());
        }

        let mut errors = vec![CertError::Ok; chain.len()];
        if let Err(e) = &verdict {
            let (depth, err) = attribute(e, chain.len());
            log::debug!("certificate at depth {} for {:?}: {}", depth, server_name, e);
            errors[depth] = err;
        }
        self.reporter.report(&chain, &errors, verdict.is_ok());
        verdict
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Chain depth a verification error belongs to, and what it means there.
///
/// Web PKI reports one error for the whole chain. Issuer problems are pinned
/// on the deepest presented certificate, everything else on the leaf.
fn attribute(err: &Error, presented: usize) -> (usize, CertError) {
    let deepest = presented.saturating_sub(1);
    let Error::InvalidCertificate(cert) = err else {
        return (0, CertError::Unknown);
    };
    match cert {
        CertificateError::UnknownIssuer if presented == 1 => (0, CertError::SelfSigned),
        CertificateError::UnknownIssuer => (deepest, CertError::BadIssuer),
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
            (0, CertError::HostnameMismatch)
        }
        CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
            (0, CertError::TooOld)
        }
        CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
            (0, CertError::TooYoung)
        }
        CertificateError::Revoked => (0, CertError::Revoked),
        CertificateError::BadSignature => (0, CertError::BadSignature),
        _ => (0, CertError::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_attribute_issuer_errors() {
        let unknown = Error::InvalidCertificate(CertificateError::UnknownIssuer);
        assert_eq!(attribute(&unknown, 1), (0, CertError::SelfSigned));
        assert_eq!(attribute(&unknown, 3), (2, CertError::BadIssuer));
    }

    #[test]
    fn test_attribute_leaf_errors() {
        let expired = Error::InvalidCertificate(CertificateError::Expired);
        assert_eq!(attribute(&expired, 2), (0, CertError::TooOld));
        let name = Error::InvalidCertificate(CertificateError::NotValidForName);
        assert_eq!(attribute(&name, 2), (0, CertError::HostnameMismatch));
        let other = Error::General("handshake".to_string());
        assert_eq!(attribute(&other, 2), (0, CertError::Unknown));
    }

    #[test]
    fn test_reporter_posts_deepest_first() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = CertReporter::default();
        reporter.bind(FetchId(7), tx);

        let leaf = CertificateDer::from(vec![1u8, 2, 3]);
        let ca = CertificateDer::from(vec![4u8, 5]);
        reporter.report(&[&leaf, &ca], &[CertError::Ok, CertError::BadIssuer], false);

        let depths: Vec<usize> = iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                Event::Certificate { depth, .. } => Some(depth),
                Event::ChainVerified { ok, .. } => {
                    assert!(!ok);
                    None
                }
                _ => None,
            })
            .collect();
        assert_eq!(depths, vec![1, 0]);
    }

    #[test]
    fn test_overlong_chain_reported_then_refused() {
        let root = rcgen::generate_simple_self_signed(vec!["root.test".to_string()]).unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(root.cert)).unwrap();
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = CertReporter::default();
        reporter.bind(FetchId(3), tx);
        let verifier = CapturingVerifier::new(Arc::new(roots), provider, false, reporter).unwrap();

        let leaf = CertificateDer::from(vec![0x30u8, 0]);
        let intermediates: Vec<CertificateDer<'static>> = (1..=MAX_CERT_DEPTH as u8)
            .map(|depth| CertificateDer::from(vec![0x30u8, depth]))
            .collect();
        let name = ServerName::try_from("deep.test").unwrap();
        let verdict =
            verifier.verify_server_cert(&leaf, &intermediates, &name, &[], UnixTime::now());
        assert!(verdict.is_err());

        let mut certs = Vec::new();
        let mut verified = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Certificate { depth, der, err, .. } => certs.push((depth, der, err)),
                Event::ChainVerified { ok, .. } => verified = Some(ok),
                _ => {}
            }
        }
        assert_eq!(certs.len(), MAX_CERT_DEPTH);
        assert_eq!(certs[0].0, MAX_CERT_DEPTH - 1);
        assert_eq!(certs[0].2, CertError::Unknown);
        let leaf_entry = certs.last().unwrap();
        assert_eq!((leaf_entry.0, leaf_entry.2), (0, CertError::Ok));
        assert_eq!(leaf_entry.1.as_ref(), leaf.as_ref());
        assert_eq!(verified, Some(false));
    }

    #[test]
    fn test_unbound_reporter_is_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = CertReporter::default();
        reporter.bind(FetchId(1), tx);
        reporter.unbind();

        let leaf = CertificateDer::from(vec![9u8]);
        reporter.report(&[&leaf], &[CertError::Ok], true);
        assert!(rx.try_recv().is_err());
    }
}
