//! Pinned-certificate HTTPS client factory
//!
//! Builds blocking HTTPS clients for talking to a companion process that
//! presents an operator-supplied self-signed certificate. The client
//! trusts exactly that certificate as its root authority; peer chains are
//! checked by [`SkewTolerantVerifier`] instead of the TLS library's
//! default verification, so a bounded disagreement between our clock and
//! the peer's does not break the handshake. Each client carries its own
//! in-memory cookie store for session continuity across requests.

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, OtherError, RootCertStore, SignatureScheme};

use crate::error::TransportError;

/// Allowed disagreement between our clock and the peer's
pub const CLOCK_SKEW_TOLERANCE: Duration = Duration::from_secs(24 * 60 * 60);

/// Build an HTTPS client that trusts only the supplied PEM certificate
///
/// The returned client speaks TLS 1.2 or newer, verifies every peer chain
/// with [`SkewTolerantVerifier`], and carries cookies across requests for
/// the lifetime of the client value. Fails if the PEM input does not
/// contain a parsable certificate; verification failures surface later as
/// errors on individual requests.
pub fn client_for_pinned_certificate(
    certificate_pem: &[u8],
) -> Result<reqwest::blocking::Client, TransportError> {
    let verifier = SkewTolerantVerifier::from_pem(certificate_pem)?;
    let provider = verifier.provider();

    let tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    let client = reqwest::blocking::Client::builder()
        .use_preconfigured_tls(tls)
        .cookie_store(true)
        .build()?;

    Ok(client)
}

/// Peer-certificate verifier pinned to a single trust anchor, tolerant of
/// bounded clock skew
///
/// Verification runs in two stages on every handshake:
///
/// 1. every presented certificate's validity window must overlap
///    `[now - tolerance, now + tolerance]`; anything entirely outside it
///    is rejected before chain building;
/// 2. the chain must verify against the pinned roots at one of three
///    reference times: `now`, `now + tolerance`, `now - tolerance`, tried
///    in that order. The first success wins; if all three fail, the last
///    attempt's error is the one surfaced.
///
/// A chain must still validate as genuinely issued by the pinned anchor
/// at some plausible time inside the skew window, on every handshake.
/// Hostname identity is not part of the check; trust derives solely from
/// the anchor.
#[derive(Debug)]
pub struct SkewTolerantVerifier {
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
    tolerance: Duration,
}

impl SkewTolerantVerifier {
    /// Build a verifier whose trust pool holds exactly the certificates
    /// found in the supplied PEM input
    pub fn from_pem(certificate_pem: &[u8]) -> Result<Self, TransportError> {
        let mut reader = BufReader::new(certificate_pem);
        let anchors = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransportError::InvalidCertificate(e.to_string()))?;

        if anchors.is_empty() {
            return Err(TransportError::InvalidCertificate(
                "no certificates found in PEM input".to_string(),
            ));
        }

        let mut roots = RootCertStore::empty();
        for der in anchors {
            roots
                .add(der)
                .map_err(|e| TransportError::InvalidCertificate(e.to_string()))?;
        }

        Ok(Self {
            roots,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            tolerance: CLOCK_SKEW_TOLERANCE,
        })
    }

    /// Crypto provider the verifier's TLS configuration must share
    pub(crate) fn provider(&self) -> Arc<CryptoProvider> {
        self.provider.clone()
    }

    /// Run the full two-stage check against a presented chain
    ///
    /// Factored out of the [`ServerCertVerifier`] impl so the policy can
    /// be exercised directly with an explicit reference time.
    pub fn check_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        self.check_validity_windows(end_entity, intermediates, now)?;
        self.verify_at_tolerated_times(end_entity, intermediates, now)
    }

    /// Coarse sanity check applied before chain building: a certificate
    /// whose validity window lies entirely outside the tolerance window
    /// around `now` cannot be saved by any reference-time adjustment.
    fn check_validity_windows(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        let now_secs = now.as_secs() as i64;
        let tolerance = self.tolerance.as_secs() as i64;

        for der in std::iter::once(end_entity).chain(intermediates.iter()) {
            let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
                .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;

            let not_before = cert.validity().not_before.timestamp();
            let not_after = cert.validity().not_after.timestamp();

            if not_before > now_secs + tolerance {
                return Err(rustls::Error::InvalidCertificate(
                    CertificateError::NotValidYet,
                ));
            }
            if not_after < now_secs - tolerance {
                return Err(rustls::Error::InvalidCertificate(CertificateError::Expired));
            }
        }
        Ok(())
    }

    /// Verify the chain against the pinned roots at `now`, then at the
    /// edges of the tolerance window
    fn verify_at_tolerated_times(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<(), rustls::Error> {
        let now_secs = now.as_secs();
        let tolerance = self.tolerance.as_secs();
        let reference_times = [
            now_secs,
            now_secs.saturating_add(tolerance),
            now_secs.saturating_sub(tolerance),
        ];

        let mut last_error = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);
        for secs in reference_times {
            let at = UnixTime::since_unix_epoch(Duration::from_secs(secs));
            match self.verify_chain(end_entity, intermediates, at) {
                Ok(()) => return Ok(()),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    /// Single chain-building pass at one reference time
    fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        at: UnixTime,
    ) -> Result<(), rustls::Error> {
        let cert = webpki::EndEntityCert::try_from(end_entity).map_err(chain_error)?;
        cert.verify_for_usage(
            self.provider.signature_verification_algorithms.all,
            &self.roots.roots,
            intermediates,
            at,
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map(|_| ())
        .map_err(chain_error)
    }
}

impl ServerCertVerifier for SkewTolerantVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check_chain(end_entity, intermediates, now)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn chain_error(err: webpki::Error) -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(err))))
}
