use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    server::danger::{ClientCertVerified, ClientCertVerifier},
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::{
    certs::{fingerprint, Identity},
    error::PluginError,
};

/// Mutual TLS settings: the local identity and the peer certificates to
/// trust, pinned by SHA-256 fingerprint rather than by chain.
#[derive(Debug, Clone)]
pub struct MtlsConfig {
    trusted:  Vec<CertificateDer<'static>>,
    identity: Identity,
}

impl MtlsConfig {
    pub fn new(trusted: Vec<CertificateDer<'static>>, identity: Identity) -> Self {
        Self { trusted, identity }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn trusted_fingerprints(&self) -> Vec<String> {
        self.trusted.iter().map(|cert| fingerprint(cert)).collect()
    }

    pub(crate) fn connector(&self) -> Result<TlsConnector, PluginError> {
        let provider = crypto_provider();
        let verifier = PinnedCertVerifier::new(self.trusted_fingerprints(), Arc::clone(&provider));

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(
                vec![self.identity.certificate().clone()],
                self.identity.private_key(),
            )?;
        Ok(TlsConnector::from(Arc::new(config)))
    }

    pub(crate) fn acceptor(&self) -> Result<TlsAcceptor, PluginError> {
        let provider = crypto_provider();
        let verifier = PinnedCertVerifier::new(self.trusted_fingerprints(), Arc::clone(&provider));

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(
                vec![self.identity.certificate().clone()],
                self.identity.private_key(),
            )?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

/// Accepts exactly the certificates whose fingerprint is pinned. Handshake
/// signatures are still checked against the presented certificate.
#[derive(Debug)]
struct PinnedCertVerifier {
    fingerprints: Vec<String>,
    provider:     Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    fn new(fingerprints: Vec<String>, provider: Arc<CryptoProvider>) -> Self {
        Self {
            fingerprints,
            provider,
        }
    }

    fn check(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        let presented = fingerprint(end_entity);
        if self.fingerprints.iter().any(|pinned| *pinned == presented) {
            Ok(())
        } else {
            tracing::warn!("Rejected peer certificate {}", presented);
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity)?;
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

impl ClientCertVerifier for PinnedCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity)?;
        Ok(ClientCertVerified::assertion())
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
