//! Ephemeral certificates for auto mTLS and the encodings used to exchange
//! them during the handshake.

use std::fmt;

use base64::{
    alphabet,
    engine::{general_purpose, DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::error::PluginError;

const CERT_COMMON_NAME: &str = "localhost";
const CERT_VALIDITY_DAYS: i64 = 5 * 365;

/// Handshakes carry the certificate without padding, but padded input is
/// accepted too.
const HANDSHAKE_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A self-signed certificate and its private key.
pub struct Identity {
    certificate:     CertificateDer<'static>,
    certificate_pem: String,
    key_der:         Vec<u8>,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            certificate:     self.certificate.clone(),
            certificate_pem: self.certificate_pem.clone(),
            key_der:         self.key_der.clone(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Unpadded base64 DER, as written into the handshake line.
    pub fn encoded_certificate(&self) -> String {
        general_purpose::STANDARD_NO_PAD.encode(self.certificate.as_ref())
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.certificate)
    }
}

/// Generate an ECDSA P-256 key pair and a self-signed certificate for
/// `localhost`, valid for five years.
pub fn generate_identity() -> Result<Identity, PluginError> {
    let key_pair = KeyPair::generate().map_err(rcgen_error)?;

    let mut params =
        CertificateParams::new(vec![CERT_COMMON_NAME.to_owned()]).map_err(rcgen_error)?;
    let mut name = DistinguishedName::new();
    name.push(
        DnType::CommonName,
        DnValue::Utf8String(CERT_COMMON_NAME.to_owned()),
    );
    params.distinguished_name = name;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyAgreement,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let certificate = params.self_signed(&key_pair).map_err(rcgen_error)?;
    let identity = Identity {
        certificate:     certificate.der().clone(),
        certificate_pem: certificate.pem(),
        key_der:         key_pair.serialize_der(),
    };
    tracing::debug!("Generated certificate {}", identity.fingerprint());
    Ok(identity)
}

/// SHA-256 of the DER encoding, hex encoded.
pub fn fingerprint(certificate: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(certificate.as_ref()))
}

/// Decode the certificate field of a handshake (base64 DER or PEM) and check
/// it.
pub fn parse_encoded_certificate(text: &str) -> Result<CertificateDer<'static>, PluginError> {
    let text = text.trim();
    if text.starts_with("-----BEGIN") {
        return parse_pem_certificate(text);
    }

    let der = HANDSHAKE_BASE64
        .decode(text)
        .map_err(|e| PluginError::certificate(format!("invalid base64 certificate: {e}")))?;
    let certificate = CertificateDer::from(der);
    check_certificate(&certificate)?;
    Ok(certificate)
}

/// Read the first certificate of a PEM document and check it.
pub fn parse_pem_certificate(pem: &str) -> Result<CertificateDer<'static>, PluginError> {
    let certificate = rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .ok_or_else(|| PluginError::certificate("no certificate found in PEM data"))?
        .map_err(|e| PluginError::certificate(format!("invalid PEM certificate: {e}")))?;
    check_certificate(&certificate)?;
    Ok(certificate)
}

/// Parse the DER structure, require the current time to be inside the
/// validity window, and verify the signature of self-issued certificates.
pub fn check_certificate(certificate: &CertificateDer<'_>) -> Result<(), PluginError> {
    let (rest, parsed) = x509_parser::parse_x509_certificate(certificate.as_ref())
        .map_err(|e| PluginError::certificate(format!("failed to parse certificate: {e}")))?;
    if !rest.is_empty() {
        return Err(PluginError::certificate(format!(
            "{} trailing bytes after certificate",
            rest.len()
        )));
    }

    if !parsed.validity().is_valid() {
        return Err(PluginError::certificate(
            "certificate is outside its validity period",
        ));
    }

    if parsed.issuer().as_raw() == parsed.subject().as_raw() {
        parsed.verify_signature(None).map_err(|e| {
            PluginError::certificate(format!("certificate signature does not verify: {e}"))
        })?;
    }
    Ok(())
}

fn rcgen_error(err: rcgen::Error) -> PluginError {
    PluginError::certificate(format!("certificate generation failed: {err}"))
}
