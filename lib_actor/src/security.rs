//! TLS profiles for both sides of the actor.
//!
//! The same restricted profile applies everywhere: minimum TLS 1.2, cipher
//! allow-list limited to AEAD suites with ECDHE key exchange. The client side
//! can optionally skip certificate (and hostname) verification, driven by the
//! persisted `validate_certificate` flag.

use std::sync::Arc;

use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use crate::error::{ActorError, Result};
use crate::types::CertificateInfo;

/// AEAD + ECDHE allow-list (TLS 1.3 suites are AEAD by construction).
fn secure_cipher_suites() -> Vec<rustls::SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite as suites;
    vec![
        suites::TLS13_AES_256_GCM_SHA384,
        suites::TLS13_CHACHA20_POLY1305_SHA256,
        suites::TLS13_AES_128_GCM_SHA256,
        suites::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        suites::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        suites::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        suites::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        suites::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        suites::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

fn restricted_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: secure_cipher_suites(),
        ..rustls::crypto::ring::default_provider()
    }
}

/// Builds the client TLS configuration used for every broker call.
///
/// With `verify` unset, both certificate and hostname verification are
/// disabled (the broker may run on a self-signed certificate).
pub fn client_tls_config(verify: bool) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(restricted_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ActorError::Config(format!("TLS profile: {e}")))?;

    let config = if verify {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth()
    };
    Ok(config)
}

/// Builds the server TLS configuration from the broker-issued certificate.
pub fn server_tls_config(cert_info: &CertificateInfo) -> Result<rustls::ServerConfig> {
    let certs = parse_certificates(&cert_info.certificate)?;
    if certs.is_empty() {
        return Err(ActorError::Config(
            "no certificate found in broker material".into(),
        ));
    }
    let key = parse_private_key(&cert_info.key, &cert_info.password)?;

    rustls::ServerConfig::builder_with_provider(Arc::new(restricted_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ActorError::Config(format!("TLS profile: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ActorError::Config(format!("invalid certificate material: {e}")))
}

fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| ActorError::Config(format!("certificate parse: {e}")))
}

/// Accepts both plain keys (PKCS#8, RSA, SEC1) and PKCS#8 encrypted ones,
/// decrypted in memory with the password the broker sent along.
fn parse_private_key(pem: &str, password: &str) -> Result<PrivateKeyDer<'static>> {
    if pem.contains("ENCRYPTED PRIVATE KEY") {
        let der = pem_block(pem, "ENCRYPTED PRIVATE KEY")
            .ok_or_else(|| ActorError::Config("malformed encrypted key PEM".into()))?;
        let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(der.as_slice())
            .map_err(|e| ActorError::Config(format!("encrypted key parse: {e}")))?;
        let document = encrypted
            .decrypt(password)
            .map_err(|e| ActorError::Config(format!("private key decrypt: {e}")))?;
        return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            document.as_bytes().to_vec(),
        )));
    }

    let mut reader = std::io::Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ActorError::Config(format!("private key parse: {e}")))?
        .ok_or_else(|| ActorError::Config("no private key found in broker material".into()))
}

/// Extracts the DER payload of the first PEM block with the given label.
fn pem_block(pem: &str, label: &str) -> Option<Vec<u8>> {
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let start = pem.find(&begin)? + begin.len();
    let stop = pem[start..].find(&end)? + start;
    let body: String = pem[start..stop].chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(body).ok()
}

/// Verifier that accepts any server certificate. Only installed when the
/// operator has explicitly turned verification off.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
