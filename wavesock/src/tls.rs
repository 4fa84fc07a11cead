//! TLS configuration for both roles.
//!
//! Servers present a PEM certificate chain and key (loaded from disk, from
//! memory, or generated self-signed). Clients verify against the webpki root
//! store by default; verification can be disabled for self-signed
//! deployments.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, DnType, Ia5String, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::WsError;

/// How a client checks the server certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Verify the peer against the webpki root store.
    #[default]
    Full,
    /// Accept any certificate. Only sensible against self-signed servers.
    None,
}

/// Build a client-side TLS connector for the given verification mode.
pub(crate) fn connector(mode: VerifyMode) -> TlsConnector {
    let config = match mode {
        VerifyMode::Full => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        VerifyMode::None => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth(),
    };
    TlsConnector::from(Arc::new(config))
}

/// Certificate verifier that accepts anything the peer presents.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// A server-side TLS identity: certificate chain plus private key, ready to
/// hand to the acceptor.
#[derive(Clone)]
pub struct TlsIdentity {
    config: Arc<rustls::ServerConfig>,
    cert_pem: String,
}

impl TlsIdentity {
    /// Build an identity from in-memory PEM data.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, WsError> {
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| WsError::Certificate(e.to_string()))?;
        if certs.is_empty() {
            return Err(WsError::Certificate("no certificate found in PEM".into()));
        }

        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(|e| WsError::Certificate(e.to_string()))?
            .ok_or_else(|| WsError::Certificate("no private key found in PEM".into()))?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(Self {
            config: Arc::new(config),
            cert_pem: cert_pem.to_string(),
        })
    }

    /// Build an identity from PEM files on disk.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, WsError> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Generate a fresh self-signed identity for the given subject names.
    /// Names that parse as IP addresses become IP SANs, the rest DNS SANs.
    pub fn self_signed(subject_names: &[&str]) -> Result<Self, WsError> {
        let key_pair =
            KeyPair::generate().map_err(|e| WsError::Certificate(e.to_string()))?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "wavesock server");
        params.subject_alt_names = subject_names
            .iter()
            .map(|&name| match name.parse::<IpAddr>() {
                Ok(ip) => Ok(SanType::IpAddress(ip)),
                Err(_) => Ia5String::try_from(name)
                    .map(SanType::DnsName)
                    .map_err(|e| WsError::Certificate(e.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| WsError::Certificate(e.to_string()))?;

        Self::from_pem(&cert.pem(), &key_pair.serialize_pem())
    }

    /// The identity's certificate chain as PEM, e.g. for distributing to
    /// clients that pin self-signed material.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.clone())
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity").finish_non_exhaustive()
    }
}
