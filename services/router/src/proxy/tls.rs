//! TLS termination and backend TLS.
//!
//! The listener side obtains one certificate per `serve` call from a
//! [`CertificateIssuer`] and terminates every inbound handshake with it.
//! The backend side upgrades `tls://` targets according to [`BackendTls`].

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tracing::debug;

/// A certificate chain and its private key.
#[derive(Debug)]
pub struct IssuedCertificate {
    /// Leaf first, followed by any intermediates.
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for IssuedCertificate {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Issues a certificate for a hostname.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, hostname: &str) -> Result<IssuedCertificate>;
}

/// Issues a fresh self-signed certificate per call.
#[derive(Debug, Clone, Default)]
pub struct SelfSignedIssuer;

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, hostname: &str) -> Result<IssuedCertificate> {
        let certified = rcgen::generate_simple_self_signed(vec![hostname.to_string()])
            .with_context(|| format!("generate self-signed certificate for {hostname}"))?;

        debug!(hostname = %hostname, "Issued self-signed certificate");

        Ok(IssuedCertificate {
            cert_chain: vec![certified.cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                certified.key_pair.serialize_der(),
            )),
        })
    }
}

/// Issues leaf certificates signed by a router-held CA.
///
/// Clients trust [`CaIssuer::ca_cert_der`] once and accept every hostname the
/// router serves.
pub struct CaIssuer {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

impl fmt::Debug for CaIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaIssuer").finish_non_exhaustive()
    }
}

impl CaIssuer {
    /// Generate a new CA with the given common name.
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate().context("generate CA key")?;
        let ca_cert = params.self_signed(&ca_key).context("self-sign CA")?;

        Ok(Self { ca_cert, ca_key })
    }

    /// DER encoding of the CA certificate.
    pub fn ca_cert_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// PEM encoding of the CA certificate.
    pub fn ca_cert_pem(&self) -> String {
        self.ca_cert.pem()
    }
}

#[async_trait]
impl CertificateIssuer for CaIssuer {
    async fn issue(&self, hostname: &str) -> Result<IssuedCertificate> {
        let mut params = CertificateParams::new(vec![hostname.to_string()])
            .with_context(|| format!("invalid certificate hostname {hostname}"))?;
        params.distinguished_name.push(DnType::CommonName, hostname);
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let key = KeyPair::generate().context("generate leaf key")?;
        let leaf = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .with_context(|| format!("sign certificate for {hostname}"))?;

        debug!(hostname = %hostname, "Issued CA-signed certificate");

        Ok(IssuedCertificate {
            cert_chain: vec![leaf.der().clone(), self.ca_cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        })
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the terminating server config for one issued certificate.
pub fn server_config(cert: IssuedCertificate) -> Result<Arc<ServerConfig>, rustls::Error> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(cert.cert_chain, cert.key)?;
    Ok(Arc::new(config))
}

/// How `tls://` targets are authenticated.
#[derive(Clone, Default)]
pub enum BackendTls {
    /// Accept any backend certificate. Backend identity is trusted by network
    /// topology, not by PKI.
    #[default]
    SkipVerification,
    /// Validate the backend chain and name against these roots.
    Verify(Arc<RootCertStore>),
}

impl fmt::Debug for BackendTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendTls::SkipVerification => f.write_str("SkipVerification"),
            BackendTls::Verify(roots) => write!(f, "Verify({} roots)", roots.len()),
        }
    }
}

impl BackendTls {
    /// Build the client config used to upgrade backend connections.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, rustls::Error> {
        let provider = provider();
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let config = match self {
            BackendTls::SkipVerification => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
                .with_no_client_auth(),
            BackendTls::Verify(roots) => builder
                .with_root_certificates(Arc::clone(roots))
                .with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}

/// Server name presented to a backend; IP literals are accepted.
pub fn backend_server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .with_context(|| format!("invalid backend server name {host}"))
}

/// Accepts any certificate chain but still checks handshake signatures.
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
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
