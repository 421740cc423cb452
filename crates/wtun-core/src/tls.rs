//! TLS 1.2 configuration for the tunnel link.
//!
//! Both ends present a certificate. Peer certificates are accepted without
//! chain validation (trust comes from the bearer token exchanged inside the
//! TLS session), but handshake signatures are still verified so the peer
//! must hold the private key of the certificate it sends.

use crate::error::{TunnelError, TunnelResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Certificate chain plus private key.
pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// Load a PEM certificate chain and private key.
    pub fn load(cert_path: &Path, key_path: &Path) -> TunnelResult<Self> {
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            TunnelError::Tls(format!("cannot read cert {}: {e}", cert_path.display()))
        })?;
        let key_pem = std::fs::read(key_path).map_err(|e| {
            TunnelError::Tls(format!("cannot read key {}: {e}", key_path.display()))
        })?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(TunnelError::Tls(format!(
                "no certificate found in {}",
                cert_path.display()
            )));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or_else(|| {
            TunnelError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

        debug!(cert = %cert_path.display(), chain_len = certs.len(), "loaded TLS material");
        Ok(Self { certs, key })
    }

    /// Generate an in-memory self-signed certificate for `common_name`.
    pub fn self_signed(common_name: &str) -> TunnelResult<Self> {
        let mut params =
            rcgen::CertificateParams::new(vec![common_name.to_string()]).map_err(rcgen_err)?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);

        let key_pair = rcgen::KeyPair::generate().map_err(rcgen_err)?;
        let cert = params.self_signed(&key_pair).map_err(rcgen_err)?;

        Ok(Self {
            certs: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }

    /// Load from files when both paths are given, otherwise generate.
    pub fn load_or_generate(
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
        common_name: &str,
    ) -> TunnelResult<Self> {
        match (cert_path, key_path) {
            (Some(cert), Some(key)) => Self::load(cert, key),
            (None, None) => {
                info!(common_name, "no certificate configured, using a self-signed one");
                Self::self_signed(common_name)
            }
            _ => Err(TunnelError::Tls(
                "certificate and key must be configured together".into(),
            )),
        }
    }
}

fn rcgen_err(e: rcgen::Error) -> TunnelError {
    TunnelError::Tls(format!("certificate generation failed: {e}"))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server side: TLS 1.2 only, asks every client for a certificate.
pub fn server_config(
    material: &TlsMaterial,
    require_client_cert: bool,
) -> TunnelResult<rustls::ServerConfig> {
    let provider = provider();
    let verifier = AcceptAnyClientCert {
        algorithms: provider.signature_verification_algorithms,
        mandatory: require_client_cert,
    };
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(material.certs.clone(), material.key.clone_key())?;
    Ok(config)
}

/// Client side: TLS 1.2 only, presents `material` as the client certificate.
pub fn client_config(material: &TlsMaterial) -> TunnelResult<rustls::ClientConfig> {
    let provider = provider();
    let verifier = AcceptAnyServerCert {
        algorithms: provider.signature_verification_algorithms,
    };
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(material.certs.clone(), material.key.clone_key())?;
    Ok(config)
}

/// Parse the name the client sends as SNI.
pub fn server_name(name: &str) -> TunnelResult<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| TunnelError::Tls(format!("invalid server name {name:?}: {e}")))
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[derive(Debug)]
struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
    mandatory: bool,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
