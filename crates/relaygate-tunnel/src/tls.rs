//! TLS configuration for both tunnel ends
//!
//! The consumer side terminates TLS and requires a client certificate chained to the
//! gateway's trust roots. The provider side connects out with the gateway's own
//! certificate as client identity.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use crate::{Result, TunnelError};

// =============================================================================
// PEM Loading
// =============================================================================

/// Load certificates from a PEM file
///
/// # Errors
///
/// Returns a TLS error if the file cannot be read or holds no certificate.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::tls(format!("Failed to open certificate file '{path}': {e}")))?;
    read_certs(&mut BufReader::new(file), path)
}

/// Load a private key from a PEM file
///
/// # Errors
///
/// Returns a TLS error if the file cannot be read or holds no private key.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TunnelError::tls(format!("Failed to open private key file '{path}': {e}")))?;
    read_private_key(&mut BufReader::new(file), path)
}

/// Parse certificates from PEM text
///
/// # Errors
///
/// Returns a TLS error if the text holds no certificate.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    read_certs(&mut BufReader::new(pem), "<memory>")
}

/// Parse a private key from PEM text
///
/// # Errors
///
/// Returns a TLS error if the text holds no private key.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    read_private_key(&mut BufReader::new(pem), "<memory>")
}

fn read_certs(reader: &mut dyn BufRead, origin: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            TunnelError::tls(format!("Failed to parse certificates from '{origin}': {e}"))
        })?;

    if certs.is_empty() {
        return Err(TunnelError::tls(format!("No certificates found in '{origin}'")));
    }

    debug!(count = certs.len(), origin = %origin, "loaded certificates");
    Ok(certs)
}

fn read_private_key(reader: &mut dyn BufRead, origin: &str) -> Result<PrivateKeyDer<'static>> {
    loop {
        match rustls_pemfile::read_one(reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            // Certificates and other items may share the file
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(TunnelError::tls(format!("No private key found in '{origin}'")));
            }
            Err(e) => {
                return Err(TunnelError::tls(format!(
                    "Failed to parse private key from '{origin}': {e}"
                )));
            }
        }
    }
}

// =============================================================================
// Gateway Identity
// =============================================================================

/// Certificate, key and trust roots of one gateway
pub struct TlsIdentity {
    /// Certificate chain presented to peers, leaf first
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// Private key of the leaf certificate
    pub key: PrivateKeyDer<'static>,
    /// Certificates trusted to sign peer certificates
    pub trust_roots: Vec<CertificateDer<'static>>,
}

impl TlsIdentity {
    /// Build an identity from PEM text
    ///
    /// # Errors
    ///
    /// Returns a TLS error if any of the inputs fails to parse.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], trust_pem: &[u8]) -> Result<Self> {
        Ok(Self {
            cert_chain: parse_certs(cert_pem)?,
            key: parse_private_key(key_pem)?,
            trust_roots: parse_certs(trust_pem)?,
        })
    }

    /// Build an identity from PEM files
    ///
    /// # Errors
    ///
    /// Returns a TLS error if any of the files cannot be read or parsed.
    pub fn from_files(cert_path: &str, key_path: &str, trust_path: &str) -> Result<Self> {
        Ok(Self {
            cert_chain: load_certs(cert_path)?,
            key: load_private_key(key_path)?,
            trust_roots: load_certs(trust_path)?,
        })
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in &self.trust_roots {
            roots
                .add(cert.clone())
                .map_err(|e| TunnelError::tls(format!("Invalid trust root: {e}")))?;
        }
        Ok(roots)
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_chain", &self.cert_chain.len())
            .field("trust_roots", &self.trust_roots.len())
            .finish_non_exhaustive()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Create a server config that requires a client certificate signed by the
/// identity's trust roots
///
/// # Errors
///
/// Returns a TLS error if the verifier or the certificate cannot be set up.
pub fn server_config_with_client_auth(identity: &TlsIdentity) -> Result<ServerConfig> {
    let provider = provider();
    let roots = Arc::new(identity.root_store()?);
    let verifier = WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(&provider))
        .build()
        .map_err(|e| TunnelError::tls(format!("Failed to build client verifier: {e}")))?;

    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::tls(format!("Unsupported protocol versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.cert_chain.clone(), identity.key.clone_key())
        .map_err(|e| TunnelError::tls(format!("Failed to create server TLS config: {e}")))
}

/// Create a client config that trusts the identity's roots and presents its
/// certificate
///
/// # Errors
///
/// Returns a TLS error if the certificate or key is rejected.
pub fn client_config(identity: &TlsIdentity) -> Result<ClientConfig> {
    ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::tls(format!("Unsupported protocol versions: {e}")))?
        .with_root_certificates(identity.root_store()?)
        .with_client_auth_cert(identity.cert_chain.clone(), identity.key.clone_key())
        .map_err(|e| TunnelError::tls(format!("Failed to create client TLS config: {e}")))
}

// =============================================================================
// TLS Context
// =============================================================================

/// Ready TLS context shared by all sessions of a gateway
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsContext {
    /// Build both ends from one gateway identity
    ///
    /// # Errors
    ///
    /// Returns a TLS error if either config cannot be created.
    pub fn new(identity: &TlsIdentity) -> Result<Self> {
        let server = server_config_with_client_auth(identity)?;
        let client = client_config(identity)?;

        info!(
            chain_len = identity.cert_chain.len(),
            trust_roots = identity.trust_roots.len(),
            "created gateway TLS context"
        );

        Ok(Self::from_parts(
            TlsAcceptor::from(Arc::new(server)),
            TlsConnector::from(Arc::new(client)),
        ))
    }

    /// Wrap an existing acceptor and connector
    #[must_use]
    pub fn from_parts(acceptor: TlsAcceptor, connector: TlsConnector) -> Self {
        Self {
            acceptor,
            connector,
        }
    }

    /// Server side, used by consumer-side workers
    #[must_use]
    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    /// Client side, used by provider-side workers
    #[must_use]
    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}
