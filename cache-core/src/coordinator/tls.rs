// cache-core/src/coordinator/tls.rs

//! rustls configuration for the coordinator server and client.
//!
//! Both sides use the ring crypto provider explicitly, so no process-wide
//! default provider has to be installed.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::config::CoordinatorConfig;
use crate::error::{CacheError, Result};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Server configuration from a PEM certificate chain and private key.
///
/// # Errors
///
/// Returns an error if either file cannot be read or holds no usable item.
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| CacheError::config_with_source("unsupported TLS protocol versions", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CacheError::config_with_source("failed to set server certificate", e))
}

/// Client configuration honouring `skip_verify` and `ca_file`.
///
/// Without `skip_verify` the server is checked against the bundled web PKI
/// roots plus every certificate in `ca_file`.
pub fn client_config(config: &CoordinatorConfig) -> Result<ClientConfig> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| CacheError::config_with_source("unsupported TLS protocol versions", e))?;

    if config.skip_verify {
        tracing::warn!("TLS certificate verification is disabled for {}", config.url);
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth());
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca_file) = &config.ca_file {
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .map_err(|e| CacheError::config_with_source("failed to add CA certificate", e))?;
        }
    }
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| CacheError::storage_with_source(path, "failed to open certificate file", e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| CacheError::storage_with_source(path, "failed to parse certificates", e))?;
    if certs.is_empty() {
        return Err(CacheError::config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| CacheError::storage_with_source(path, "failed to open key file", e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| CacheError::storage_with_source(path, "failed to parse private key", e))?
        .ok_or_else(|| CacheError::config(format!("no private key found in {}", path.display())))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
