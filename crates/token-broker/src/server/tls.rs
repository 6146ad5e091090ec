//! Serving certificate loading

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;
use crate::{Error, Result};

/// Build a TLS acceptor from the configured PEM files.
pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_pem = read_pem(&config.cert_path)?;
    let key_pem = read_pem(&config.key_path)?;
    let server_config = server_config(&cert_pem, &key_pem)?;

    tracing::info!(
        cert = %config.cert_path.display(),
        "Loaded serving certificate"
    );
    Ok(TlsAcceptor::from(server_config))
}

/// rustls server config for one certificate chain and key, HTTP/1.1 only.
///
/// The ring provider is passed explicitly; no process-wide default is installed.
pub fn server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("No certificate found in PEM".into()));
    }

    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| Error::Tls(format!("Invalid private key PEM: {e}")))?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Tls(format!("Certificate and key rejected: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::Tls(format!("Failed to read {}: {e}", path.display())))
}
