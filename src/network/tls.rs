//! Mutual TLS setup
//!
//! Both sides load a CA bundle, a certificate chain and a private key from
//! PEM files. The server requires and verifies a client certificate against
//! the CA; the client verifies the server certificate against the same CA.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsConfig;
use crate::protocol::ALPN_PROTOCOL;

/// TLS setup errors
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Invalid server name `{0}`")]
    InvalidServerName(String),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Client verifier error: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

pub type TlsResult<T> = Result<T, TlsError>;

fn open(path: &Path) -> TlsResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

/// Load every certificate in a PEM file
pub fn load_certs(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file
pub fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Build a root store from a CA bundle
pub fn load_roots(path: &Path) -> TlsResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Acceptor that demands a client certificate signed by the configured CA
pub fn server_acceptor(config: &TlsConfig) -> TlsResult<TlsAcceptor> {
    let roots = load_roots(&config.ca)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build()?;

    let mut server_config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&config.cert)?, load_private_key(&config.key)?)?;
    server_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    tracing::debug!("Loaded server TLS identity from {}", config.cert.display());
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Connector that presents the client certificate and trusts only the configured CA
pub fn client_connector(config: &TlsConfig) -> TlsResult<TlsConnector> {
    let roots = load_roots(&config.ca)?;

    let mut client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(&config.cert)?, load_private_key(&config.key)?)?;
    client_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    tracing::debug!("Loaded client TLS identity from {}", config.cert.display());
    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Parse the name the server certificate must match
pub fn server_name(name: &str) -> TlsResult<ServerName<'static>> {
    ServerName::try_from(name.to_string()).map_err(|_| TlsError::InvalidServerName(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_certs(&dir.path().join("ca.pem"));
        assert!(matches!(result, Err(TlsError::Read { .. })));
    }

    #[test]
    fn test_file_without_pem_blocks() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        assert!(matches!(load_certs(file.path()), Err(TlsError::NoCertificates(_))));
        assert!(matches!(load_private_key(file.path()), Err(TlsError::NoPrivateKey(_))));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("pushbuild").is_ok());
        assert!(server_name("10.0.0.1").is_ok());
        assert!(matches!(server_name("bad name!"), Err(TlsError::InvalidServerName(_))));
    }
}
