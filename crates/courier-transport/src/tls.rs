// Server-side TLS material loading.
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

#[derive(thiserror::Error, Debug)]
pub enum TlsConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid pem: {0}")]
    Pem(#[source] io::Error),
    #[error("no certificates found")]
    NoCertificates,
    #[error("no private key found")]
    NoPrivateKey,
    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
}

fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsConfigError::Pem)?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates);
    }
    Ok(certs)
}

fn key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(TlsConfigError::Pem)?
        .ok_or(TlsConfigError::NoPrivateKey)
}

/// Build a server config from a PEM certificate chain and private key.
pub fn server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let certs = certs_from_pem(cert_pem)?;
    let key = key_from_pem(key_pem)?;
    let config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, TlsConfigError> {
    Ok(TlsAcceptor::from(server_config_from_pem(cert_pem, key_pem)?))
}

pub fn acceptor_from_files(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<TlsAcceptor, TlsConfigError> {
    let read = |path: &Path| {
        std::fs::read(path).map_err(|source| TlsConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
    };
    let cert_pem = read(cert_path.as_ref())?;
    let key_pem = read(key_path.as_ref())?;
    let acceptor = acceptor_from_pem(&cert_pem, &key_pem)?;
    tracing::info!(cert = %cert_path.as_ref().display(), "loaded tls certificate");
    Ok(acceptor)
}
