use crate::config::SslConfig;
use crate::error::{RouterError, RouterResult};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig,
};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Build the acceptor for the public listener, `None` when TLS is off
pub fn build_acceptor(config: &SslConfig) -> RouterResult<Option<TlsAcceptor>> {
    if !config.enabled {
        debug!("TLS is disabled");
        return Ok(None);
    }

    let cert_path = config
        .cert_file
        .as_deref()
        .ok_or_else(|| RouterError::config("Certificate path not provided"))?;
    let key_path = config
        .key_file
        .as_deref()
        .ok_or_else(|| RouterError::config("Private key path not provided"))?;

    let (cert_chain, key) = load_certificate_and_key(cert_path, key_path)?;
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| RouterError::config(format!("Failed to create TLS config: {}", e)))?;

    info!(cert_file = %cert_path, "TLS termination enabled");
    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

fn load_certificate_and_key(
    cert_path: &str,
    key_path: &str,
) -> RouterResult<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    debug!(cert_path = %cert_path, key_path = %key_path, "Loading certificate and key");

    let cert_file = File::open(cert_path).map_err(|e| {
        RouterError::config(format!(
            "Failed to open certificate file {}: {}",
            cert_path, e
        ))
    })?;
    let cert_chain = certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RouterError::config(format!("Failed to parse certificate: {}", e)))?;
    if cert_chain.is_empty() {
        return Err(RouterError::config(format!(
            "No certificates found in file: {}",
            cert_path
        )));
    }

    let key_file = File::open(key_path).map_err(|e| {
        RouterError::config(format!(
            "Failed to open private key file {}: {}",
            key_path, e
        ))
    })?;
    let key = private_key(&mut BufReader::new(key_file))
        .map_err(|e| RouterError::config(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| RouterError::config("No private keys found in key file"))?;

    Ok((cert_chain, key))
}
