use crate::config::SslConfig;
use crate::GatewayError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Builds a `TlsAcceptor` from a port's SSL config. Returns `None` when TLS
/// is not enabled for this port — the acceptor then serves plaintext.
pub fn build_acceptor(ssl: &SslConfig) -> Result<Option<TlsAcceptor>, GatewayError> {
    if !ssl.enabled {
        return Ok(None);
    }

    let cert_path = ssl
        .cert_file
        .as_ref()
        .ok_or_else(|| GatewayError::Tls("ssl.enabled requires cert_file".into()))?;
    let key_path = ssl
        .key_file
        .as_ref()
        .ok_or_else(|| GatewayError::Tls("ssl.enabled requires key_file".into()))?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Tls(format!("invalid certificate/key pair: {e}")))?;

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, GatewayError> {
    let file = File::open(path)
        .map_err(|e| GatewayError::Tls(format!("cannot open cert_file '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("cannot parse cert_file '{path}': {e}")))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, GatewayError> {
    let file = File::open(path)
        .map_err(|e| GatewayError::Tls(format!("cannot open key_file '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GatewayError::Tls(format!("cannot parse key_file '{path}': {e}")))?
        .ok_or_else(|| GatewayError::Tls(format!("no private key found in '{path}'")))
}

/// Whether a fatal handshake error is actually the common, harmless
/// client-abort case (browser probing plaintext port, load balancer health
/// check without SNI, etc). Such errors are tolerated silently per §4.G.
pub fn is_benign_handshake_error(err: &std::io::Error) -> bool {
    let msg = err.to_string();
    msg.contains("CertificateUnknown") || msg.contains("UnknownCA") || msg.contains("peer closed connection without sending TLS close_notify")
}
