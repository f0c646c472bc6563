//! TLS credential loading.
//!
//! Builds the rustls server configuration shared by all handshake offload
//! workers. Certificates and keys are PEM files on disk.

use crate::config::TlsConfig;
use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Load a certificate chain and private key into a rustls server config.
pub fn load_server_config(tls: &TlsConfig) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    let certs = load_certs(&tls.cert)?;
    let key = load_key(&tls.key)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::TlsSetup(e.to_string()))?;

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsSetup(format!("open {}: {e}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::TlsSetup(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ServerError::TlsSetup(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsSetup(format!("open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ServerError::TlsSetup(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| {
            ServerError::TlsSetup(format!("no private key found in {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_self_signed_pair() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        File::create(&cert_path)
            .unwrap()
            .write_all(cert.cert.pem().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(cert.key_pair.serialize_pem().as_bytes())
            .unwrap();

        let config = load_server_config(&TlsConfig {
            cert: cert_path,
            key: key_path,
            handshake_workers: 1,
        })
        .unwrap();
        assert!(Arc::strong_count(&config) >= 1);
    }

    #[test]
    fn test_missing_cert_file() {
        let err = load_server_config(&TlsConfig {
            cert: "/nonexistent/server.crt".into(),
            key: "/nonexistent/server.key".into(),
            handshake_workers: 1,
        })
        .unwrap_err();
        assert!(matches!(err, ServerError::TlsSetup(_)));
    }
}
