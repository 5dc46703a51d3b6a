//! TLS termination for the tunnel listener

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::TcpServerError;

/// Load TLS certificates from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TcpServerError> {
    let file = File::open(path)
        .map_err(|e| TcpServerError::Tls(format!("Failed to open cert file {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TcpServerError::Tls(format!("Failed to parse certs: {}", e)))?;
    if certs.is_empty() {
        return Err(TcpServerError::Tls(format!("No certificates in {}", path.display())));
    }
    Ok(certs)
}

/// Load the first private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TcpServerError> {
    let file = File::open(path)
        .map_err(|e| TcpServerError::Tls(format!("Failed to open key file {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TcpServerError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TcpServerError::Tls("No private key found".to_string()))
}

pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TcpServerError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TcpServerError::Tls(format!("Invalid cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_reported() {
        let err = load_certs(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(err.to_string().contains("Failed to open cert file"));

        let err = load_private_key(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(err.to_string().contains("Failed to open key file"));
    }

    #[test]
    fn test_empty_pem_has_no_key() {
        let dir = std::env::temp_dir().join(format!("gatehouse-tls-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.pem");
        std::fs::write(&path, "").unwrap();

        assert!(load_certs(&path).is_err());
        assert!(matches!(
            load_private_key(&path),
            Err(TcpServerError::Tls(msg)) if msg == "No private key found"
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
