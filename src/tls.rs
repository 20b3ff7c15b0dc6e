//! TLS identity loading: PEM certificate chain + PKCS#1/ECDSA private key
//! into a `rustls::ServerConfig`.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::ServerConfig;

/// Parsed certificate chain + private key, reusable across every listener
/// that needs a TLS identity (DoT, DoH, DoQ via `quinn`).
pub struct CertificateMaterial {
    pub certs: Vec<rustls::pki_types::CertificateDer<'static>>,
    pub key: rustls::pki_types::PrivateKeyDer<'static>,
}

impl Clone for CertificateMaterial {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl CertificateMaterial {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)
            .with_context(|| format!("failed to read certificate file {}", cert_path.display()))?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("failed to read private key file {}", key_path.display()))?;

        let certs = rustls_pemfile::certs(&mut Cursor::new(&cert_pem))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to parse certificate chain PEM")?;
        anyhow::ensure!(!certs.is_empty(), "no certificates found in {}", cert_path.display());

        let key = rustls_pemfile::private_key(&mut Cursor::new(&key_pem))
            .context("failed to parse private key PEM")?
            .with_context(|| format!("no private key found in {}", key_path.display()))?;

        Ok(Self { certs, key })
    }

    /// A plain `rustls::ServerConfig` with no client auth and no ALPN,
    /// used by the DoT listener.
    pub fn server_config_no_alpn(&self) -> Result<Arc<ServerConfig>> {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .context("failed to build rustls ServerConfig")?;
        Ok(Arc::new(config))
    }

    /// A `rustls::ServerConfig` with the given ALPN protocols advertised,
    /// used by the DoH (h2/http1.1) and DoQ (doq) listeners.
    pub fn server_config_with_alpn(&self, alpn: Vec<Vec<u8>>) -> Result<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .context("failed to build rustls ServerConfig")?;
        config.alpn_protocols = alpn;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{generate_simple_self_signed, CertifiedKey};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_test_cert() -> (NamedTempFile, NamedTempFile) {
        let CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let mut cert_file = NamedTempFile::new().unwrap();
        cert_file.write_all(cert.pem().as_bytes()).unwrap();

        let mut key_file = NamedTempFile::new().unwrap();
        key_file.write_all(signing_key.serialize_pem().as_bytes()).unwrap();

        (cert_file, key_file)
    }

    #[test]
    fn loads_valid_cert_and_key() {
        let (cert, key) = write_test_cert();
        let material = CertificateMaterial::load(cert.path(), key.path()).unwrap();
        assert_eq!(material.certs.len(), 1);
    }

    #[test]
    fn builds_server_config_with_alpn() {
        let (cert, key) = write_test_cert();
        let material = CertificateMaterial::load(cert.path(), key.path()).unwrap();
        let config = material
            .server_config_with_alpn(vec![b"doq".to_vec()])
            .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"doq".to_vec()]);
    }

    #[test]
    fn errors_on_missing_file() {
        let result = CertificateMaterial::load(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(result.is_err());
    }
}
