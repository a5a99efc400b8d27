//! TLS configuration utilities for the token store connection
//!
//! The gateway only ever dials out over TLS (to the token store); it never
//! terminates TLS itself, so only a client configuration is provided.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};

use crate::error::{GatewayError, Result};

/// Build a rustls client config trusting the webpki roots plus an optional
/// extra CA bundle (PEM).
pub fn create_client_tls_config(ca_path: Option<impl AsRef<Path>>) -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_path) = ca_path {
        for cert in load_pem_certs(ca_path.as_ref())? {
            root_store
                .add(cert)
                .map_err(|e| GatewayError::Tls(format!("Failed to add CA certificate: {}", e)))?;
        }
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Parse PEM-encoded certificates from a file
fn load_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)
        .map_err(|e| GatewayError::Tls(format!("Failed to read CA bundle {:?}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("Failed to parse CA bundle: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::Tls(format!(
            "No certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}
