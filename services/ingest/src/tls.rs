// TLS material loading for the mutually-authenticated listener. Vehicles
// must present a certificate chained to the configured fleet CA; peers
// without one are rejected during the QUIC handshake.
use anyhow::{Context, Result, anyhow};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use std::path::Path;
use std::sync::Arc;

use crate::config::TlsConfig;

pub fn build_server_config(tls: &TlsConfig) -> Result<quinn::ServerConfig> {
    let certs = load_certs(&tls.server_cert)?;
    let key = load_private_key(&tls.server_key)?;
    let roots = load_client_ca(&tls.client_ca)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("build client certificate verifier")?;
    let server_crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("build server TLS config")?;
    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
        .context("adapt TLS config for QUIC")?;
    Ok(quinn::ServerConfig::with_crypto(Arc::new(quic_crypto)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("read certificate: {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificate: {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates in {}", path.display()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("read private key: {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("parse private key: {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key in {}", path.display()))
}

fn load_client_ca(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .with_context(|| format!("add CA certificate from {}", path.display()))?;
    }
    Ok(roots)
}
