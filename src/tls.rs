//! Shared rustls plumbing: the crypto provider and the upstream client config.

use crate::error::{ConfigError, Result};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// ALPN offered on both sides of an intercepted tunnel; requests are parsed as HTTP/1.1.
pub const HTTP1_ALPN: &[u8] = b"http/1.1";

/// The ring provider, passed explicitly so no process-wide default is required.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(rustls::crypto::ring::default_provider()))
        .clone()
}

/// Build the verifying client config used for re-originated upstream TLS.
///
/// Trusts the webpki root set plus every certificate in `extra_roots`.
pub fn upstream_client_config(extra_roots: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    if let Some(path) = extra_roots {
        let pem = std::fs::read(path)?;
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| {
                ConfigError::Parse(format!("invalid certificate in {}: {e}", path.display()))
            })?;
            roots.add(cert).map_err(|e| {
                ConfigError::Parse(format!("unusable certificate in {}: {e}", path.display()))
            })?;
            added += 1;
        }
        if added == 0 {
            return Err(ConfigError::Parse(format!(
                "no certificates found in {}",
                path.display()
            ))
            .into());
        }
        tracing::debug!(path = %path.display(), added, "Loaded extra upstream roots");
    }

    let mut config = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Validation(format!("TLS protocol setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![HTTP1_ALPN.to_vec()];

    Ok(Arc::new(config))
}
