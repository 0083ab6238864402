//! TLS context helper.
//!
//! Certificate management is the caller's business; this module only
//! enforces the transport policy of the framework: TLS 1.2/1.3 only and
//! ALPN advertising `h2` ahead of `http/1.1` so capable clients negotiate
//! HTTP/2 directly.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use blixt_core::error::BoxError;

/// The ALPN protocols this server speaks, preferred first.
#[must_use]
pub fn alpn_protocols() -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
}

/// Build a server config from a certificate chain and private key.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, BoxError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;
    config.alpn_protocols = alpn_protocols();
    Ok(Arc::new(config))
}
