//! TLS client configuration for destinations with `tls_policy != none`.
//! Verification is against the Mozilla root set
//! compiled in by `webpki-roots`; the core has no per-destination pinning.

use std::sync::Arc;

pub fn client_config() -> Arc<rustls::ClientConfig> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}
