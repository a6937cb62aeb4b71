//! SNI-based certificate selection for rustls
//!
//! Bridges the certificate cache into a rustls [`ResolvesServerCert`] so a
//! TLS server can serve managed certificates directly. ClientHellos that
//! advertise the `acme-tls/1` ALPN protocol are routed to the TLS-ALPN
//! challenge certificate for the requested name instead of the regular one.

use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{trace, warn};

use crate::cache::Cache;

/// ALPN protocol identifier for the TLS-ALPN-01 challenge (RFC 8737)
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// Resolver serving certificates out of a [`Cache`]
#[derive(Debug)]
pub struct CertResolver {
    cache: Arc<Cache>,
}

impl CertResolver {
    /// Create a resolver over the given cache
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    fn resolve_name(&self, server_name: Option<&str>, is_alpn_challenge: bool) -> Option<Arc<CertifiedKey>> {
        let sni = server_name?;

        if is_alpn_challenge {
            match self.cache.get_challenge_cert(sni) {
                Some(cert) => {
                    trace!(sni = %sni, "Serving TLS-ALPN challenge certificate");
                    return Some(cert.certified.clone());
                }
                None => {
                    warn!(sni = %sni, "No TLS-ALPN challenge certificate cached");
                    return None;
                }
            }
        }

        match self.cache.get_by_sni(sni) {
            Some(cert) => Some(cert.certified.clone()),
            None => {
                warn!(sni = %sni, "No certificate found");
                None
            }
        }
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let is_alpn_challenge = client_hello
            .alpn()
            .map(|mut protos| protos.any(|p| p == ACME_TLS_ALPN_PROTOCOL))
            .unwrap_or(false);
        let server_name = client_hello.server_name().map(|s| s.to_string());
        self.resolve_name(server_name.as_deref(), is_alpn_challenge)
    }
}
