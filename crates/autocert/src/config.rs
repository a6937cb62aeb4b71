//! ACME manager configuration
//!
//! One [`AcmeConfig`] per managed CA/account pair. Defaults target Let's
//! Encrypt production, with the staging endpoint as the diagnostic test CA.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;

use crate::solver::DnsProvider;

/// Default ACME directory URL (Let's Encrypt production)
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory URL (for diagnostics and testing)
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Standard port the HTTP-01 challenge must be answered on
pub const HTTP_CHALLENGE_PORT: u16 = 80;

/// Standard port the TLS-ALPN-01 challenge must be answered on
pub const TLS_ALPN_CHALLENGE_PORT: u16 = 443;

/// Timeout for outbound HTTP requests to the CA
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a TLS handshake on the ALPN challenge server
pub const ALPN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wall-clock budget for a whole certificate order
pub const DEFAULT_CERT_OBTAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// How many new ACME transactions may start per rate-limit window
pub const RATE_LIMIT_EVENTS: usize = 10;

/// The sliding window over which [`RATE_LIMIT_EVENTS`] is enforced
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Default interval between renewal sweeps of the certificate cache
pub const DEFAULT_RENEW_CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default interval between OCSP staple freshness sweeps
pub const DEFAULT_OCSP_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// External Account Binding credentials (RFC 8555 §7.3.4)
///
/// Some CAs (e.g. ZeroSSL) hand out a key id plus a base64-encoded HMAC key
/// that must be presented when the ACME account is created.
#[derive(Debug, Clone)]
pub struct ExternalAccountBinding {
    /// Key identifier issued by the CA
    pub key_id: String,
    /// Base64-encoded HMAC key issued by the CA
    pub hmac_b64: String,
}

/// Configuration for an ACME certificate manager
#[derive(Clone)]
pub struct AcmeConfig {
    /// Primary CA directory URL
    pub ca: String,
    /// Alternate CA used only as a diagnostic when the primary fails
    pub test_ca: Option<String>,
    /// Account email; empty means derive from storage or use none
    pub email: String,
    /// Whether the user has agreed to the CA's terms of service
    pub agreed: bool,
    /// External Account Binding, if the CA requires one
    pub external_account: Option<ExternalAccountBinding>,
    /// DNS provider; when set, the DNS-01 challenge is used exclusively
    pub dns_provider: Option<Arc<dyn DnsProvider>>,
    /// Disable the HTTP-01 challenge
    pub disable_http_challenge: bool,
    /// Disable the TLS-ALPN-01 challenge
    pub disable_tls_alpn_challenge: bool,
    /// Alternate port for the HTTP-01 challenge listener
    pub alt_http_port: Option<u16>,
    /// Alternate port for the TLS-ALPN-01 challenge listener
    pub alt_tls_alpn_port: Option<u16>,
    /// Host to bind challenge listeners on
    pub listen_host: String,
    /// Wall-clock budget for one certificate order
    pub cert_obtain_timeout: Duration,
    /// Reuse the stored private key when renewing
    pub reuse_private_keys: bool,
    /// Extra root CAs trusted by the outbound HTTP client (for private CAs)
    pub trusted_roots: Option<Vec<CertificateDer<'static>>>,
    /// Interval between renewal sweeps
    pub renew_check_interval: Duration,
    /// Interval between OCSP staple sweeps
    pub ocsp_check_interval: Duration,
    /// Fixed RNG seed for challenge selection; None draws from the OS
    pub challenge_rng_seed: Option<u64>,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            ca: LETS_ENCRYPT_PRODUCTION.to_string(),
            test_ca: Some(LETS_ENCRYPT_STAGING.to_string()),
            email: String::new(),
            agreed: false,
            external_account: None,
            dns_provider: None,
            disable_http_challenge: false,
            disable_tls_alpn_challenge: false,
            alt_http_port: None,
            alt_tls_alpn_port: None,
            listen_host: "0.0.0.0".to_string(),
            cert_obtain_timeout: DEFAULT_CERT_OBTAIN_TIMEOUT,
            reuse_private_keys: false,
            trusted_roots: None,
            renew_check_interval: DEFAULT_RENEW_CHECK_INTERVAL,
            ocsp_check_interval: DEFAULT_OCSP_CHECK_INTERVAL,
            challenge_rng_seed: None,
        }
    }
}

impl std::fmt::Debug for AcmeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeConfig")
            .field("ca", &self.ca)
            .field("test_ca", &self.test_ca)
            .field("email", &self.email)
            .field("agreed", &self.agreed)
            .field("has_external_account", &self.external_account.is_some())
            .field("has_dns_provider", &self.dns_provider.is_some())
            .field("disable_http_challenge", &self.disable_http_challenge)
            .field("disable_tls_alpn_challenge", &self.disable_tls_alpn_challenge)
            .field("alt_http_port", &self.alt_http_port)
            .field("alt_tls_alpn_port", &self.alt_tls_alpn_port)
            .field("listen_host", &self.listen_host)
            .field("cert_obtain_timeout", &self.cert_obtain_timeout)
            .field("reuse_private_keys", &self.reuse_private_keys)
            .finish()
    }
}

impl AcmeConfig {
    /// The port the HTTP-01 challenge listener should bind
    pub fn http_challenge_port(&self) -> u16 {
        self.alt_http_port.unwrap_or(HTTP_CHALLENGE_PORT)
    }

    /// The port the TLS-ALPN-01 challenge listener should bind
    pub fn tls_alpn_challenge_port(&self) -> u16 {
        self.alt_tls_alpn_port.unwrap_or(TLS_ALPN_CHALLENGE_PORT)
    }

    /// Bind address for the HTTP-01 challenge listener
    pub fn http_challenge_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.http_challenge_port())
    }

    /// Bind address for the TLS-ALPN-01 challenge listener
    pub fn tls_alpn_challenge_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.tls_alpn_challenge_port())
    }
}
