//! DNS-01 challenge solver
//!
//! Publishes the challenge digest as a TXT record through a pluggable
//! provider. No listener is involved; propagation waiting, if any, is the
//! provider's concern.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::Solver;
use crate::error::Result;

/// Pluggable DNS backend for the DNS-01 challenge
#[async_trait]
pub trait DnsProvider: Send + Sync + std::fmt::Debug {
    /// Create or replace a TXT record
    async fn put_txt_record(&self, zone: &str, name: &str, value: &str) -> Result<()>;

    /// Delete a TXT record
    async fn delete_txt_record(&self, zone: &str, name: &str) -> Result<()>;
}

/// Solver answering DNS-01 challenges through a [`DnsProvider`]
#[derive(Debug)]
pub struct DnsSolver {
    provider: Arc<dyn DnsProvider>,
}

impl DnsSolver {
    /// Create a solver over the given provider
    pub fn new(provider: Arc<dyn DnsProvider>) -> Self {
        Self { provider }
    }
}

/// The TXT record name for a domain's DNS-01 challenge
pub fn challenge_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}

/// The TXT record value: base64url of the SHA-256 of the key authorization
pub fn challenge_record_value(key_auth: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth.as_bytes()))
}

#[async_trait]
impl Solver for DnsSolver {
    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        let name = challenge_record_name(domain);
        let value = challenge_record_value(key_auth);
        debug!(domain = %domain, record = %name, "Publishing DNS-01 TXT record");
        self.provider.put_txt_record(domain, &name, &value).await
    }

    async fn clean_up(&self, domain: &str, _token: &str, _key_auth: &str) -> Result<()> {
        let name = challenge_record_name(domain);
        debug!(domain = %domain, record = %name, "Removing DNS-01 TXT record");
        self.provider.delete_txt_record(domain, &name).await
    }
}
