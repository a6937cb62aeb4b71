//! Certificate lifecycle engine
//!
//! The orchestrator: decides when to obtain, renew, or revoke, serializes
//! work per name through the job manager and a cross-process storage lock,
//! rotates challenge types on validation failures, and is the one layer
//! that logs user-visible failures.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acme::AcmeClient;
use crate::cache::{Cache, CachedCert};
use crate::config::AcmeConfig;
use crate::error::{Error, Result};
use crate::resolver::{CertResolver, ACME_TLS_ALPN_PROTOCOL};
use crate::retry;
use crate::runtime::Runtime;
use crate::storage::{keys, Storage};

/// A certificate as persisted to storage
///
/// Invariants: `sans` is non-empty and the leaf certificate's public key
/// matches `private_key_pem`.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateResource {
    /// Subject alternative names the certificate covers
    pub sans: Vec<String>,
    /// PEM-encoded certificate chain
    pub certificate_pem: String,
    /// PEM-encoded private key
    pub private_key_pem: String,
    /// Issuer-specific metadata, kept opaque
    pub issuer_data: serde_json::Value,
}

/// The JSON sidecar stored next to the certificate and key
#[derive(Debug, Serialize, Deserialize)]
struct ResourceMeta {
    sans: Vec<String>,
    issuer_data: serde_json::Value,
}

/// Automatic certificate manager for one CA/account configuration
pub struct AcmeManager {
    config: AcmeConfig,
    storage: Arc<dyn Storage>,
    cache: Arc<Cache>,
    runtime: Arc<Runtime>,
    issuer_key: String,
    managed: RwLock<HashSet<String>>,
    cancel: CancellationToken,
}

impl AcmeManager {
    /// Create a manager and register it with the cache for renewals
    pub fn new(
        config: AcmeConfig,
        storage: Arc<dyn Storage>,
        cache: Arc<Cache>,
        runtime: Arc<Runtime>,
    ) -> Arc<Self> {
        let issuer_key = keys::issuer_key(&config.ca);
        let manager = Arc::new(Self {
            config,
            storage,
            cache: cache.clone(),
            runtime,
            issuer_key,
            managed: RwLock::new(HashSet::new()),
            cancel: CancellationToken::new(),
        });

        // the cache's renewal sweep finds its way back here through this
        // capability; no back pointer from cache to manager
        let weak = Arc::downgrade(&manager);
        cache.set_config_getter(Box::new(move |cert| {
            let manager = weak.upgrade()?;
            if cert.names.iter().any(|name| manager.is_managed(name)) {
                Some(manager)
            } else {
                None
            }
        }));

        manager
    }

    /// The configuration this manager runs with
    pub fn config(&self) -> &AcmeConfig {
        &self.config
    }

    /// The certificate cache backing this manager
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Storage namespace of the primary CA
    pub fn issuer_key(&self) -> &str {
        &self.issuer_key
    }

    /// A rustls certificate resolver serving this manager's cache
    pub fn resolver(&self) -> Arc<CertResolver> {
        Arc::new(CertResolver::new(self.cache.clone()))
    }

    /// A rustls server config serving managed certificates, with the
    /// `acme-tls/1` protocol enabled so TLS-ALPN challenges are answered
    /// on the caller's own listener
    pub fn tls_config(&self) -> rustls::ServerConfig {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.resolver());
        config.alpn_protocols = vec![
            b"h2".to_vec(),
            b"http/1.1".to_vec(),
            ACME_TLS_ALPN_PROTOCOL.to_vec(),
        ];
        config
    }

    /// Begin managing `names`: certificates are obtained in the background
    /// as needed and kept renewed until the process exits or the name is
    /// removed with [`AcmeManager::unmanage`].
    pub fn manage(self: &Arc<Self>, names: &[impl AsRef<str>]) -> Result<()> {
        for name in names {
            validate_name(name.as_ref())?;
        }

        for name in names {
            let name = name.as_ref().trim().to_lowercase();
            self.write_managed().insert(name.clone());

            // already serving and not close to expiry: nothing to do
            if let Some(cert) = self.cache.get_by_sni(&name) {
                if cert.is_valid(Utc::now()) && !cert.needs_renewal(Utc::now()) {
                    debug!(domain = %name, "Certificate already cached and fresh");
                    continue;
                }
            }

            let manager = self.clone();
            let job_name = format!("obtain:{name}");
            self.runtime.jobs.submit(job_name, async move {
                let domain = name.clone();
                retry::with_retry(&manager.cancel.clone(), move |attempt| {
                    let manager = manager.clone();
                    let domain = domain.clone();
                    async move {
                        if attempt > 0 {
                            info!(domain = %domain, attempt, "Retrying certificate obtain");
                        }
                        manager.obtain_and_cache(&domain, false).await
                    }
                })
                .await
            });
        }

        Ok(())
    }

    /// Obtain (or load) a certificate for `name` right now, returning once
    /// it is cached and servable. The name is registered as managed.
    pub async fn obtain(self: &Arc<Self>, name: &str) -> Result<()> {
        validate_name(name)?;
        let name = name.trim().to_lowercase();
        self.write_managed().insert(name.clone());
        self.obtain_and_cache(&name, false).await
    }

    /// Stop managing `name` and evict its certificate from the cache.
    /// Stored certificates are left on disk.
    pub fn unmanage(&self, name: &str) {
        let name = name.trim().to_lowercase();
        self.write_managed().remove(&name);
        if let Some(cert) = self.cache.get_by_sni(&name) {
            self.cache.remove_by_hash(&cert.hash);
        }
        info!(domain = %name, "No longer managing name");
    }

    /// Whether `name` is covered by the managed set, directly or through a
    /// managed wildcard
    pub fn is_managed(&self, name: &str) -> bool {
        let name = name.trim().to_lowercase();
        let managed = self.read_managed();
        if managed.contains(&name) {
            return true;
        }
        // a managed wildcard covers its one-label expansions and itself
        if let Some((_, parent)) = name.split_once('.') {
            if managed.contains(&format!("*.{parent}")) {
                return true;
            }
        }
        false
    }

    /// Revoke the stored certificate for `name` and forget it
    pub async fn revoke(self: &Arc<Self>, name: &str) -> Result<()> {
        let name = name.trim().to_lowercase();
        let resource = self.load_cert_resource(&name).await?;

        let client = AcmeClient::new_with_retry(
            self.runtime.clone(),
            self.storage.clone(),
            self.cache.clone(),
            &self.config,
            false,
        )
        .await?;
        client.revoke(&resource).await?;

        if let Some(cert) = self.cache.get_by_sni(&name) {
            self.cache.remove_by_hash(&cert.hash);
        }
        self.delete_cert_resource(&name).await?;

        info!(domain = %name, "Certificate revoked and removed");
        Ok(())
    }

    /// Ask the engine to renew the given cached certificate soon.
    ///
    /// Called by the cache's maintenance sweep; deduplicated per name by
    /// the job manager.
    pub fn schedule_renewal(self: &Arc<Self>, cert: &CachedCert) {
        let name = cert
            .names
            .iter()
            .find(|n| self.is_managed(n))
            .cloned()
            .or_else(|| cert.names.first().cloned());
        let Some(name) = name else { return };

        info!(domain = %name, expires = %cert.not_after, "Scheduling renewal");

        let manager = self.clone();
        let job_name = format!("renew:{name}");
        self.runtime.jobs.submit(job_name, async move {
            let domain = name.clone();
            retry::with_retry(&manager.cancel.clone(), move |attempt| {
                let manager = manager.clone();
                let domain = domain.clone();
                async move {
                    if attempt > 0 {
                        info!(domain = %domain, attempt, "Retrying certificate renewal");
                    }
                    manager.obtain_and_cache(&domain, true).await
                }
            })
            .await
        });
    }

    /// Stop background work. In-flight orders unwind at their next
    /// suspension point.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.cache.stop();
    }

    // =========================================================================
    // Issuance
    // =========================================================================

    async fn obtain_and_cache(&self, name: &str, is_renewal: bool) -> Result<()> {
        // fast path: a fresh certificate is already being served
        if !is_renewal {
            if let Some(cert) = self.cache.get_by_sni(name) {
                if cert.is_valid(Utc::now()) && !cert.needs_renewal(Utc::now()) {
                    return Ok(());
                }
            }
        }

        // cross-process exclusion for this name, held from the decision to
        // act until the order completes or fails for good
        let lock_name = keys::issuance_lock_name(&self.issuer_key, name);
        self.storage.lock(&lock_name).await?;
        let result = self.issue_locked(name, is_renewal).await;
        if let Err(e) = self.storage.unlock(&lock_name).await {
            warn!(domain = %name, error = %e, "Failed to release issuance lock");
        }

        match &result {
            Ok(()) => {}
            Err(e) if e.is_not_exist() => {}
            Err(e) => error!(domain = %name, error = %e, "Certificate issuance failed"),
        }
        result
    }

    async fn issue_locked(&self, name: &str, is_renewal: bool) -> Result<()> {
        // someone else may have finished while we waited on the lock
        if let Ok(resource) = self.load_cert_resource(name).await {
            if let Ok(cert) = self.cache.cache_pem(
                &resource.certificate_pem,
                &resource.private_key_pem,
            ) {
                if cert.is_valid(Utc::now()) && !cert.needs_renewal(Utc::now()) {
                    debug!(domain = %name, "Certificate obtained by another instance");
                    return Ok(());
                }
                self.cache.remove_by_hash(&cert.hash);
            }
        }

        // renewals always run against the main CA
        let mut client = AcmeClient::new_with_retry(
            self.runtime.clone(),
            self.storage.clone(),
            self.cache.clone(),
            &self.config,
            false,
        )
        .await?;

        client.throttle(&self.cancel, &[name]).await?;

        let reuse_key = is_renewal && self.config.reuse_private_keys;
        match self.order_with_rotation(&mut client, name, reuse_key).await {
            Ok(resource) => {
                self.save_cert_resource(&resource).await?;
                self.cache
                    .cache_pem(&resource.certificate_pem, &resource.private_key_pem)?;
                info!(
                    domain = %name,
                    renewal = is_renewal,
                    "Certificate obtained and cached"
                );
                Ok(())
            }
            Err(err) => {
                if matches!(err, Error::Validation(_)) {
                    self.try_test_ca_diagnostic(name).await;
                }
                Err(err)
            }
        }
    }

    /// Try each enabled challenge type, in random order, until one
    /// validates. A validation failure spends the challenge; any other
    /// failure aborts the order.
    async fn order_with_rotation(
        &self,
        client: &mut AcmeClient,
        name: &str,
        reuse_key: bool,
    ) -> Result<CertificateResource> {
        let mut available = client.initial_challenges();
        if available.is_empty() {
            return Err(Error::Config(
                "all challenge types are disabled; enable one or configure a DNS provider"
                    .to_string(),
            ));
        }

        let mut last_err: Option<Error> = None;
        while let Some(kind) = client.next_challenge(&mut available) {
            if self.cancel.is_cancelled() {
                return Err(Error::Canceled);
            }

            match client.obtain(name, reuse_key).await {
                Ok(resource) => return Ok(resource),
                Err(e @ Error::Validation(_)) => {
                    warn!(
                        domain = %name,
                        challenge = %kind,
                        error = %e,
                        remaining = available.len(),
                        "Challenge failed validation; rotating"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Internal("challenge rotation exhausted".to_string())))
    }

    /// One diagnostic order against the test CA after a production
    /// validation failure. The result is never cached or stored: a staging
    /// success only tells the operator the failure is CA policy or
    /// propagation, not their plumbing.
    async fn try_test_ca_diagnostic(&self, name: &str) {
        if self.config.test_ca.as_deref().unwrap_or("").is_empty() {
            return;
        }

        let mut client = match AcmeClient::new_with_retry(
            self.runtime.clone(),
            self.storage.clone(),
            self.cache.clone(),
            &self.config,
            true,
        )
        .await
        {
            Ok(client) => client,
            Err(e) => {
                debug!(domain = %name, error = %e, "Test CA unavailable for diagnostic");
                return;
            }
        };

        let mut available = client.initial_challenges();
        if client.next_challenge(&mut available).is_none() {
            return;
        }

        match client.obtain(name, false).await {
            Ok(_) => warn!(
                domain = %name,
                test_ca = %client.ca_url(),
                "Test CA succeeded where the production CA failed; the production failure is likely CA-side policy or propagation"
            ),
            Err(e) => info!(
                domain = %name,
                test_ca = %client.ca_url(),
                error = %e,
                "Test CA also failed; check DNS records and reachability of the challenge ports"
            ),
        }
    }

    // =========================================================================
    // Stored certificate resources
    // =========================================================================

    /// Persist a certificate resource under this manager's issuer prefix.
    ///
    /// Refuses resources whose leaf public key does not match the private
    /// key; persisting a mismatched pair would poison every later load.
    pub async fn save_cert_resource(&self, resource: &CertificateResource) -> Result<()> {
        let name = resource
            .sans
            .first()
            .ok_or_else(|| Error::Internal("certificate resource has no SANs".to_string()))?;

        let chain = crate::crypto::parse_certificate_pem(&resource.certificate_pem)?;
        if !crate::crypto::key_matches_leaf(&chain, &resource.private_key_pem)? {
            return Err(Error::Internal(format!(
                "private key does not match certificate for {name}"
            )));
        }

        let meta = ResourceMeta {
            sans: resource.sans.clone(),
            issuer_data: resource.issuer_data.clone(),
        };

        self.storage
            .store(
                &keys::site_cert(&self.issuer_key, name),
                resource.certificate_pem.as_bytes().to_vec(),
            )
            .await?;
        self.storage
            .store(
                &keys::site_private_key(&self.issuer_key, name),
                resource.private_key_pem.as_bytes().to_vec(),
            )
            .await?;
        self.storage
            .store(
                &keys::site_meta(&self.issuer_key, name),
                serde_json::to_vec(&meta)?,
            )
            .await?;

        debug!(domain = %name, "Stored certificate resource");
        Ok(())
    }

    /// Load the certificate resource stored for `name`
    pub async fn load_cert_resource(&self, name: &str) -> Result<CertificateResource> {
        let cert_pem = self
            .storage
            .load(&keys::site_cert(&self.issuer_key, name))
            .await?;
        let key_pem = self
            .storage
            .load(&keys::site_private_key(&self.issuer_key, name))
            .await?;
        let meta_blob = self
            .storage
            .load(&keys::site_meta(&self.issuer_key, name))
            .await?;

        let meta: ResourceMeta = serde_json::from_slice(&meta_blob)
            .map_err(|e| Error::Internal(format!("corrupted certificate metadata: {e}")))?;

        Ok(CertificateResource {
            sans: meta.sans,
            certificate_pem: String::from_utf8(cert_pem)
                .map_err(|e| Error::Internal(format!("stored certificate is not UTF-8: {e}")))?,
            private_key_pem: String::from_utf8(key_pem)
                .map_err(|e| Error::Internal(format!("stored key is not UTF-8: {e}")))?,
            issuer_data: meta.issuer_data,
        })
    }

    async fn delete_cert_resource(&self, name: &str) -> Result<()> {
        for key in [
            keys::site_cert(&self.issuer_key, name),
            keys::site_private_key(&self.issuer_key, name),
            keys::site_meta(&self.issuer_key, name),
        ] {
            match self.storage.delete(&key).await {
                Ok(()) => {}
                Err(e) if e.is_not_exist() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn read_managed(&self) -> std::sync::RwLockReadGuard<'_, HashSet<String>> {
        self.managed.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_managed(&self) -> std::sync::RwLockWriteGuard<'_, HashSet<String>> {
        self.managed.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for AcmeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeManager")
            .field("ca", &self.config.ca)
            .field("issuer_key", &self.issuer_key)
            .field("managed", &self.read_managed().len())
            .finish()
    }
}

impl Drop for AcmeManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Check that a name is plausible to manage: a DNS name or a single-level
/// wildcard, with no whitespace or empty labels
fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Config("cannot manage an empty name".to_string()));
    }
    if trimmed.chars().any(|c| c.is_whitespace()) {
        return Err(Error::Config(format!(
            "name contains whitespace: {trimmed:?}"
        )));
    }
    let base = trimmed.strip_prefix("*.").unwrap_or(trimmed);
    if base.contains('*') {
        return Err(Error::Config(format!(
            "only a single leading wildcard label is supported: {trimmed}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::storage::MemoryStorage;

    fn test_manager() -> Arc<AcmeManager> {
        let config = AcmeConfig {
            ca: "https://example.com/acme/directory".to_string(),
            ..AcmeConfig::default()
        };
        AcmeManager::new(
            config,
            Arc::new(MemoryStorage::new()),
            Cache::new(CacheOptions::default()),
            Runtime::new(),
        )
    }

    fn test_resource(domain: &str) -> CertificateResource {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        CertificateResource {
            sans: vec![domain.to_string()],
            certificate_pem: cert.pem(),
            private_key_pem: key_pair.serialize_pem(),
            issuer_data: serde_json::json!({
                "domain": domain,
                "cert_url": "https://example.com/cert",
                "cert_stable_url": "https://example.com/cert/stable",
            }),
        }
    }

    #[tokio::test]
    async fn test_resource_round_trip() {
        let manager = test_manager();
        let resource = test_resource("example.com");

        manager.save_cert_resource(&resource).await.unwrap();
        let loaded = manager.load_cert_resource("example.com").await.unwrap();
        assert_eq!(loaded, resource);
    }

    #[tokio::test]
    async fn test_load_missing_resource_is_not_exist() {
        let manager = test_manager();
        let err = manager.load_cert_resource("absent.com").await.unwrap_err();
        assert!(err.is_not_exist());
    }

    #[tokio::test]
    async fn test_hostile_name_is_confined() {
        let manager = test_manager();
        let resource = CertificateResource {
            sans: vec!["a/../../../foo".to_string()],
            ..test_resource("placeholder.example")
        };

        manager.save_cert_resource(&resource).await.unwrap();

        let stored = manager
            .storage
            .list(keys::CERTIFICATES_PREFIX, true)
            .await
            .unwrap();
        let base = "certificates/example.com-acme-directory/afoo";
        assert_eq!(
            stored,
            vec![
                format!("{base}/afoo.crt"),
                format!("{base}/afoo.json"),
                format!("{base}/afoo.key"),
            ]
        );
    }

    #[tokio::test]
    async fn test_is_managed_with_wildcards() {
        let manager = test_manager();
        manager.write_managed().insert("example.com".into());
        manager.write_managed().insert("*.example.org".into());

        assert!(manager.is_managed("example.com"));
        assert!(manager.is_managed("Example.COM"));
        assert!(!manager.is_managed("sub.example.com"));

        assert!(manager.is_managed("*.example.org"));
        assert!(manager.is_managed("api.example.org"));
        assert!(!manager.is_managed("example.org"));
    }

    #[tokio::test]
    async fn test_unmanage_evicts() {
        let manager = test_manager();
        let resource = test_resource("example.com");
        manager
            .cache
            .cache_pem(&resource.certificate_pem, &resource.private_key_pem)
            .unwrap();
        manager.write_managed().insert("example.com".into());

        manager.unmanage("example.com");
        assert!(!manager.is_managed("example.com"));
        assert!(manager.cache.get_by_sni("example.com").is_none());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("example.com").is_ok());
        assert!(validate_name("*.example.com").is_ok());
        assert!(validate_name("xn--bcher-kva.example").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("   ").is_err());
        assert!(validate_name("exa mple.com").is_err());
        assert!(validate_name("*.*.example.com").is_err());
        assert!(validate_name("foo.*.com").is_err());
    }

    #[tokio::test]
    async fn test_manage_rejects_bad_names() {
        let manager = test_manager();
        assert!(manager.manage(&["good.example", ""]).is_err());
        // nothing was registered from the failed batch
        assert!(!manager.is_managed("good.example"));
    }

    #[tokio::test]
    async fn test_tls_config_advertises_acme_alpn() {
        let manager = test_manager();
        let config = manager.tls_config();
        assert!(config
            .alpn_protocols
            .contains(&ACME_TLS_ALPN_PROTOCOL.to_vec()));
    }
}
