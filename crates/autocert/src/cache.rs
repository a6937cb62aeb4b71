//! In-memory certificate cache
//!
//! Certificates are stored by SHA-256 of their DER chain with a secondary
//! SNI index for O(1) handshake lookups. A background maintenance task
//! wakes on two tickers: one scans for certificates entering their renewal
//! window, one checks OCSP staple freshness.
//!
//! The cache never reaches back into the manager directly; the manager
//! registers a config-getter capability at construction time, and the
//! maintenance task goes through it to schedule renewals.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::{DEFAULT_OCSP_CHECK_INTERVAL, DEFAULT_RENEW_CHECK_INTERVAL};
use crate::crypto;
use crate::error::Result;
use crate::manager::AcmeManager;

/// Renewal begins at most this many days before expiry
const MAX_RENEWAL_WINDOW_DAYS: i64 = 30;

/// Suffix for SNI aliases that route to TLS-ALPN challenge certificates
pub const TLS_ALPN_CERT_SUFFIX: &str = ":acme-tls-alpn";

/// Capability handed to the cache so maintenance can find the manager
/// responsible for renewing a given certificate
pub type ConfigGetter = Box<dyn Fn(&CachedCert) -> Option<Arc<AcmeManager>> + Send + Sync>;

/// A parsed certificate held in memory for serving
#[derive(Clone)]
pub struct CachedCert {
    /// SHA-256 hex of the DER chain; primary cache key
    pub hash: String,
    /// Subject alternative names, lowercased
    pub names: Vec<String>,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// Chain plus signing key, ready for rustls
    pub certified: Arc<CertifiedKey>,
    /// Next OCSP staple update, when one is attached
    pub ocsp_next_update: Option<DateTime<Utc>>,
    /// True for short-lived TLS-ALPN challenge certificates
    pub is_challenge_cert: bool,
}

impl CachedCert {
    /// Whether the certificate has entered its renewal window.
    ///
    /// The window is one third of the certificate's total validity, capped
    /// at 30 days before expiry, whichever comes sooner.
    pub fn needs_renewal(&self, now: DateTime<Utc>) -> bool {
        let validity = self.not_after - self.not_before;
        let window = (validity / 3).min(TimeDelta::days(MAX_RENEWAL_WINDOW_DAYS));
        self.not_after - now < window
    }

    /// Whether the certificate is currently within its validity period
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && now < self.not_after
    }
}

impl std::fmt::Debug for CachedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCert")
            .field("hash", &self.hash)
            .field("names", &self.names)
            .field("not_after", &self.not_after)
            .field("is_challenge_cert", &self.is_challenge_cert)
            .finish()
    }
}

/// Options for [`Cache::new`]
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Interval between renewal sweeps
    pub renew_check_interval: Duration,
    /// Interval between OCSP staple sweeps
    pub ocsp_check_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            renew_check_interval: DEFAULT_RENEW_CHECK_INTERVAL,
            ocsp_check_interval: DEFAULT_OCSP_CHECK_INTERVAL,
        }
    }
}

#[derive(Default)]
struct CacheInner {
    by_hash: HashMap<String, Arc<CachedCert>>,
    by_name: HashMap<String, String>,
}

/// SNI-indexed certificate store with background maintenance
pub struct Cache {
    options: CacheOptions,
    inner: RwLock<CacheInner>,
    config_getter: RwLock<Option<ConfigGetter>>,
    shutdown: CancellationToken,
}

impl Cache {
    /// Create a cache and start its maintenance task
    pub fn new(options: CacheOptions) -> Arc<Self> {
        let cache = Arc::new(Self {
            options,
            inner: RwLock::new(CacheInner::default()),
            config_getter: RwLock::new(None),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::maintain(Arc::downgrade(&cache)));
        cache
    }

    /// Register the capability used to resolve a certificate back to the
    /// manager that should renew it. Called by the manager at construction.
    pub fn set_config_getter(&self, getter: ConfigGetter) {
        if let Ok(mut slot) = self.config_getter.write() {
            *slot = Some(getter);
        }
    }

    /// Stop the maintenance task
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Parse a PEM certificate/key pair and insert it
    pub fn cache_pem(&self, cert_pem: &str, key_pem: &str) -> Result<Arc<CachedCert>> {
        let chain = crypto::parse_certificate_pem(cert_pem)?;
        let key = crypto::parse_private_key_pem(key_pem)?;
        let certified = crypto::certified_key(chain.clone(), key)?;
        self.cache_parsed(&chain, certified, false)
    }

    /// Insert an already parsed chain.
    ///
    /// Each SAN is pointed at the new entry; a SAN that previously mapped
    /// to a different certificate is remapped (newer wins) and the old
    /// entry is evicted once no name references it.
    pub fn cache_parsed(
        &self,
        chain: &[CertificateDer<'static>],
        certified: Arc<CertifiedKey>,
        is_challenge_cert: bool,
    ) -> Result<Arc<CachedCert>> {
        let hash = crypto::hash_certificate_chain(chain);
        let names = crypto::leaf_sans(chain)?;
        let (not_before, not_after) = crypto::leaf_validity(chain)?;

        let cert = Arc::new(CachedCert {
            hash: hash.clone(),
            names: names.clone(),
            not_before,
            not_after,
            certified,
            ocsp_next_update: None,
            is_challenge_cert,
        });

        let mut inner = self.write_lock();
        inner.by_hash.insert(hash.clone(), cert.clone());
        for name in &names {
            Self::index_name(&mut inner, name, &hash);
        }

        debug!(hash = %hash, names = ?names, "Cached certificate");
        Ok(cert)
    }

    /// Insert a TLS-ALPN challenge certificate under its alias name
    pub fn cache_challenge_cert(
        &self,
        domain: &str,
        chain: &[CertificateDer<'static>],
        certified: Arc<CertifiedKey>,
    ) -> Result<()> {
        let hash = crypto::hash_certificate_chain(chain);
        let (not_before, not_after) = crypto::leaf_validity(chain)?;
        let domain = domain.to_lowercase();

        let cert = Arc::new(CachedCert {
            hash: hash.clone(),
            names: vec![domain.clone()],
            not_before,
            not_after,
            certified,
            ocsp_next_update: None,
            is_challenge_cert: true,
        });

        let alias = format!("{domain}{TLS_ALPN_CERT_SUFFIX}");
        let mut inner = self.write_lock();
        inner.by_hash.insert(hash.clone(), cert);
        Self::index_name(&mut inner, &alias, &hash);

        debug!(domain = %domain, "Cached TLS-ALPN challenge certificate");
        Ok(())
    }

    /// Remove the TLS-ALPN challenge certificate for a domain
    pub fn remove_challenge_cert(&self, domain: &str) {
        let alias = format!("{}{TLS_ALPN_CERT_SUFFIX}", domain.to_lowercase());
        let hash = {
            let inner = self.read_lock();
            inner.by_name.get(&alias).cloned()
        };
        if let Some(hash) = hash {
            self.remove_by_hash(&hash);
        }
    }

    /// Look up the TLS-ALPN challenge certificate for a domain
    pub fn get_challenge_cert(&self, domain: &str) -> Option<Arc<CachedCert>> {
        let alias = format!("{}{TLS_ALPN_CERT_SUFFIX}", domain.to_lowercase());
        let inner = self.read_lock();
        let hash = inner.by_name.get(&alias)?;
        inner.by_hash.get(hash).cloned()
    }

    /// Look up a certificate for an SNI value.
    ///
    /// Tries an exact match first, then a single-level wildcard
    /// (`*.example.com` matches `foo.example.com` but not `example.com`).
    pub fn get_by_sni(&self, sni: &str) -> Option<Arc<CachedCert>> {
        let sni = sni.trim().to_lowercase();
        let inner = self.read_lock();

        if let Some(hash) = inner.by_name.get(&sni) {
            trace!(sni = %sni, "Exact certificate match");
            return inner.by_hash.get(hash).cloned();
        }

        if let Some(wildcard) = wildcard_for(&sni) {
            if let Some(hash) = inner.by_name.get(&wildcard) {
                trace!(sni = %sni, wildcard = %wildcard, "Wildcard certificate match");
                return inner.by_hash.get(hash).cloned();
            }
        }

        None
    }

    /// Remove a certificate and every SNI entry pointing at it
    pub fn remove_by_hash(&self, hash: &str) {
        let mut inner = self.write_lock();
        if inner.by_hash.remove(hash).is_some() {
            inner.by_name.retain(|_, h| h != hash);
            debug!(hash = %hash, "Evicted certificate");
        }
    }

    /// Number of cached certificates
    pub fn len(&self) -> usize {
        self.read_lock().by_hash.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every cached certificate
    pub fn all(&self) -> Vec<Arc<CachedCert>> {
        self.read_lock().by_hash.values().cloned().collect()
    }

    fn index_name(inner: &mut CacheInner, name: &str, hash: &str) {
        let previous = inner.by_name.insert(name.to_string(), hash.to_string());
        if let Some(old_hash) = previous {
            if old_hash != hash && !inner.by_name.values().any(|h| *h == old_hash) {
                // the older certificate is no longer reachable by any name
                inner.by_hash.remove(&old_hash);
                debug!(hash = %old_hash, "Evicted superseded certificate");
            }
        }
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn maintain(cache: Weak<Cache>) {
        let (renew_interval, ocsp_interval, shutdown) = match cache.upgrade() {
            Some(cache) => (
                cache.options.renew_check_interval,
                cache.options.ocsp_check_interval,
                cache.shutdown.clone(),
            ),
            None => return,
        };

        let mut renew_tick = tokio::time::interval(renew_interval);
        let mut ocsp_tick = tokio::time::interval(ocsp_interval);
        // the immediate first tick of both timers is consumed here so the
        // first real sweep happens one full interval after startup
        renew_tick.tick().await;
        ocsp_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Certificate maintenance stopped");
                    return;
                }
                _ = renew_tick.tick() => {
                    let Some(cache) = cache.upgrade() else { return };
                    cache.renewal_sweep();
                }
                _ = ocsp_tick.tick() => {
                    let Some(cache) = cache.upgrade() else { return };
                    cache.ocsp_sweep();
                }
            }
        }
    }

    fn renewal_sweep(&self) {
        let now = Utc::now();
        let due: Vec<Arc<CachedCert>> = self
            .all()
            .into_iter()
            .filter(|c| !c.is_challenge_cert && c.needs_renewal(now))
            .collect();

        if due.is_empty() {
            trace!("Renewal sweep: nothing due");
            return;
        }
        info!(count = due.len(), "Certificates due for renewal");

        let getter = self.config_getter.read().unwrap_or_else(|e| e.into_inner());
        let Some(getter) = getter.as_ref() else {
            error!("Certificates need renewal but no manager is registered");
            return;
        };

        for cert in due {
            match getter(&cert) {
                Some(manager) => manager.schedule_renewal(&cert),
                None => error!(
                    names = ?cert.names,
                    "No manager claims this certificate; cannot renew"
                ),
            }
        }
    }

    fn ocsp_sweep(&self) {
        // staple refresh itself is handled outside this crate; the sweep
        // only reports staleness so operators can see it
        let now = Utc::now();
        for cert in self.all() {
            if let Some(next_update) = cert.ocsp_next_update {
                if next_update <= now {
                    debug!(names = ?cert.names, "OCSP staple is due for refresh");
                }
            }
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("len", &self.len()).finish()
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The single-level wildcard name covering `domain`, if one exists
fn wildcard_for(domain: &str) -> Option<String> {
    let (_, parent) = domain.split_once('.')?;
    if parent.contains('.') {
        Some(format!("*.{parent}"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cert(names: &[&str]) -> (Vec<CertificateDer<'static>>, Arc<CertifiedKey>) {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params =
            rcgen::CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let chain = crypto::parse_certificate_pem(&cert.pem()).unwrap();
        let certified =
            crypto::certified_key_from_pem(&cert.pem(), &key_pair.serialize_pem()).unwrap();
        (chain, certified)
    }

    #[tokio::test]
    async fn test_cache_and_lookup() {
        let cache = Cache::new(CacheOptions::default());
        let (chain, certified) = test_cert(&["example.com", "www.example.com"]);

        let cert = cache.cache_parsed(&chain, certified, false).unwrap();
        assert_eq!(cache.len(), 1);

        let hit = cache.get_by_sni("example.com").unwrap();
        assert_eq!(hit.hash, cert.hash);
        let hit = cache.get_by_sni("WWW.Example.COM").unwrap();
        assert_eq!(hit.hash, cert.hash);

        assert!(cache.get_by_sni("other.com").is_none());
    }

    #[tokio::test]
    async fn test_wildcard_matching() {
        let cache = Cache::new(CacheOptions::default());
        let (chain, certified) = test_cert(&["*.example.com"]);
        cache.cache_parsed(&chain, certified, false).unwrap();

        assert!(cache.get_by_sni("foo.example.com").is_some());
        // a wildcard covers exactly one label
        assert!(cache.get_by_sni("example.com").is_none());
        assert!(cache.get_by_sni("a.b.example.com").is_none());
    }

    #[tokio::test]
    async fn test_newer_cert_wins_and_orphan_evicted() {
        let cache = Cache::new(CacheOptions::default());

        let (chain1, certified1) = test_cert(&["example.com"]);
        let old = cache.cache_parsed(&chain1, certified1, false).unwrap();

        let (chain2, certified2) = test_cert(&["example.com"]);
        let new = cache.cache_parsed(&chain2, certified2, false).unwrap();

        assert_ne!(old.hash, new.hash);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_by_sni("example.com").unwrap().hash, new.hash);
    }

    #[tokio::test]
    async fn test_remove_by_hash_cascades() {
        let cache = Cache::new(CacheOptions::default());
        let (chain, certified) = test_cert(&["example.com", "www.example.com"]);
        let cert = cache.cache_parsed(&chain, certified, false).unwrap();

        cache.remove_by_hash(&cert.hash);
        assert!(cache.is_empty());
        assert!(cache.get_by_sni("example.com").is_none());
        assert!(cache.get_by_sni("www.example.com").is_none());
    }

    #[tokio::test]
    async fn test_secondary_index_is_surjective() {
        let cache = Cache::new(CacheOptions::default());
        for names in [&["a.com", "b.com"][..], &["b.com", "c.com"][..]] {
            let (chain, certified) = test_cert(names);
            cache.cache_parsed(&chain, certified, false).unwrap();
        }

        let inner = cache.read_lock();
        for hash in inner.by_name.values() {
            assert!(inner.by_hash.contains_key(hash));
        }
    }

    #[tokio::test]
    async fn test_challenge_cert_alias() {
        let cache = Cache::new(CacheOptions::default());
        let (chain, certified) = test_cert(&["example.com"]);
        cache
            .cache_challenge_cert("Example.com", &chain, certified)
            .unwrap();

        assert!(cache.get_challenge_cert("example.com").is_some());
        // the alias must not shadow ordinary SNI lookups
        assert!(cache.get_by_sni("example.com").is_none());

        cache.remove_challenge_cert("example.com");
        assert!(cache.get_challenge_cert("example.com").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_needs_renewal_window() {
        let now = Utc::now();
        let mk = |issued_days_ago: i64, expires_in_days: i64| CachedCert {
            hash: "h".into(),
            names: vec!["example.com".into()],
            not_before: now - TimeDelta::days(issued_days_ago),
            not_after: now + TimeDelta::days(expires_in_days),
            certified: test_cert(&["example.com"]).1,
            ocsp_next_update: None,
            is_challenge_cert: false,
        };

        // 90-day cert: window is 30 days
        assert!(!mk(30, 60).needs_renewal(now));
        assert!(mk(61, 29).needs_renewal(now));

        // 9-day cert: window is 3 days, not 30
        assert!(!mk(2, 7).needs_renewal(now));
        assert!(mk(7, 2).needs_renewal(now));
    }

    #[test]
    fn test_wildcard_for() {
        assert_eq!(
            wildcard_for("foo.example.com"),
            Some("*.example.com".to_string())
        );
        assert_eq!(wildcard_for("example.com"), None);
        assert_eq!(wildcard_for("localhost"), None);
    }
}
