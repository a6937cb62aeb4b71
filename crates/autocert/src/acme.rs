//! ACME client adapter
//!
//! Speaks RFC 8555 to the CA through `instant-acme`, but drives challenge
//! selection itself: a single failing challenge type must not doom the
//! order, and trying one type at a time keeps the CA's response
//! attributable. [`AcmeClient::next_challenge`] picks one enabled challenge
//! uniformly at random and stages the matching solver; the lifecycle engine
//! rotates through the rest on validation failures.
//!
//! Account handles are cached per `(ca_url, email)` in the runtime so the
//! directory is fetched once and registration happens exactly once.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, ExternalAccountKey,
    Identifier, NewAccount, NewOrder, OrderStatus, RevocationRequest,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{self, User};
use crate::cache::Cache;
use crate::config::{AcmeConfig, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
use crate::crypto;
use crate::error::{Error, Result};
use crate::manager::CertificateResource;
use crate::runtime::Runtime;
use crate::solver::{
    DistributedSolver, DnsSolver, HttpSolver, Solver, TlsAlpnSolver,
};
use crate::storage::{keys, Storage};

/// How long the order poll sleeps between refreshes
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How long the certificate poll sleeps between download attempts
const CERT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A challenge type this crate can solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// HTTP-01: serve the key authorization over plain HTTP
    Http01,
    /// TLS-ALPN-01: answer a TLS handshake with a special certificate
    TlsAlpn01,
    /// DNS-01: publish a TXT record
    Dns01,
}

impl ChallengeKind {
    fn wire_type(self) -> ChallengeType {
        match self {
            ChallengeKind::Http01 => ChallengeType::Http01,
            ChallengeKind::TlsAlpn01 => ChallengeType::TlsAlpn01,
            ChallengeKind::Dns01 => ChallengeType::Dns01,
        }
    }
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::TlsAlpn01 => "tls-alpn-01",
            ChallengeKind::Dns01 => "dns-01",
        };
        f.write_str(name)
    }
}

/// One CA/account session: an account handle plus the solver currently
/// staged for the next order
pub struct AcmeClient {
    ca_url: String,
    issuer_key: String,
    email: String,
    account: Arc<Account>,
    config: AcmeConfig,
    runtime: Arc<Runtime>,
    storage: Arc<dyn Storage>,
    cache: Arc<Cache>,
    rng: StdRng,
    current: Option<(ChallengeKind, Arc<dyn Solver>)>,
}

impl AcmeClient {
    /// Construct a client, registering the account if needed.
    ///
    /// Transient failures are retried once after two seconds; an HTTP 429
    /// from the CA aborts immediately.
    pub async fn new_with_retry(
        runtime: Arc<Runtime>,
        storage: Arc<dyn Storage>,
        cache: Arc<Cache>,
        config: &AcmeConfig,
        use_test_ca: bool,
    ) -> Result<Self> {
        const MAX_TRIES: u32 = 2;
        let mut last_err = None;
        for attempt in 0..MAX_TRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            match Self::new(
                runtime.clone(),
                storage.clone(),
                cache.clone(),
                config,
                use_test_ca,
            )
            .await
            {
                Ok(client) => return Ok(client),
                Err(e) if e.is_no_retry() => return Err(e),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "Making new ACME client failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("client construction failed".to_string())))
    }

    async fn new(
        runtime: Arc<Runtime>,
        storage: Arc<dyn Storage>,
        cache: Arc<Cache>,
        config: &AcmeConfig,
        use_test_ca: bool,
    ) -> Result<Self> {
        let ca_url = resolve_ca_url(config, use_test_ca)?;
        let issuer_key = keys::issuer_key(&ca_url);

        let user = account::get_user(&storage, &issuer_key, &config.email).await?;
        let email = user.email().to_string();

        // one handle per (CA, account); the mutex also serializes
        // registration so it happens exactly once
        let account = {
            let client_key = format!("{}{}", ca_url, email.to_lowercase());
            let mut accounts = runtime.accounts.lock().await;
            match accounts.get(&client_key) {
                Some(account) => account.clone(),
                None => {
                    let account =
                        Arc::new(load_or_register(&storage, &issuer_key, &ca_url, config, user).await?);
                    accounts.insert(client_key, account.clone());
                    account
                }
            }
        };

        Ok(Self {
            ca_url,
            issuer_key,
            email,
            account,
            config: config.clone(),
            runtime,
            storage,
            cache,
            rng: match config.challenge_rng_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
            current: None,
        })
    }

    /// The CA directory URL this client talks to
    pub fn ca_url(&self) -> &str {
        &self.ca_url
    }

    /// Whether this client is pointed at the configured test CA
    pub fn using_test_ca(&self) -> bool {
        match &self.config.test_ca {
            Some(test_ca) => !test_ca.is_empty() && self.ca_url == *test_ca,
            None => false,
        }
    }

    /// The initial set of challenges to rotate through.
    ///
    /// A configured DNS provider makes DNS-01 exclusive; otherwise the
    /// enabled subset of HTTP-01 and TLS-ALPN-01.
    pub fn initial_challenges(&self) -> Vec<ChallengeKind> {
        initial_challenges_for(&self.config)
    }

    /// Pop one challenge uniformly at random from `available` and stage its
    /// solver for the next order. Returns `None` when `available` is empty.
    pub fn next_challenge(&mut self, available: &mut Vec<ChallengeKind>) -> Option<ChallengeKind> {
        let Some(kind) = pick_challenge(&mut self.rng, available) else {
            self.current = None;
            return None;
        };

        let solver: Arc<dyn Solver> = match kind {
            ChallengeKind::Http01 => Arc::new(DistributedSolver::new(
                self.storage.clone(),
                self.issuer_key.clone(),
                Arc::new(HttpSolver::new(
                    self.runtime.solvers.clone(),
                    self.storage.clone(),
                    self.issuer_key.clone(),
                    self.config.http_challenge_addr(),
                )),
            )),
            ChallengeKind::TlsAlpn01 => Arc::new(DistributedSolver::new(
                self.storage.clone(),
                self.issuer_key.clone(),
                Arc::new(TlsAlpnSolver::new(
                    self.runtime.solvers.clone(),
                    self.storage.clone(),
                    self.cache.clone(),
                    self.issuer_key.clone(),
                    self.config.tls_alpn_challenge_addr(),
                )),
            )),
            ChallengeKind::Dns01 => {
                // initial_challenges only offers DNS-01 when a provider is
                // configured
                let provider = self.config.dns_provider.clone()?;
                Arc::new(DnsSolver::new(provider))
            }
        };

        debug!(challenge = %kind, "Selected challenge type");
        self.current = Some((kind, solver));
        Some(kind)
    }

    /// Wait on the rate-limiter bucket for this `(CA, account)`
    pub async fn throttle(&self, cancel: &CancellationToken, names: &[&str]) -> Result<()> {
        let key = format!("{},{}", self.ca_url, self.email);
        let limiter = self.runtime.rate_limiter(&key);
        info!(names = ?names, "Waiting on rate limiter");
        limiter.wait(cancel).await?;
        info!(names = ?names, "Done waiting on rate limiter");
        Ok(())
    }

    /// Run one complete order for `name` using the staged challenge.
    ///
    /// `reuse_key` re-signs the CSR with the stored private key instead of
    /// generating a fresh one. The whole order is bounded by the configured
    /// obtain timeout.
    pub async fn obtain(&self, name: &str, reuse_key: bool) -> Result<CertificateResource> {
        let (kind, solver) = self
            .current
            .as_ref()
            .ok_or_else(|| Error::Internal("no challenge staged for order".to_string()))?;

        match tokio::time::timeout(
            self.config.cert_obtain_timeout,
            self.run_order(name, reuse_key, *kind, solver.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Transient(format!(
                "order for {name} did not complete within {:?}",
                self.config.cert_obtain_timeout
            ))),
        }
    }

    async fn run_order(
        &self,
        name: &str,
        reuse_key: bool,
        kind: ChallengeKind,
        solver: Arc<dyn Solver>,
    ) -> Result<CertificateResource> {
        let identifiers = [Identifier::Dns(name.to_string())];
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(classify_acme_error)?;

        debug!(domain = %name, challenge = %kind, "Created ACME order");

        // challenges presented so far, so every path cleans them up
        let mut presented: Vec<(String, String, String)> = Vec::new();
        let result = self
            .drive_order(&mut order, name, reuse_key, kind, &solver, &mut presented)
            .await;

        for (domain, token, key_auth) in presented.iter().rev() {
            if let Err(e) = solver.clean_up(domain, token, key_auth).await {
                warn!(domain = %domain, error = %e, "Challenge cleanup failed");
            }
        }

        result
    }

    async fn drive_order(
        &self,
        order: &mut instant_acme::Order,
        name: &str,
        reuse_key: bool,
        kind: ChallengeKind,
        solver: &Arc<dyn Solver>,
        presented: &mut Vec<(String, String, String)>,
    ) -> Result<CertificateResource> {
        let authorizations = order.authorizations().await.map_err(classify_acme_error)?;

        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let Identifier::Dns(domain) = &authz.identifier;

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == kind.wire_type())
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "CA offered no {kind} challenge for {domain}; offered {:?}",
                        authz.challenges.iter().map(|c| &c.r#type).collect::<Vec<_>>()
                    ))
                })?;

            let key_auth = order.key_authorization(challenge);
            // recorded before presenting so a failed present still unwinds
            // (listener refcounts and storage records) through clean_up
            presented.push((
                domain.clone(),
                challenge.token.clone(),
                key_auth.as_str().to_string(),
            ));
            solver
                .present(domain, &challenge.token, key_auth.as_str())
                .await?;

            debug!(domain = %domain, challenge = %kind, "Presented challenge; notifying CA");
            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(classify_acme_error)?;
        }

        // wait for the CA to validate; the caller's timeout bounds this
        loop {
            order.refresh().await.map_err(classify_acme_error)?;
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    let detail = order
                        .state()
                        .error
                        .as_ref()
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "order became invalid".to_string());
                    return Err(Error::Validation(detail));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(ORDER_POLL_INTERVAL).await;
                }
            }
        }

        let key_pair = if reuse_key {
            match self.load_stored_key(name).await {
                Ok(key) => key,
                Err(e) if e.is_not_exist() => crypto::generate_private_key()?,
                Err(e) => return Err(e),
            }
        } else {
            crypto::generate_private_key()?
        };

        let params = rcgen::CertificateParams::new(vec![name.to_string()])
            .map_err(|e| Error::Internal(format!("CSR params: {e}")))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::Internal(format!("CSR signing: {e}")))?;

        if order.state().status != OrderStatus::Valid {
            order.finalize(csr.der()).await.map_err(classify_acme_error)?;
        }

        let cert_pem = loop {
            match order.certificate().await.map_err(classify_acme_error)? {
                Some(cert) => break cert,
                None => tokio::time::sleep(CERT_POLL_INTERVAL).await,
            }
        };

        let chain = crypto::parse_certificate_pem(&cert_pem)?;
        let sans = crypto::leaf_sans(&chain)?;
        if sans.is_empty() {
            return Err(Error::Internal(format!(
                "issued certificate for {name} carries no DNS names"
            )));
        }

        info!(domain = %name, challenge = %kind, "Certificate issued");

        Ok(CertificateResource {
            sans,
            certificate_pem: cert_pem,
            private_key_pem: crypto::encode_private_key(&key_pair),
            issuer_data: serde_json::json!({
                "ca": self.ca_url,
                "domain": name,
            }),
        })
    }

    async fn load_stored_key(&self, name: &str) -> Result<rcgen::KeyPair> {
        let key = keys::site_private_key(&self.issuer_key, name);
        let pem = self.storage.load(&key).await?;
        let pem = String::from_utf8(pem)
            .map_err(|e| Error::Internal(format!("stored key for {name} is not UTF-8: {e}")))?;
        crypto::decode_private_key(&pem)
    }

    /// Revoke a previously issued certificate
    pub async fn revoke(&self, cert: &CertificateResource) -> Result<()> {
        let chain = crypto::parse_certificate_pem(&cert.certificate_pem)?;
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Internal("empty certificate chain".to_string()))?;

        self.account
            .revoke(&RevocationRequest {
                certificate: leaf,
                reason: None,
            })
            .await
            .map_err(classify_acme_error)?;

        info!(sans = ?cert.sans, "Certificate revoked");
        Ok(())
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("ca_url", &self.ca_url)
            .field("email", &self.email)
            .field("current", &self.current.as_ref().map(|(kind, _)| *kind))
            .finish_non_exhaustive()
    }
}

/// The initial challenge set for a configuration: DNS-01 exclusively when
/// a provider is configured, else the enabled subset of the listener-based
/// challenges
pub(crate) fn initial_challenges_for(config: &AcmeConfig) -> Vec<ChallengeKind> {
    if config.dns_provider.is_some() {
        return vec![ChallengeKind::Dns01];
    }

    let mut kinds = Vec::new();
    if !config.disable_http_challenge {
        kinds.push(ChallengeKind::Http01);
    }
    if !config.disable_tls_alpn_challenge {
        kinds.push(ChallengeKind::TlsAlpn01);
    }
    kinds
}

/// Remove and return one uniformly random element of `available`
pub(crate) fn pick_challenge(
    rng: &mut StdRng,
    available: &mut Vec<ChallengeKind>,
) -> Option<ChallengeKind> {
    if available.is_empty() {
        return None;
    }
    let index = rng.gen_range(0..available.len());
    Some(available.remove(index))
}

/// Pick the CA directory URL for this attempt and vet its scheme.
///
/// HTTPS is required except for loopback and private-range hosts, which
/// covers local test CAs like pebble.
fn resolve_ca_url(config: &AcmeConfig, use_test_ca: bool) -> Result<String> {
    let mut ca_url = String::new();
    if use_test_ca {
        ca_url = config.test_ca.clone().unwrap_or_default();
        // only fall back to the default staging endpoint when the primary
        // is also the default; testing against staging proves nothing for
        // a custom CA
        if ca_url.is_empty() && config.ca == LETS_ENCRYPT_PRODUCTION {
            ca_url = LETS_ENCRYPT_STAGING.to_string();
        }
    }
    if ca_url.is_empty() {
        ca_url = config.ca.clone();
    }
    if ca_url.is_empty() {
        ca_url = LETS_ENCRYPT_PRODUCTION.to_string();
    }

    if !ca_url.contains("://") {
        ca_url = format!("https://{ca_url}");
    }

    let (scheme, rest) = ca_url
        .split_once("://")
        .ok_or_else(|| Error::Config(format!("{ca_url}: unparsable CA URL")))?;
    let host = rest.split(['/', '?']).next().unwrap_or_default();

    if scheme != "https" && !is_loopback(host) && !is_internal(host) {
        return Err(Error::Config(format!(
            "{ca_url}: insecure CA URL (HTTPS required)"
        )));
    }

    Ok(ca_url)
}

async fn load_or_register(
    storage: &Arc<dyn Storage>,
    issuer_key: &str,
    ca_url: &str,
    config: &AcmeConfig,
    mut user: User,
) -> Result<Account> {
    if let Some(credentials) = &user.credentials {
        debug!(email = %user.email(), "Restoring ACME account from saved credentials");
        let credentials: AccountCredentials = serde_json::from_slice(credentials)
            .map_err(|e| Error::Internal(format!("corrupted account credentials: {e}")))?;
        return account_from_credentials(credentials, config).await;
    }

    // registration requires agreeing to the CA's terms; without a user
    // present to ask, refusing is the only safe answer
    if !config.agreed {
        return Err(Error::Config(
            "user must agree to CA terms before an account can be registered".to_string(),
        ));
    }

    let contact = if user.email().is_empty() {
        Vec::new()
    } else {
        vec![format!("mailto:{}", user.email())]
    };
    let contact_refs: Vec<&str> = contact.iter().map(|s| s.as_str()).collect();
    let new_account = NewAccount {
        contact: &contact_refs,
        terms_of_service_agreed: config.agreed,
        only_return_existing: false,
    };

    let external_account = match &config.external_account {
        Some(eab) => {
            let hmac = decode_eab_hmac(&eab.hmac_b64)?;
            Some(ExternalAccountKey::new(eab.key_id.clone(), &hmac))
        }
        None => None,
    };

    info!(email = %user.email(), ca = %ca_url, "Registering new ACME account");
    let (account, credentials) =
        create_account(&new_account, ca_url, external_account.as_ref(), config).await?;

    user.meta.account_url = Some(account.id().to_string());
    user.credentials = Some(serde_json::to_vec(&credentials)?);
    account::save_user(storage, issuer_key, &user).await?;

    info!(account_url = %account.id(), "ACME account registered");
    Ok(account)
}

async fn account_from_credentials(
    credentials: AccountCredentials,
    config: &AcmeConfig,
) -> Result<Account> {
    match &config.trusted_roots {
        Some(roots) => {
            Account::from_credentials_and_http(credentials, custom_http_client(roots)?)
                .await
                .map_err(classify_acme_error)
        }
        None => Account::from_credentials(credentials)
            .await
            .map_err(classify_acme_error),
    }
}

async fn create_account(
    new_account: &NewAccount<'_>,
    ca_url: &str,
    external_account: Option<&ExternalAccountKey>,
    config: &AcmeConfig,
) -> Result<(Account, AccountCredentials)> {
    match &config.trusted_roots {
        Some(roots) => Account::create_with_http(
            new_account,
            ca_url,
            external_account,
            custom_http_client(roots)?,
        )
        .await
        .map_err(classify_acme_error),
        None => Account::create(new_account, ca_url, external_account)
            .await
            .map_err(classify_acme_error),
    }
}

/// Outbound HTTP client with the webpki roots plus the configured extras
fn custom_http_client(
    roots: &[rustls::pki_types::CertificateDer<'static>],
) -> Result<Box<dyn instant_acme::HttpClient>> {
    let mut store = rustls::RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for root in roots {
        store
            .add(root.clone())
            .map_err(|e| Error::Config(format!("invalid trusted root: {e}")))?;
    }

    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(store)
        .with_no_client_auth();
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build::<_, http_body_util::Full<bytes::Bytes>>(connector);
    Ok(Box::new(client))
}

fn decode_eab_hmac(hmac_b64: &str) -> Result<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;

    URL_SAFE_NO_PAD
        .decode(hmac_b64)
        .or_else(|_| STANDARD.decode(hmac_b64))
        .map_err(|e| Error::Config(format!("external account HMAC is not base64: {e}")))
}

/// Map transport errors into the crate taxonomy.
///
/// HTTP 429 becomes rate-limited (no-retry for the backoff engine); other
/// CA-reported problems and transport failures are transient.
fn classify_acme_error(err: instant_acme::Error) -> Error {
    match err {
        instant_acme::Error::Api(problem) => {
            if problem.status == Some(429) {
                Error::RateLimited(problem.to_string())
            } else {
                Error::Transient(problem.to_string())
            }
        }
        other => Error::Transient(other.to_string()),
    }
}

fn is_loopback(host: &str) -> bool {
    let host = strip_port(host);
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => false,
    }
}

fn is_internal(host: &str) -> bool {
    match strip_port(host).parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_private() || ip.is_link_local(),
        Ok(IpAddr::V6(ip)) => {
            // fc00::/7 unique-local, fe80::/10 link-local
            let segments = ip.segments();
            (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

/// Strip a port and IPv6 brackets off a URL host segment
fn strip_port(host: &str) -> &str {
    let host = host.strip_prefix('[').unwrap_or(host);
    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
    .trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ca_url_requires_https() {
        let config = AcmeConfig {
            ca: "http://acme.example.com/directory".to_string(),
            ..AcmeConfig::default()
        };
        let err = resolve_ca_url(&config, false).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_resolve_ca_url_allows_local_http() {
        for ca in [
            "http://localhost:14000/dir",
            "http://127.0.0.1:14000/dir",
            "http://10.0.0.5/dir",
            "http://192.168.1.10:4001/dir",
            "http://[::1]:14000/dir",
        ] {
            let config = AcmeConfig {
                ca: ca.to_string(),
                ..AcmeConfig::default()
            };
            assert_eq!(resolve_ca_url(&config, false).unwrap(), ca, "{ca}");
        }
    }

    #[test]
    fn test_resolve_ca_url_assumes_https() {
        let config = AcmeConfig {
            ca: "acme.example.com/directory".to_string(),
            ..AcmeConfig::default()
        };
        assert_eq!(
            resolve_ca_url(&config, false).unwrap(),
            "https://acme.example.com/directory"
        );
    }

    #[test]
    fn test_resolve_test_ca_fallback() {
        // default production CA falls back to default staging
        let config = AcmeConfig::default();
        assert_eq!(resolve_ca_url(&config, true).unwrap(), LETS_ENCRYPT_STAGING);

        // a custom CA without a test CA keeps using the primary
        let config = AcmeConfig {
            ca: "https://ca.internal/dir".to_string(),
            test_ca: None,
            ..AcmeConfig::default()
        };
        assert_eq!(
            resolve_ca_url(&config, true).unwrap(),
            "https://ca.internal/dir"
        );
    }

    #[test]
    fn test_eab_hmac_decoding() {
        use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
        use base64::Engine;

        let raw = b"secret-hmac-key";
        assert_eq!(decode_eab_hmac(&URL_SAFE_NO_PAD.encode(raw)).unwrap(), raw);
        assert_eq!(decode_eab_hmac(&STANDARD.encode(raw)).unwrap(), raw);
        assert!(decode_eab_hmac("!!!not base64!!!").is_err());
    }

    #[test]
    fn test_is_loopback_and_internal() {
        assert!(is_loopback("localhost"));
        assert!(is_loopback("localhost:14000"));
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("[::1]:443"));
        assert!(!is_loopback("example.com"));

        assert!(is_internal("10.1.2.3"));
        assert!(is_internal("172.16.0.1"));
        assert!(is_internal("192.168.0.1:8080"));
        assert!(is_internal("169.254.1.1"));
        assert!(!is_internal("8.8.8.8"));
        assert!(!is_internal("example.com"));
    }

    #[test]
    fn test_challenge_selection_with_fixed_seed() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut available = vec![ChallengeKind::Http01, ChallengeKind::TlsAlpn01];

        let first = pick_challenge(&mut rng, &mut available).unwrap();
        assert_eq!(available.len(), 1);
        let second = pick_challenge(&mut rng, &mut available).unwrap();
        assert!(available.is_empty());
        assert_ne!(first, second);

        // the set is exhausted
        assert!(pick_challenge(&mut rng, &mut available).is_none());

        // the same seed yields the same first pick
        let mut replay = StdRng::seed_from_u64(42);
        let mut replay_set = vec![ChallengeKind::Http01, ChallengeKind::TlsAlpn01];
        let replay_first = pick_challenge(&mut replay, &mut replay_set).unwrap();
        assert_eq!(first, replay_first);
    }

    #[test]
    fn test_dns_provider_makes_dns_exclusive() {
        use crate::solver::DnsProvider;

        #[derive(Debug)]
        struct NullDns;

        #[async_trait::async_trait]
        impl DnsProvider for NullDns {
            async fn put_txt_record(&self, _: &str, _: &str, _: &str) -> Result<()> {
                Ok(())
            }
            async fn delete_txt_record(&self, _: &str, _: &str) -> Result<()> {
                Ok(())
            }
        }

        let config = AcmeConfig {
            dns_provider: Some(Arc::new(NullDns)),
            ..AcmeConfig::default()
        };
        assert_eq!(initial_challenges_for(&config), vec![ChallengeKind::Dns01]);
    }

    #[test]
    fn test_disabled_challenges_are_excluded() {
        let config = AcmeConfig {
            disable_http_challenge: true,
            ..AcmeConfig::default()
        };
        assert_eq!(
            initial_challenges_for(&config),
            vec![ChallengeKind::TlsAlpn01]
        );

        let config = AcmeConfig {
            disable_http_challenge: true,
            disable_tls_alpn_challenge: true,
            ..AcmeConfig::default()
        };
        assert!(initial_challenges_for(&config).is_empty());

        let config = AcmeConfig::default();
        assert_eq!(
            initial_challenges_for(&config),
            vec![ChallengeKind::Http01, ChallengeKind::TlsAlpn01]
        );
    }
}
