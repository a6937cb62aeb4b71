//! TLS-ALPN-01 challenge solver
//!
//! RFC 8737: the CA connects with ALPN `acme-tls/1` and expects a
//! self-signed certificate for the domain carrying an `acmeIdentifier`
//! extension whose value is the SHA-256 of the key authorization.
//!
//! `present` installs the challenge certificate into the certificate cache
//! (so a caller's own TLS listener can answer) and, if needed, starts a
//! bare challenge TLS server on the shared listener. The server resolves
//! certificates per connection, falling back to shared storage so it can
//! answer challenges initiated by other instances.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{Acceptor, ServerConfig};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::distributed::load_challenge_info;
use super::{Solver, SolverTable};
use crate::cache::Cache;
use crate::config::ALPN_HANDSHAKE_TIMEOUT;
use crate::crypto;
use crate::error::{Error, Result};
use crate::resolver::ACME_TLS_ALPN_PROTOCOL;
use crate::storage::Storage;

/// Solver answering TLS-ALPN-01 challenges on a shared listener
pub struct TlsAlpnSolver {
    table: Arc<SolverTable>,
    storage: Arc<dyn Storage>,
    cache: Arc<Cache>,
    issuer_key: String,
    address: String,
}

impl TlsAlpnSolver {
    /// Create a solver serving at `address` (host:port)
    pub fn new(
        table: Arc<SolverTable>,
        storage: Arc<dyn Storage>,
        cache: Arc<Cache>,
        issuer_key: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            table,
            storage,
            cache,
            issuer_key: issuer_key.into(),
            address: address.into(),
        }
    }

    fn spawn_server(
        storage: Arc<dyn Storage>,
        cache: Arc<Cache>,
        issuer_key: String,
        listener: TcpListener,
        shutdown: CancellationToken,
        done: oneshot::Sender<()>,
    ) {
        tokio::spawn(async move {
            loop {
                let (stream, remote) = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "TLS-ALPN challenge server failed to accept");
                            continue;
                        }
                    },
                };

                let storage = storage.clone();
                let cache = cache.clone();
                let issuer_key = issuer_key.clone();
                tokio::spawn(async move {
                    let handshake = handle_alpn_conn(storage, cache, issuer_key, stream);
                    match tokio::time::timeout(ALPN_HANDSHAKE_TIMEOUT, handshake).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(remote = %remote, error = %e, "TLS-ALPN handshake failed"),
                        Err(_) => debug!(remote = %remote, "TLS-ALPN handshake timed out"),
                    }
                });
            }

            drop(listener);
            let _ = done.send(());
        });
    }
}

#[async_trait]
impl Solver for TlsAlpnSolver {
    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        // load the challenge certificate into the cache first; a TLS server
        // fed by our resolver can then answer even if the challenge server
        // below never binds
        let (chain, certified) = challenge_cert(domain, key_auth)?;
        self.cache.cache_challenge_cert(domain, &chain, certified)?;

        let storage = self.storage.clone();
        let cache = self.cache.clone();
        let issuer_key = self.issuer_key.clone();
        self.table
            .acquire(&self.address, move |listener, shutdown, done| {
                Self::spawn_server(storage, cache, issuer_key, listener, shutdown, done);
            })
            .await
    }

    async fn clean_up(&self, domain: &str, _token: &str, _key_auth: &str) -> Result<()> {
        self.cache.remove_challenge_cert(domain);
        self.table.release(&self.address).await;
        Ok(())
    }
}

impl std::fmt::Debug for TlsAlpnSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAlpnSolver")
            .field("address", &self.address)
            .field("issuer_key", &self.issuer_key)
            .finish_non_exhaustive()
    }
}

/// Complete one challenge handshake and close the connection.
///
/// The ClientHello is inspected before any config is committed, so the
/// certificate can be looked up asynchronously: first in the local cache,
/// then in shared storage for challenges initiated by other instances.
async fn handle_alpn_conn(
    storage: Arc<dyn Storage>,
    cache: Arc<Cache>,
    issuer_key: String,
    stream: tokio::net::TcpStream,
) -> Result<()> {
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
        .await
        .map_err(|e| Error::Transient(format!("reading ClientHello: {e}")))?;

    let hello = start.client_hello();
    let offers_acme = hello
        .alpn()
        .map(|mut protos| protos.any(|p| p == ACME_TLS_ALPN_PROTOCOL))
        .unwrap_or(false);
    if !offers_acme {
        return Err(Error::Validation(
            "client did not offer acme-tls/1".to_string(),
        ));
    }

    let sni = hello
        .server_name()
        .map(|s| s.to_lowercase())
        .ok_or_else(|| Error::Validation("client sent no SNI".to_string()))?;

    let certified = match cache.get_challenge_cert(&sni) {
        Some(cert) => cert.certified.clone(),
        None => {
            // challenge initiated by another instance; rebuild the
            // certificate from the shared token record
            let info = load_challenge_info(storage.as_ref(), &issuer_key, &sni)
                .await
                .ok_or_else(|| {
                    Error::Validation(format!("no challenge staged for {sni}"))
                })?;
            if !info.domain.eq_ignore_ascii_case(&sni) {
                return Err(Error::Validation(format!(
                    "challenge record for {} does not match SNI {sni}",
                    info.domain
                )));
            }
            let (_, certified) = challenge_cert(&sni, &info.key_auth)?;
            certified
        }
    };

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCert(certified)));
    config.alpn_protocols = vec![ACME_TLS_ALPN_PROTOCOL.to_vec()];

    // completing the handshake is the whole job; the CA closes after it
    let _stream = start
        .into_stream(Arc::new(config))
        .await
        .map_err(|e| Error::Transient(format!("TLS-ALPN handshake: {e}")))?;

    debug!(sni = %sni, "Answered TLS-ALPN challenge handshake");
    Ok(())
}

/// Resolver that always serves one fixed certificate
#[derive(Debug)]
struct FixedCert(Arc<CertifiedKey>);

impl rustls::server::ResolvesServerCert for FixedCert {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Build the self-signed challenge certificate for `domain` per RFC 8737
pub fn challenge_cert(
    domain: &str,
    key_auth: &str,
) -> Result<(Vec<CertificateDer<'static>>, Arc<CertifiedKey>)> {
    let digest = Sha256::digest(key_auth.as_bytes());

    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| Error::Internal(format!("challenge cert params: {e}")))?;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(
        digest.as_slice(),
    )];

    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Internal(format!("challenge cert key: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Internal(format!("challenge cert signing: {e}")))?;

    let chain = vec![cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let certified = crypto::certified_key(chain.clone(), key)?;
    Ok((chain, certified))
}
