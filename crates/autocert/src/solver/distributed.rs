//! Distributed challenge solving
//!
//! Lets any instance in a fleet answer a challenge initiated by any other
//! instance. The initiating node publishes the challenge material to shared
//! storage before presenting; the serving paths (the HTTP challenge handler
//! and the TLS-ALPN certificate lookup) read that same key to answer. The
//! only cluster requirement is shared storage.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{host_only, Solver};
use crate::error::{Error, Result};
use crate::storage::{keys, Storage};

/// URL path prefix of HTTP-01 challenge requests
pub const CHALLENGE_BASE_PATH: &str = "/.well-known/acme-challenge/";

/// Challenge material published to shared storage while a challenge is in
/// flight; the cross-node rendezvous for distributed solving
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeInfo {
    /// Domain being validated
    pub domain: String,
    /// Challenge token issued by the CA
    pub token: String,
    /// Key authorization the CA expects to see
    pub key_auth: String,
}

/// Wrapper that publishes challenge material to shared storage around an
/// inner solver
pub struct DistributedSolver {
    storage: Arc<dyn Storage>,
    issuer_key: String,
    inner: Arc<dyn Solver>,
}

impl DistributedSolver {
    /// Wrap `inner`, publishing challenge material under the CA-scoped
    /// prefix of `issuer_key` in `storage`
    pub fn new(storage: Arc<dyn Storage>, issuer_key: impl Into<String>, inner: Arc<dyn Solver>) -> Self {
        Self {
            storage,
            issuer_key: issuer_key.into(),
            inner,
        }
    }
}

#[async_trait]
impl Solver for DistributedSolver {
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        let info = ChallengeInfo {
            domain: domain.to_string(),
            token: token.to_string(),
            key_auth: key_auth.to_string(),
        };
        let blob = serde_json::to_vec(&info)?;

        self.storage
            .store(&keys::challenge_tokens_key(&self.issuer_key, domain), blob)
            .await?;

        self.inner
            .present(domain, token, key_auth)
            .await
            .map_err(|e| Error::Transient(format!("presenting with embedded solver: {e}")))
    }

    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        let key = keys::challenge_tokens_key(&self.issuer_key, domain);
        match self.storage.delete(&key).await {
            Ok(()) => {}
            Err(e) if e.is_not_exist() => {}
            Err(e) => return Err(e),
        }

        self.inner
            .clean_up(domain, token, key_auth)
            .await
            .map_err(|e| Error::Transient(format!("cleaning up embedded solver: {e}")))
    }
}

impl std::fmt::Debug for DistributedSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedSolver")
            .field("issuer_key", &self.issuer_key)
            .finish_non_exhaustive()
    }
}

/// Load the in-flight challenge material for `host`, if any.
///
/// Absence is normal (the challenge may have been initiated elsewhere with
/// different storage, or already cleaned up) and reported as `None`.
pub async fn load_challenge_info(
    storage: &dyn Storage,
    issuer_key: &str,
    host: &str,
) -> Option<ChallengeInfo> {
    let key = keys::challenge_tokens_key(issuer_key, host);
    let blob = match storage.load(&key).await {
        Ok(blob) => blob,
        Err(e) if e.is_not_exist() => return None,
        Err(e) => {
            error!(host = %host, error = %e, "Failed to read distributed challenge token");
            return None;
        }
    };

    match serde_json::from_slice::<ChallengeInfo>(&blob) {
        Ok(info) => Some(info),
        Err(e) => {
            error!(host = %host, key = %key, error = %e, "Challenge token file is corrupted");
            None
        }
    }
}

/// Answer an HTTP-01 challenge request out of shared storage.
///
/// Returns the key authorization to serve when the request's method, path
/// token, and host all match the stored challenge; the host comparison is
/// exact (lowercased) to mitigate DNS rebinding.
pub async fn answer_http_challenge(
    storage: &dyn Storage,
    issuer_key: &str,
    method: &str,
    path: &str,
    host: &str,
) -> Option<String> {
    if method != "GET" {
        return None;
    }
    let token = path.strip_prefix(CHALLENGE_BASE_PATH)?;
    if token.is_empty() {
        return None;
    }

    let host = host_only(host).to_lowercase();
    let info = load_challenge_info(storage, issuer_key, &host).await?;

    if info.token != token {
        debug!(host = %host, "Challenge token mismatch");
        return None;
    }
    if !info.domain.eq_ignore_ascii_case(&host) {
        debug!(host = %host, domain = %info.domain, "Challenge host mismatch");
        return None;
    }

    info!(domain = %info.domain, "Served key authentication for HTTP challenge");
    Some(info.key_auth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingSolver {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Solver for RecordingSolver {
        async fn present(&self, domain: &str, _token: &str, _key_auth: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("present:{domain}"));
            Ok(())
        }

        async fn clean_up(&self, domain: &str, _token: &str, _key_auth: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("clean_up:{domain}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_present_publishes_then_delegates() {
        let storage = Arc::new(MemoryStorage::new());
        let inner = Arc::new(RecordingSolver::default());
        let solver = DistributedSolver::new(storage.clone(), "ca-dir", inner.clone());

        solver
            .present("example.com", "tok123", "tok123.thumb")
            .await
            .unwrap();

        let stored = storage
            .load("ca-dir/challenge_tokens/example.com.json")
            .await
            .unwrap();
        let info: ChallengeInfo = serde_json::from_slice(&stored).unwrap();
        assert_eq!(
            info,
            ChallengeInfo {
                domain: "example.com".into(),
                token: "tok123".into(),
                key_auth: "tok123.thumb".into(),
            }
        );
        assert_eq!(inner.calls.lock().unwrap().as_slice(), ["present:example.com"]);
    }

    #[tokio::test]
    async fn test_clean_up_removes_record() {
        let storage = Arc::new(MemoryStorage::new());
        let inner = Arc::new(RecordingSolver::default());
        let solver = DistributedSolver::new(storage.clone(), "ca-dir", inner.clone());

        solver.present("example.com", "t", "t.k").await.unwrap();
        solver.clean_up("example.com", "t", "t.k").await.unwrap();

        assert!(!storage.exists("ca-dir/challenge_tokens/example.com.json").await);
        // cleaning up twice must not fail just because the record is gone
        solver.clean_up("example.com", "t", "t.k").await.unwrap();
    }

    #[tokio::test]
    async fn test_answer_http_challenge() {
        let storage = MemoryStorage::new();
        let info = ChallengeInfo {
            domain: "example.com".into(),
            token: "tok123".into(),
            key_auth: "tok123.thumbprint".into(),
        };
        storage
            .store(
                "ca-dir/challenge_tokens/example.com.json",
                serde_json::to_vec(&info).unwrap(),
            )
            .await
            .unwrap();

        // happy path, including a port in the Host header
        let answer = answer_http_challenge(
            &storage,
            "ca-dir",
            "GET",
            "/.well-known/acme-challenge/tok123",
            "Example.com:5002",
        )
        .await;
        assert_eq!(answer.as_deref(), Some("tok123.thumbprint"));

        // wrong token
        assert!(answer_http_challenge(
            &storage,
            "ca-dir",
            "GET",
            "/.well-known/acme-challenge/other",
            "example.com",
        )
        .await
        .is_none());

        // wrong method
        assert!(answer_http_challenge(
            &storage,
            "ca-dir",
            "POST",
            "/.well-known/acme-challenge/tok123",
            "example.com",
        )
        .await
        .is_none());

        // unrelated path
        assert!(
            answer_http_challenge(&storage, "ca-dir", "GET", "/index.html", "example.com")
                .await
                .is_none()
        );

        // host with no staged challenge
        assert!(answer_http_challenge(
            &storage,
            "ca-dir",
            "GET",
            "/.well-known/acme-challenge/tok123",
            "rebinder.evil",
        )
        .await
        .is_none());
    }
}
