//! Challenge solvers
//!
//! Each ACME challenge type has a solver with the same two-phase shape:
//! [`Solver::present`] stages whatever the CA will look for, and
//! [`Solver::clean_up`] tears it down after validation. The HTTP-01 and
//! TLS-ALPN-01 solvers share one listener per bind address through the
//! [`SolverTable`]; the first presenter at an address starts the challenge
//! server and the last cleaner-upper stops it.

pub mod distributed;
pub mod dns;
pub mod http;
pub mod listen;
pub mod tls_alpn;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;

pub use distributed::DistributedSolver;
pub use dns::{DnsProvider, DnsSolver};
pub use http::HttpSolver;
pub use tls_alpn::TlsAlpnSolver;

/// A challenge solver
///
/// Within one ACME order, `present` happens before the CA's validation
/// request, and the validation request happens before `clean_up`.
#[async_trait]
pub trait Solver: Send + Sync {
    /// Stage the challenge response for `domain`
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;

    /// Remove the staged challenge response for `domain`
    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;
}

/// Per-address state for a shared challenge listener
struct SolverInfo {
    /// Challenges currently relying on this address
    count: usize,
    /// Signals the serve task to stop accepting
    shutdown: CancellationToken,
    /// Resolved when the serve task has released the socket
    done: Option<oneshot::Receiver<()>>,
    /// Whether this process bound the socket (a compatible server may
    /// already be answering on the address instead)
    bound: bool,
}

impl SolverInfo {
    fn new() -> Self {
        Self {
            count: 0,
            shutdown: CancellationToken::new(),
            done: None,
            bound: false,
        }
    }
}

/// Registry of active challenge listeners, keyed by bind address.
///
/// Reference counts and listener lifetimes are mutated under the table
/// mutex; the listeners themselves are used by their serve tasks without
/// holding it.
#[derive(Default)]
pub struct SolverTable {
    inner: Mutex<HashMap<String, SolverInfo>>,
}

impl SolverTable {
    /// Create an empty solver table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one challenge at `addr`, starting a server when this is the
    /// first one and the socket is free.
    ///
    /// `start_server` receives the freshly bound listener, a shutdown token,
    /// and a completion sender; it must spawn the serve task and hand the
    /// sender to it. When [`listen::robust_try_listen`] reports the address
    /// as already answered by a compatible server, no server is started and
    /// the challenge proceeds on the assumption that whatever is listening
    /// will answer it.
    pub async fn acquire<F>(&self, addr: &str, start_server: F) -> Result<()>
    where
        F: FnOnce(TcpListener, CancellationToken, oneshot::Sender<()>),
    {
        let mut table = self.inner.lock().await;
        let info = table
            .entry(addr.to_string())
            .or_insert_with(SolverInfo::new);
        info.count += 1;

        if info.bound || info.count > 1 {
            // already served by us or by a co-tenant probe
            return Ok(());
        }

        match listen::robust_try_listen(addr).await {
            Ok(Some(listener)) => {
                let (done_tx, done_rx) = oneshot::channel();
                info.bound = true;
                info.done = Some(done_rx);
                start_server(listener, info.shutdown.clone(), done_tx);
                debug!(addr = %addr, "Started challenge server");
                Ok(())
            }
            Ok(None) => {
                debug!(addr = %addr, "Address already answered by a compatible server");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release one challenge at `addr`; the last release stops the server.
    ///
    /// Does not return until the listener (if this process bound one) has
    /// been closed.
    pub async fn release(&self, addr: &str) {
        let mut table = self.inner.lock().await;
        let Some(info) = table.get_mut(addr) else {
            return;
        };

        info.count = info.count.saturating_sub(1);
        if info.count > 0 {
            return;
        }

        // last one out turns off the lights
        let info = match table.remove(addr) {
            Some(info) => info,
            None => return,
        };
        info.shutdown.cancel();
        if let Some(done) = info.done {
            // wait for the serve task to drop the socket; a dropped sender
            // counts as done
            let _ = done.await;
        }
        debug!(addr = %addr, "Stopped challenge server");
    }

    /// Number of addresses with active challenges
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Whether no challenge listeners are active
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Reference count for an address, for tests and introspection
    pub async fn count(&self, addr: &str) -> usize {
        self.inner
            .lock()
            .await
            .get(addr)
            .map(|info| info.count)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for SolverTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolverTable").finish_non_exhaustive()
    }
}

/// The host portion of a `host:port` string (or the input unchanged)
pub(crate) fn host_only(hostport: &str) -> &str {
    match hostport.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => hostport,
    }
}
