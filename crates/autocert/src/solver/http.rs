//! HTTP-01 challenge solver
//!
//! Serves `GET /.well-known/acme-challenge/<token>` on a shared listener.
//! The key authorization is always read back from shared storage rather
//! than process memory, so this solver must be wrapped by the distributed
//! solver, which also means this server answers challenges initiated by
//! any other instance sharing the storage.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::distributed::answer_http_challenge;
use super::{Solver, SolverTable};
use crate::error::Result;
use crate::storage::Storage;

/// Solver answering HTTP-01 challenges on a shared listener
pub struct HttpSolver {
    table: Arc<SolverTable>,
    storage: Arc<dyn Storage>,
    issuer_key: String,
    address: String,
}

impl HttpSolver {
    /// Create a solver serving at `address` (host:port)
    pub fn new(
        table: Arc<SolverTable>,
        storage: Arc<dyn Storage>,
        issuer_key: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            table,
            storage,
            issuer_key: issuer_key.into(),
            address: address.into(),
        }
    }

    fn spawn_server(
        storage: Arc<dyn Storage>,
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
                            warn!(error = %e, "Challenge server failed to accept");
                            continue;
                        }
                    },
                };

                let storage = storage.clone();
                let issuer_key = issuer_key.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let storage = storage.clone();
                        let issuer_key = issuer_key.clone();
                        async move {
                            Ok::<_, Infallible>(
                                serve_challenge(storage.as_ref(), &issuer_key, &req).await,
                            )
                        }
                    });

                    if let Err(e) = http1::Builder::new()
                        .keep_alive(false)
                        .serve_connection(io, service)
                        .await
                    {
                        debug!(remote = %remote, error = %e, "Challenge connection error");
                    }
                });
            }

            drop(listener);
            let _ = done.send(());
        });
    }
}

#[async_trait]
impl Solver for HttpSolver {
    async fn present(&self, _domain: &str, _token: &str, _key_auth: &str) -> Result<()> {
        let storage = self.storage.clone();
        let issuer_key = self.issuer_key.clone();
        self.table
            .acquire(&self.address, move |listener, shutdown, done| {
                Self::spawn_server(storage, issuer_key, listener, shutdown, done);
            })
            .await
    }

    async fn clean_up(&self, _domain: &str, _token: &str, _key_auth: &str) -> Result<()> {
        self.table.release(&self.address).await;
        Ok(())
    }
}

impl std::fmt::Debug for HttpSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSolver")
            .field("address", &self.address)
            .field("issuer_key", &self.issuer_key)
            .finish_non_exhaustive()
    }
}

/// Build the HTTP response for one challenge-server request
async fn serve_challenge(
    storage: &dyn Storage,
    issuer_key: &str,
    req: &Request<Incoming>,
) -> Response<Full<Bytes>> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default();

    let answer = answer_http_challenge(
        storage,
        issuer_key,
        req.method().as_str(),
        req.uri().path(),
        host,
    )
    .await;

    match answer {
        Some(key_auth) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from(key_auth)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::distributed::ChallengeInfo;
    use crate::storage::MemoryStorage;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn staged_storage() -> Arc<MemoryStorage> {
        let storage = Arc::new(MemoryStorage::new());
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
        storage
    }

    async fn http_get(addr: &str, path: &str, host: &str) -> (u16, String) {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let status: u16 = response
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap();
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, body)
    }

    #[tokio::test]
    async fn test_serves_key_authorization() {
        let storage = staged_storage().await;
        let table = Arc::new(SolverTable::new());

        // pick a free port, then present on it
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);

        let solver = HttpSolver::new(table.clone(), storage, "ca-dir", addr.clone());
        solver
            .present("example.com", "tok123", "tok123.thumbprint")
            .await
            .unwrap();

        let (status, body) = http_get(
            &addr,
            "/.well-known/acme-challenge/tok123",
            "example.com",
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body, "tok123.thumbprint");

        let (status, _) = http_get(&addr, "/.well-known/acme-challenge/bogus", "example.com").await;
        assert_eq!(status, 404);

        let (status, _) = http_get(&addr, "/other", "example.com").await;
        assert_eq!(status, 404);

        solver
            .clean_up("example.com", "tok123", "tok123.thumbprint")
            .await
            .unwrap();
        assert!(table.is_empty().await);

        // listener must be released
        assert!(TcpListener::bind(&addr).await.is_ok());
    }

    #[tokio::test]
    async fn test_present_with_occupied_port_coexists() {
        let storage = staged_storage().await;
        let table = Arc::new(SolverTable::new());

        let occupant = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupant.local_addr().unwrap().to_string();

        let solver = HttpSolver::new(table.clone(), storage, "ca-dir", addr.clone());
        solver.present("example.com", "t", "t.k").await.unwrap();
        assert_eq!(table.count(&addr).await, 1);

        // clean_up must not disturb the pre-existing socket
        solver.clean_up("example.com", "t", "t.k").await.unwrap();

        let conn = tokio::net::TcpStream::connect(&addr).await;
        assert!(conn.is_ok());
        drop(occupant);
    }
}
