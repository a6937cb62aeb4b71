//! Automatic TLS certificate management over ACME (RFC 8555)
//!
//! Hand this crate a list of domain names and it keeps currently-valid
//! certificates available for them: obtaining, renewing, and revoking
//! against any ACME-compatible CA without the caller ever talking to the
//! CA directly.
//!
//! # Architecture
//!
//! - [`AcmeManager`]: the lifecycle engine (obtain/renew/revoke state
//!   machine, single-flight per name, challenge rotation)
//! - [`Cache`]: in-memory SNI-indexed certificate store with background
//!   renewal sweeps
//! - [`Storage`]: pluggable persistence shared across a fleet;
//!   [`FileStorage`] and [`MemoryStorage`] ship in-crate
//! - [`solver`]: HTTP-01, TLS-ALPN-01, and DNS-01 solvers, including the
//!   distributed solver that lets any instance answer a challenge another
//!   instance started
//! - [`Runtime`]: shared job queue, rate limiters, challenge listeners,
//!   and ACME client handles
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use autocert::{AcmeConfig, AcmeManager, Cache, CacheOptions, FileStorage, Runtime};
//!
//! #[tokio::main]
//! async fn main() -> autocert::Result<()> {
//!     let storage = Arc::new(FileStorage::new("/var/lib/autocert")?);
//!     let cache = Cache::new(CacheOptions::default());
//!     let runtime = Runtime::new();
//!
//!     let config = AcmeConfig {
//!         email: "admin@example.com".into(),
//!         agreed: true,
//!         ..AcmeConfig::default()
//!     };
//!     let manager = AcmeManager::new(config, storage, cache, runtime);
//!
//!     manager.manage(&["example.com", "www.example.com"])?;
//!
//!     // plug into any rustls-based server
//!     let tls_config = manager.tls_config();
//!     # let _ = tls_config;
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod acme;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod jobs;
pub mod limiter;
pub mod manager;
pub mod resolver;
pub mod retry;
pub mod runtime;
pub mod solver;
pub mod storage;

pub use acme::{AcmeClient, ChallengeKind};
pub use cache::{Cache, CacheOptions, CachedCert};
pub use config::{AcmeConfig, ExternalAccountBinding, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
pub use error::{Error, Result};
pub use jobs::JobManager;
pub use limiter::RingRateLimiter;
pub use manager::{AcmeManager, CertificateResource};
pub use resolver::CertResolver;
pub use runtime::Runtime;
pub use solver::{DistributedSolver, DnsProvider, DnsSolver, HttpSolver, Solver, TlsAlpnSolver};
pub use storage::{FileStorage, KeyInfo, MemoryStorage, Storage};
