//! Shared runtime state
//!
//! Single-flight jobs, challenge listeners, rate-limiter buckets, and ACME
//! account handles are shared across every manager created from the same
//! [`Runtime`], so unrelated callers in one process pool their resources.
//! Nothing here is global: tests create fresh runtimes for isolation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use instant_acme::Account;

use crate::config::{RATE_LIMIT_EVENTS, RATE_LIMIT_WINDOW};
use crate::jobs::JobManager;
use crate::limiter::RingRateLimiter;
use crate::solver::SolverTable;

/// Process-shared tables for job scheduling, challenge listeners, rate
/// limiting, and ACME client reuse
pub struct Runtime {
    pub(crate) jobs: JobManager,
    pub(crate) solvers: Arc<SolverTable>,
    // buckets live for the life of the runtime; the number of
    // (CA, account) pairs is small under any sane configuration
    rate_limiters: Mutex<HashMap<String, Arc<RingRateLimiter>>>,
    // guarded by one async mutex so exactly one account handle is
    // constructed per (CA, account) even under concurrent orders
    pub(crate) accounts: tokio::sync::Mutex<HashMap<String, Arc<Account>>>,
}

impl Runtime {
    /// Create a fresh runtime
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: JobManager::default(),
            solvers: Arc::new(SolverTable::new()),
            rate_limiters: Mutex::new(HashMap::new()),
            accounts: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// The shared challenge-listener table
    pub fn solver_table(&self) -> Arc<SolverTable> {
        self.solvers.clone()
    }

    /// The rate-limiter bucket for a `(ca_url, email)` pair, created on
    /// first use and held for the life of the runtime
    pub(crate) fn rate_limiter(&self, key: &str) -> Arc<RingRateLimiter> {
        let mut limiters = self
            .rate_limiters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RingRateLimiter::new(RATE_LIMIT_EVENTS, RATE_LIMIT_WINDOW)))
            .clone()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_buckets_are_reused() {
        let runtime = Runtime::new();
        let a = runtime.rate_limiter("https://ca.example/dir,me@example.com");
        let b = runtime.rate_limiter("https://ca.example/dir,me@example.com");
        let c = runtime.rate_limiter("https://ca.example/dir,other@example.com");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
