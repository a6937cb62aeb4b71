//! Pluggable certificate storage
//!
//! Everything the manager persists (accounts, certificates, challenge
//! tokens, locks) goes through the [`Storage`] trait, so a fleet of
//! instances can share state through any backend that implements it.
//! Keys are forward-slash-separated logical paths built by [`keys`].
//!
//! Atomicity contract: every operation must be atomic with respect to
//! concurrent calls from this process and from other processes sharing the
//! same backend. Locks are advisory, mutually exclusive across processes,
//! and scoped to a logical operation rather than to process lifetime.

pub mod file;
pub mod keys;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Metadata about a stored key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// The key this info describes
    pub key: String,
    /// Last modification time, if the backend tracks one
    pub modified: Option<DateTime<Utc>>,
    /// Size in bytes (0 for non-terminal keys)
    pub size: u64,
    /// True if the key holds a value, false if it only prefixes other keys
    pub is_terminal: bool,
}

/// Abstract key/value store with advisory cross-process locking
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Create or overwrite the value at `key`
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Load the value at `key`; absence is [`crate::Error::NotExist`]
    async fn load(&self, key: &str) -> Result<Vec<u8>>;

    /// Delete the value at `key`; absence is [`crate::Error::NotExist`]
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether `key` exists
    async fn exists(&self, key: &str) -> bool;

    /// List keys under `prefix`, sorted.
    ///
    /// When `recursive` is false only the next path level is returned;
    /// otherwise all terminal keys below the prefix.
    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>>;

    /// Stat a key
    async fn stat(&self, key: &str) -> Result<KeyInfo>;

    /// Acquire the named advisory lock, waiting until it is free.
    ///
    /// The lock must be released with [`Storage::unlock`] by the same
    /// logical operation that acquired it, including on error paths.
    async fn lock(&self, name: &str) -> Result<()>;

    /// Release the named advisory lock
    async fn unlock(&self, name: &str) -> Result<()>;
}
