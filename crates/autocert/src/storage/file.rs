//! Filesystem-backed storage
//!
//! Maps logical keys to files under a base directory with restrictive
//! permissions (0700 directories, 0600 key material). Locks are lock files
//! whose contents carry a freshness timestamp; a lock older than
//! [`STALE_LOCK_DURATION`] is presumed abandoned by a crashed process and
//! is broken.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{KeyInfo, Storage};
use crate::error::{Error, Result};

/// How often a blocked `lock` call re-checks the lock file
const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Age after which a lock file is considered abandoned
const STALE_LOCK_DURATION: Duration = Duration::from_secs(2 * 60 * 60);

/// Filesystem storage rooted at a base directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    /// Create a file storage rooted at `base_path`, creating it if needed
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&base_path, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self { base_path })
    }

    /// The root directory of this storage
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        // keys are sanitized at construction; refuse traversal segments
        // anyway in case a caller hands us a raw string
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                continue;
            }
            path.push(segment);
        }
        path
    }

    // lock names are logical paths like `<issuer>/locks/<op>`; they map to
    // files the same way keys do
    fn lock_path(&self, name: &str) -> PathBuf {
        self.key_path(&format!("{name}.lock"))
    }

    fn lock_is_stale(path: &Path) -> bool {
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => match modified.elapsed() {
                Ok(age) => age > STALE_LOCK_DURATION,
                Err(_) => false,
            },
            // racing unlock; not stale, just gone
            Err(_) => false,
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &value).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        debug!(key = %key, bytes = value.len(), "Stored key");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.key_path(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotExist(key.to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotExist(key.to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn exists(&self, key: &str) -> bool {
        tokio::fs::try_exists(self.key_path(key))
            .await
            .unwrap_or(false)
    }

    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let root = self.key_path(prefix);
        if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut pending = vec![(root, prefix.trim_matches('/').to_string())];
        while let Some((dir, logical)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let child = if logical.is_empty() {
                    name.clone()
                } else {
                    format!("{logical}/{name}")
                };
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if recursive {
                        pending.push((entry.path(), child));
                    } else {
                        keys.push(child);
                    }
                } else {
                    keys.push(child);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn stat(&self, key: &str) -> Result<KeyInfo> {
        let path = self.key_path(key);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotExist(key.to_string()));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let modified = meta
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t));

        Ok(KeyInfo {
            key: key.to_string(),
            modified,
            size: if meta.is_file() { meta.len() } else { 0 },
            is_terminal: meta.is_file(),
        })
    }

    async fn lock(&self, name: &str) -> Result<()> {
        let path = self.lock_path(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        loop {
            // O_CREAT|O_EXCL is the atomic cross-process claim
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    tokio::fs::write(&path, Utc::now().to_rfc3339()).await?;
                    debug!(lock = %name, "Acquired storage lock");
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Self::lock_is_stale(&path) {
                        warn!(lock = %name, "Breaking stale storage lock");
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.lock_path(name)).await {
            Ok(()) => {
                debug!(lock = %name, "Released storage lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
