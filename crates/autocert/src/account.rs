//! ACME account persistence
//!
//! One account per `(CA, email)`. The account's key material is created by
//! the ACME transport at registration time and persisted verbatim as its
//! credentials blob; registration metadata is stored alongside it. Emails
//! are compared case-insensitively and path-sanitized for storage, with the
//! original form preserved in the metadata.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::{keys, Storage};

/// Registration metadata stored next to the account credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMeta {
    /// Email in the form the caller supplied
    pub email: String,
    /// Account URL assigned by the CA, once registered
    #[serde(default)]
    pub account_url: Option<String>,
    /// When this account record was created
    pub created: DateTime<Utc>,
}

/// An ACME account, possibly not yet registered with the CA
#[derive(Debug, Clone)]
pub struct User {
    /// Registration metadata
    pub meta: UserMeta,
    /// Serialized transport credentials (contains the private key);
    /// present only after registration
    pub credentials: Option<Vec<u8>>,
}

impl User {
    /// A fresh, unregistered account record for `email`
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            meta: UserMeta {
                email: email.into(),
                account_url: None,
                created: Utc::now(),
            },
            credentials: None,
        }
    }

    /// Whether this account has been registered with the CA
    pub fn is_registered(&self) -> bool {
        self.credentials.is_some()
    }

    /// The account email as supplied by the caller
    pub fn email(&self) -> &str {
        &self.meta.email
    }
}

/// Load the account for `(issuer_key, email)`, or return a fresh
/// unregistered one.
///
/// An empty `email` is resolved to the most recently modified account
/// already stored for this CA, so restarted processes keep using the
/// account they registered before.
pub async fn get_user(
    storage: &Arc<dyn Storage>,
    issuer_key: &str,
    email: &str,
) -> Result<User> {
    let email = if email.is_empty() {
        match most_recent_email(storage.as_ref(), issuer_key).await {
            Some(found) => found,
            None => String::new(),
        }
    } else {
        email.to_string()
    };

    let meta_key = keys::user_registration(issuer_key, &email);
    let meta = match storage.load(&meta_key).await {
        Ok(blob) => serde_json::from_slice::<UserMeta>(&blob)
            .map_err(|e| Error::Internal(format!("corrupted account metadata {meta_key}: {e}")))?,
        Err(e) if e.is_not_exist() => {
            debug!(email = %email, "No stored account; starting unregistered");
            return Ok(User::new(email));
        }
        Err(e) => return Err(e),
    };

    let credentials = match storage
        .load(&keys::user_credentials(issuer_key, &email))
        .await
    {
        Ok(blob) => Some(blob),
        Err(e) if e.is_not_exist() => None,
        Err(e) => return Err(e),
    };

    debug!(
        email = %meta.email,
        registered = credentials.is_some(),
        "Loaded stored account"
    );
    Ok(User { meta, credentials })
}

/// Persist an account's metadata and, if present, its credentials
pub async fn save_user(
    storage: &Arc<dyn Storage>,
    issuer_key: &str,
    user: &User,
) -> Result<()> {
    let email = user.email();

    let meta_blob = serde_json::to_vec(&user.meta)?;
    storage
        .store(&keys::user_registration(issuer_key, email), meta_blob)
        .await?;

    if let Some(credentials) = &user.credentials {
        storage
            .store(
                &keys::user_credentials(issuer_key, email),
                credentials.clone(),
            )
            .await?;
    }

    debug!(email = %email, "Saved account");
    Ok(())
}

/// Email of the most recently modified account folder under this CA
async fn most_recent_email(storage: &dyn Storage, issuer_key: &str) -> Option<String> {
    let folders = storage
        .list(&keys::users_prefix(issuer_key), false)
        .await
        .ok()?;

    let mut newest: Option<(DateTime<Utc>, String)> = None;
    for folder in folders {
        let modified = match storage.stat(&folder).await {
            Ok(info) => info.modified?,
            Err(_) => continue,
        };
        let candidate = folder.rsplit('/').next()?.to_string();
        match &newest {
            Some((best, _)) if *best >= modified => {}
            _ => newest = Some((modified, candidate)),
        }
    }

    let (_, folder_email) = newest?;

    // the folder name is the sanitized form; prefer the original from the
    // metadata file when it parses
    let meta_key = keys::user_registration(issuer_key, &folder_email);
    if let Ok(blob) = storage.load(&meta_key).await {
        if let Ok(meta) = serde_json::from_slice::<UserMeta>(&blob) {
            return Some(meta.email);
        }
    }
    Some(folder_email)
}
