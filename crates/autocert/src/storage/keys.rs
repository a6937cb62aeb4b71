//! Storage key construction
//!
//! All storage keys are derived here so that every backend sees the same
//! layout and so that untrusted names can never escape their subtree.
//!
//! ```text
//! users/<issuer_key>/<email>/<email>.{key,json}
//! certificates/<issuer_key>/<name>/<name>.{crt,key,json}
//! <issuer_key>/challenge_tokens/<name>.json
//! <issuer_key>/locks/<op>
//! ```

/// Prefix under which all certificate resources are stored
pub const CERTIFICATES_PREFIX: &str = "certificates";

/// Prefix under which all account data is stored
pub const USERS_PREFIX: &str = "users";

/// Sanitize an untrusted name for use as a path segment.
///
/// Lowercases, strips traversal sequences, separators, and control
/// characters, and spells a leading wildcard label as `wildcard_` so it can
/// live on a filesystem.
pub fn safe(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        match c {
            '/' | '\\' => {}
            '*' => out.push_str("wildcard_"),
            ' ' | '+' => out.push('_'),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    // stripping separators can splice dots together, so remove traversal
    // sequences until none remain
    while out.contains("..") {
        out = out.replace("..", "");
    }
    out
}

/// Derive the storage namespace for a CA from its directory URL.
///
/// `https://example.com/acme-ca/directory` becomes
/// `example.com-acme-ca-directory`.
pub fn issuer_key(ca_url: &str) -> String {
    let trimmed = ca_url
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    safe(&trimmed.replace('/', "-"))
}

/// Folder holding everything for one certificate
pub fn site_prefix(issuer_key: &str, domain: &str) -> String {
    format!("{}/{}/{}", CERTIFICATES_PREFIX, issuer_key, safe(domain))
}

/// Key of the PEM certificate chain for a domain
pub fn site_cert(issuer_key: &str, domain: &str) -> String {
    format!("{}/{}.crt", site_prefix(issuer_key, domain), safe(domain))
}

/// Key of the PEM private key for a domain
pub fn site_private_key(issuer_key: &str, domain: &str) -> String {
    format!("{}/{}.key", site_prefix(issuer_key, domain), safe(domain))
}

/// Key of the JSON metadata for a domain's certificate
pub fn site_meta(issuer_key: &str, domain: &str) -> String {
    format!("{}/{}.json", site_prefix(issuer_key, domain), safe(domain))
}

/// Folder holding all accounts registered with one CA
pub fn users_prefix(issuer_key: &str) -> String {
    format!("{}/{}", USERS_PREFIX, issuer_key)
}

/// Folder holding one account
pub fn user_prefix(issuer_key: &str, email: &str) -> String {
    format!("{}/{}", users_prefix(issuer_key), safe(email))
}

/// Key of the account's credential/key material
pub fn user_credentials(issuer_key: &str, email: &str) -> String {
    format!("{}/{}.key", user_prefix(issuer_key, email), safe(email))
}

/// Key of the account's registration metadata
pub fn user_registration(issuer_key: &str, email: &str) -> String {
    format!("{}/{}.json", user_prefix(issuer_key, email), safe(email))
}

/// Prefix for in-flight challenge token records
pub fn challenge_tokens_prefix(issuer_key: &str) -> String {
    format!("{}/challenge_tokens", issuer_key)
}

/// Key of the challenge token record for a domain
pub fn challenge_tokens_key(issuer_key: &str, domain: &str) -> String {
    format!("{}/{}.json", challenge_tokens_prefix(issuer_key), safe(domain))
}

/// Name of the cross-process lock guarding issuance for one domain
pub fn issuance_lock_name(issuer_key: &str, domain: &str) -> String {
    format!("{}/locks/issue_cert_{}", issuer_key, safe(domain))
}
