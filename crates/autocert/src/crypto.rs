//! Certificate and key material helpers
//!
//! PEM/DER conversions, chain hashing, and validity/SAN extraction used by
//! the cache, the resolver, and the lifecycle engine.

use std::io::BufReader;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{parse_x509_certificate, X509Certificate};

use crate::error::{Error, Result};

/// Compute the SHA-256 hex digest of a DER certificate chain.
///
/// This is the primary key of the certificate cache; identical chains hash
/// identically regardless of the PEM framing they arrived in.
pub fn hash_certificate_chain(chain: &[CertificateDer<'_>]) -> String {
    let mut hasher = Sha256::new();
    for cert in chain {
        hasher.update(cert.as_ref());
    }
    hex::encode(hasher.finalize())
}

/// Parse a PEM bundle into DER certificates
pub fn parse_certificate_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Internal(format!("failed to parse certificate PEM: {e}")))?;

    if certs.is_empty() {
        return Err(Error::Internal("no certificates found in PEM".to_string()));
    }
    Ok(certs)
}

/// Parse a PEM-encoded private key in PKCS#1, PKCS#8, or SEC1 format
pub fn parse_private_key_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Ok(Some(_)) => {
                // skip non-key items such as interleaved certificates
                continue;
            }
            Ok(None) => {
                return Err(Error::Internal("no private key found in PEM".to_string()));
            }
            Err(e) => {
                return Err(Error::Internal(format!(
                    "failed to parse private key PEM: {e}"
                )));
            }
        }
    }
}

/// Build a rustls [`CertifiedKey`] from a DER chain and a private key
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| Error::Internal(format!("failed to create signing key: {e}")))?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Build a rustls [`CertifiedKey`] straight from PEM material
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<Arc<CertifiedKey>> {
    let chain = parse_certificate_pem(cert_pem)?;
    let key = parse_private_key_pem(key_pem)?;
    certified_key(chain, key)
}

/// Generate a fresh ECDSA P-256 key pair for a certificate
pub fn generate_private_key() -> Result<rcgen::KeyPair> {
    rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Internal(format!("failed to generate key pair: {e}")))
}

/// Serialize a key pair as PKCS#8 PEM
pub fn encode_private_key(key: &rcgen::KeyPair) -> String {
    key.serialize_pem()
}

/// Parse a PKCS#8/SEC1 PEM back into a key pair
pub fn decode_private_key(pem: &str) -> Result<rcgen::KeyPair> {
    rcgen::KeyPair::from_pem(pem)
        .map_err(|e| Error::Internal(format!("failed to decode private key PEM: {e}")))
}

/// Validity window of the leaf certificate in a DER chain
pub fn leaf_validity(chain: &[CertificateDer<'_>]) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let leaf = parse_leaf(chain)?;
    let validity = leaf.validity();

    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| Error::Internal("invalid not_before timestamp".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| Error::Internal("invalid not_after timestamp".to_string()))?;

    Ok((not_before, not_after))
}

/// DNS subject alternative names of the leaf certificate, lowercased
pub fn leaf_sans(chain: &[CertificateDer<'_>]) -> Result<Vec<String>> {
    let leaf = parse_leaf(chain)?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = leaf.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = general_name {
                names.push(dns.to_lowercase());
            }
        }
    }
    Ok(names)
}

fn parse_leaf<'a>(chain: &'a [CertificateDer<'_>]) -> Result<X509Certificate<'a>> {
    let leaf_der = chain
        .first()
        .ok_or_else(|| Error::Internal("empty certificate chain".to_string()))?;
    let (_, cert) = parse_x509_certificate(leaf_der.as_ref())
        .map_err(|e| Error::Internal(format!("failed to parse X.509 certificate: {e}")))?;
    Ok(cert)
}

/// Check that the leaf certificate's public key matches the private key.
///
/// Catches corrupted or mismatched stored resources before they are cached.
pub fn key_matches_leaf(chain: &[CertificateDer<'_>], key_pem: &str) -> Result<bool> {
    let leaf = parse_leaf(chain)?;
    let leaf_spki = leaf.public_key().raw;

    let key = decode_private_key(key_pem)?;
    let key_spki = key.public_key_der();

    Ok(leaf_spki == key_spki.as_slice())
}
