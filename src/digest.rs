//! Content digest handling.
//!
//! Digests are the cache key of the whole pipeline: a published App disk is
//! named after the hex portion of its image's manifest digest, and the blob
//! store addresses layer content by digest. Validation happens once at parse
//! time so the rest of the code can treat a digest as a safe path component.

use crate::error::{Error, Result};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// A validated content digest in `<algorithm>:<hex>` form.
///
/// Only lowercase hexadecimal digests of an allowlisted algorithm pass
/// validation, which makes the hex portion safe to embed in filenames
/// without further escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageDigest {
    raw: String,
    split: usize,
}

impl ImageDigest {
    /// Parses and validates a digest string.
    ///
    /// The algorithm must be `sha256`, `sha384`, or `sha512` and the hash
    /// part must be non-empty lowercase hex of the algorithm's length.
    pub fn parse(s: &str) -> Result<Self> {
        let Some((algo, hash)) = s.split_once(':') else {
            return Err(Error::InvalidDigest {
                digest: s.to_string(),
                reason: "missing ':' separator".to_string(),
            });
        };

        let expected_len = match algo {
            "sha256" => 64,
            "sha384" => 96,
            "sha512" => 128,
            _ => {
                return Err(Error::InvalidDigest {
                    digest: s.to_string(),
                    reason: format!("unsupported algorithm '{}'", algo),
                });
            }
        };

        if hash.len() != expected_len {
            return Err(Error::InvalidDigest {
                digest: s.to_string(),
                reason: format!("hash length {} != {}", hash.len(), expected_len),
            });
        }

        // SECURITY: The hex portion ends up in host filenames; reject anything
        // that is not plain lowercase hex.
        if !hash
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(Error::InvalidDigest {
                digest: s.to_string(),
                reason: "hash contains non-hex characters".to_string(),
            });
        }

        Ok(Self {
            raw: s.to_string(),
            split: algo.len(),
        })
    }

    /// Computes the sha256 digest of the given bytes.
    pub fn sha256(data: &[u8]) -> Self {
        let hash = hex::encode(Sha256::digest(data));
        Self {
            split: "sha256".len(),
            raw: format!("sha256:{}", hash),
        }
    }

    /// The digest algorithm (e.g. `sha256`).
    pub fn algorithm(&self) -> &str {
        &self.raw[..self.split]
    }

    /// The hex portion, used as the artifact filename stem.
    pub fn hex(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    /// The full `<algorithm>:<hex>` string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
