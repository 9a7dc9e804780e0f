//! Canonical hashing.
//!
//! **Exactly one place defines canonical hashing.** Every digest in the
//! workspace (patch identity, problem references, checkpoint chains) is
//! `sha256(domain_bytes || data...)` computed here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use super::hash_domain::HashDomain;

/// Algorithm tag used in the textual form.
pub const HASH_ALGORITHM: &str = "sha256";

/// A SHA-256 content digest.
///
/// Textual form is `"sha256:<64 lowercase hex>"`. The raw form is 32 bytes,
/// which keeps the type `Copy` and cheap to use as a map key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Wrap a raw 32-byte digest.
    #[must_use]
    pub const fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from `"sha256:<hex>"` format.
    ///
    /// Returns `None` for any other algorithm, a missing separator, or a
    /// digest that is not 64 hex characters.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (algorithm, digest) = s.split_once(':')?;
        if algorithm != HASH_ALGORITHM {
            return None;
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(digest, &mut out).ok()?;
        Some(Self(out))
    }

    /// The raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The lowercase hex digest without the algorithm prefix.
    #[must_use]
    pub fn hex_digest(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log fields.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HASH_ALGORITHM}:{}", self.hex_digest())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl FromStr for ContentHash {
    type Err = InvalidContentHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidContentHash(s.to_string()))
    }
}

/// A string that is not a valid `"sha256:<hex>"` digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidContentHash(pub String);

impl fmt::Display for InvalidContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid content hash: {:?}", self.0)
    }
}

impl std::error::Error for InvalidContentHash {}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute the canonical hash of a byte slice with domain separation.
#[must_use]
pub fn canonical_hash(domain: HashDomain, data: &[u8]) -> ContentHash {
    hash_parts(domain, &[data])
}

/// Compute `sha256(domain || parts[0] || parts[1] || ...)`.
///
/// Used where the hashed input is naturally split (chain links hash the
/// previous link and the next frame without concatenating them first).
#[must_use]
pub fn hash_parts(domain: HashDomain, parts: &[&[u8]]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    ContentHash(out)
}
