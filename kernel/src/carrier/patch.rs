//! `Patch`: the opaque candidate-fix payload.
//!
//! The engine never interprets patch bytes. It only needs a stable content
//! digest (for node identity and deduplication) and cheap clones (patches
//! are handed to generator and evaluator calls while the node store keeps
//! its own copy).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::proof::canon::canonical_json_bytes;
use crate::proof::hash::{hash_parts, ContentHash};
use crate::proof::hash_domain::HashDomain;

/// An immutable patch payload plus string metadata.
///
/// Metadata is a sorted string map (e.g. `"generator" => "llm-7"`,
/// `"files" => "src/lib.rs"`); it participates in the content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    bytes: Arc<[u8]>,
    metadata: BTreeMap<String, String>,
}

impl Patch {
    /// Construct a patch from raw bytes with no metadata.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
            metadata: BTreeMap::new(),
        }
    }

    /// Construct a patch from raw bytes and metadata.
    #[must_use]
    pub fn with_metadata(bytes: impl Into<Vec<u8>>, metadata: BTreeMap<String, String>) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
            metadata,
        }
    }

    /// Builder-style metadata insertion.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The patch body.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The patch body as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Patch metadata in key order.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Canonical JSON bytes of the metadata map.
    #[must_use]
    pub fn metadata_json(&self) -> Vec<u8> {
        let value = serde_json::Value::Object(
            self.metadata
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        );
        // A string-only map has no numbers, so canonicalization cannot fail.
        canonical_json_bytes(&value).unwrap_or_default()
    }

    /// Content digest: `sha256(PatchContent || len(bytes) || bytes || metadata_json)`.
    ///
    /// The length prefix keeps `(bytes, metadata)` splits unambiguous.
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        let len = (self.bytes.len() as u64).to_le_bytes();
        hash_parts(
            HashDomain::PatchContent,
            &[&len, &self.bytes, &self.metadata_json()],
        )
    }
}

impl From<&str> for Patch {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}
