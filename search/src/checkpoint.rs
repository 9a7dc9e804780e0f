//! Checkpoint wire format: types, constants, and errors.
//!
//! A checkpoint is a self-validating binary snapshot of one session: every
//! node, the frontier ordering, the dedup aliases, and the budget counters.
//!
//! # Wire format
//!
//! ```text
//! [magic:4 "PTCK"][version:u16le=1][header_len:u32le][header: canonical JSON]
//! [node record]*[frontier record]*[alias record]*
//! [footer: record_count:u64le | final_chain_hash:32 | footer_magic:4 "KCTP"]
//! ```
//!
//! Records are framed as `[len:u32le][type:u8][body...]`, where `len` counts
//! the type byte and body. The chain is seeded with
//! `h0 = sha256(Checkpoint || header)` and advanced per frame with
//! `h_i = sha256(CheckpointChain || h_{i-1} || frame)`, so truncation or a
//! partially written file never validates.
//!
//! Node body: `id:32 | parent_flag:u8 [parent:32] | depth:u32 | seq:u64 |
//! status:u8 | score_flag:u8 [score_bits:u64] | terminal:u8 | retries:u32 |
//! prune_reason:u8 | patch_len:u32 patch | meta_len:u32 meta_json`.
//!
//! Frontier body: `id:32 | priority_bits:u64 | seq:u64 | counted:u8 | leased:u8`.
//!
//! Alias body: `node:32 | parent:32`.

use std::fmt;

use patchtree_kernel::proof::hash::ContentHash;
use patchtree_kernel::proof::hash_domain::HashDomain;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SessionBudget;
use crate::frontier::FrontierRecord;
use crate::node::{NodeId, NodeStatus, SearchNode};
use crate::session::{SessionId, SessionState};
use crate::store::Alias;

/// File magic.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"PTCK";

/// Footer magic (reverse of the file magic; truncation sentinel).
pub const CHECKPOINT_FOOTER_MAGIC: [u8; 4] = *b"KCTP";

/// Wire format version. Readers reject anything else.
pub const CHECKPOINT_VERSION: u16 = 1;

/// `format` field of the header.
pub const CHECKPOINT_FORMAT: &str = "patchtree.checkpoint.v1";

/// `u64` record count + 32-byte chain hash + 4-byte magic.
pub const FOOTER_SIZE: usize = 8 + 32 + 4;

/// Chain seed domain: `h0 = sha256(DOMAIN_CHECKPOINT || header_bytes)`.
pub const DOMAIN_CHECKPOINT: HashDomain = HashDomain::Checkpoint;

/// Chain step domain: `h_i = sha256(DOMAIN_CHECKPOINT_CHAIN || h_{i-1} || frame)`.
pub const DOMAIN_CHECKPOINT_CHAIN: HashDomain = HashDomain::CheckpointChain;

pub const RECORD_TYPE_NODE: u8 = 1;
pub const RECORD_TYPE_FRONTIER: u8 = 2;
pub const RECORD_TYPE_ALIAS: u8 = 3;

/// Addresses one checkpoint in a [`crate::checkpoint_store::CheckpointStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId {
    pub session: SessionId,
    /// Per-session sequence number, increasing.
    pub seq: u64,
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.seq)
    }
}

/// Checkpoint header, stored as canonical JSON.
///
/// Every number is an integer; durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointHeader {
    pub format: String,
    pub session: SessionId,
    pub seq: u64,
    pub problem_reference: String,
    pub problem_description: String,
    pub problem_digest: ContentHash,
    pub created_at_ms: u64,
    /// Session state at capture time.
    pub state: SessionState,
    pub budget: SessionBudget,
    pub nodes_consumed: u64,
    pub elapsed_ms: u64,
    pub node_count: u64,
    pub frontier_count: u64,
    pub alias_count: u64,
}

impl CheckpointHeader {
    #[must_use]
    pub fn id(&self) -> CheckpointId {
        CheckpointId {
            session: self.session,
            seq: self.seq,
        }
    }
}

/// Decoded (or to-be-encoded) checkpoint contents.
#[derive(Debug, Clone)]
pub struct CheckpointImage {
    pub header: CheckpointHeader,
    /// Nodes in creation order; the root first.
    pub nodes: Vec<SearchNode>,
    /// Queued entries in pop order, then entries captured mid-flight.
    pub frontier: Vec<FrontierRecord>,
    pub aliases: Vec<Alias>,
}

/// Output of [`crate::checkpoint_writer::CheckpointWriter::finish`].
#[derive(Debug, Clone)]
pub struct CheckpointOutput {
    pub bytes: Vec<u8>,
    pub final_chain_hash: ContentHash,
    pub record_count: u64,
}

/// Encoding failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointWriteError {
    #[error("header is not canonical JSON: {0}")]
    Header(String),

    #[error("metadata of node {node} is not canonical JSON")]
    Metadata { node: NodeId },

    #[error("{field} is {len} bytes, beyond the u32 frame limit")]
    FieldTooLarge { field: &'static str, len: usize },
}

/// Fail-closed decoding failure. One variant per violated rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointParseError {
    // --- Framing ---
    #[error("too short for a checkpoint")]
    TooShort,
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {got}")]
    UnsupportedVersion { got: u16 },
    #[error("header truncated")]
    HeaderTruncated,
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("header format {0:?} not recognised")]
    UnknownFormat(String),
    #[error("record {record_index} truncated")]
    RecordTruncated { record_index: u64 },
    #[error("record {record_index} has unknown type {tag}")]
    UnknownRecordType { tag: u8, record_index: u64 },
    #[error("record {record_index} has unknown {field} tag {tag}")]
    UnknownEnumTag {
        field: &'static str,
        tag: u8,
        record_index: u64,
    },
    #[error("record {record_index} has invalid {field} flag {flag}")]
    InvalidFlag {
        field: &'static str,
        flag: u8,
        record_index: u64,
    },
    #[error("record {record_index} body truncated reading {detail}")]
    RecordBodyTruncated {
        record_index: u64,
        detail: &'static str,
    },
    #[error("record {record_index} left {remaining} bytes unread")]
    FrameBodyNotFullyConsumed { record_index: u64, remaining: usize },
    #[error("record {record_index} is out of section order")]
    RecordOutOfOrder { record_index: u64 },
    #[error("record {record_index} metadata is not a string map")]
    InvalidMetadata { record_index: u64 },
    #[error("bad footer magic")]
    BadFooterMagic,
    #[error("footer counts {expected} records, found {actual}")]
    RecordCountMismatch { expected: u64, actual: u64 },
    #[error("chain hash mismatch")]
    ChainHashMismatch,
    #[error("{excess} trailing bytes after footer")]
    TrailingBytes { excess: usize },

    // --- Header/content agreement ---
    #[error("header declares {declared} {kind} records, found {actual}")]
    SectionCountMismatch {
        kind: &'static str,
        declared: u64,
        actual: u64,
    },
    #[error("checkpoint is {actual}, expected {expected}")]
    IdentityMismatch {
        expected: CheckpointId,
        actual: CheckpointId,
    },

    // --- Tree invariants ---
    #[error("no root node")]
    MissingRoot,
    #[error("root {node} is not the first node")]
    RootNotFirst { node: NodeId },
    #[error("duplicate node {node}")]
    DuplicateNode { node: NodeId },
    #[error("node {node} id does not match its patch content")]
    IdMismatch { node: NodeId },
    #[error("node {node} references parent {parent} that precedes no record")]
    DanglingParent { node: NodeId, parent: NodeId },
    #[error("node {node} has depth {actual}, expected {expected}")]
    DepthMismatch {
        node: NodeId,
        expected: u32,
        actual: u32,
    },
    #[error("node {node} breaks creation order")]
    NonMonotonicSeq { node: NodeId },
    #[error("node {node} is {status} without a score")]
    MissingScore { node: NodeId, status: NodeStatus },
    #[error("node {node} is {status} but carries a score")]
    UnexpectedScore { node: NodeId, status: NodeStatus },
    #[error("node {node} prune reason does not match status {status}")]
    PruneReasonMismatch { node: NodeId, status: NodeStatus },

    // --- Frontier invariants ---
    #[error("frontier entry references unknown node {node}")]
    DanglingFrontierRef { node: NodeId },
    #[error("duplicate frontier entry for {node}")]
    DuplicateFrontierEntry { node: NodeId },
    #[error("frontier entry for {node} disagrees with node status {status}")]
    FrontierStatusMismatch { node: NodeId, status: NodeStatus },
    #[error("frontier entry for {node} has sequence {entry}, node has {node_seq}")]
    FrontierSeqMismatch {
        node: NodeId,
        entry: u64,
        node_seq: u64,
    },
    #[error("frontier entry for {node} has a non-finite priority")]
    NonFinitePriority { node: NodeId },
    #[error("pending node {node} has no frontier entry")]
    PendingWithoutEntry { node: NodeId },
    #[error("scoring node {node} has no leased frontier entry")]
    ScoringWithoutLease { node: NodeId },

    // --- Dedup invariants ---
    #[error("alias {node} <- {parent} references an unknown node")]
    DanglingAlias { node: NodeId, parent: NodeId },
}
