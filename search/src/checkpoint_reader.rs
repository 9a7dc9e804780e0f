//! `CheckpointReader`: fail-closed decoding with chain verification.
//!
//! Parses checkpoint bytes into a [`CheckpointImage`] and checks every
//! structural rule the engine relies on after a restore. Any violation is a
//! typed [`CheckpointParseError`]; nothing is partially restored.

use std::collections::{BTreeMap, HashMap, HashSet};

use patchtree_kernel::carrier::patch::Patch;
use patchtree_kernel::proof::hash::{canonical_hash, hash_parts, ContentHash};

use crate::checkpoint::{
    CheckpointHeader, CheckpointId, CheckpointImage, CheckpointParseError, CHECKPOINT_FOOTER_MAGIC,
    CHECKPOINT_FORMAT, CHECKPOINT_MAGIC, CHECKPOINT_VERSION, DOMAIN_CHECKPOINT,
    DOMAIN_CHECKPOINT_CHAIN, FOOTER_SIZE, RECORD_TYPE_ALIAS, RECORD_TYPE_FRONTIER,
    RECORD_TYPE_NODE,
};
use crate::frontier::FrontierRecord;
use crate::node::{NodeId, NodeStatus, SearchNode, Terminality};
use crate::pruner::PruneReason;
use crate::store::Alias;

/// Decode a checkpoint and confirm it is the one that was asked for.
///
/// # Errors
///
/// Everything [`decode_checkpoint`] rejects, plus
/// [`CheckpointParseError::IdentityMismatch`] when the header names a
/// different session or sequence number than `expected`.
pub fn read_checkpoint(
    expected: CheckpointId,
    bytes: &[u8],
) -> Result<CheckpointImage, CheckpointParseError> {
    let image = decode_checkpoint(bytes)?;
    let actual = image.header.id();
    if actual != expected {
        return Err(CheckpointParseError::IdentityMismatch { expected, actual });
    }
    Ok(image)
}

/// Parse a complete checkpoint, verifying framing, chain and invariants.
///
/// Child lists of the returned nodes are rebuilt from parent links.
///
/// # Errors
///
/// Returns [`CheckpointParseError`] on any structural or integrity violation.
pub fn decode_checkpoint(bytes: &[u8]) -> Result<CheckpointImage, CheckpointParseError> {
    // magic(4) + version(2) + header_len(4) + footer
    if bytes.len() < 4 + 2 + 4 + FOOTER_SIZE {
        return Err(CheckpointParseError::TooShort);
    }

    let mut cursor = Cursor::new(bytes);

    let magic = cursor
        .read_bytes(4)
        .map_err(|()| CheckpointParseError::TooShort)?;
    if magic != CHECKPOINT_MAGIC {
        return Err(CheckpointParseError::BadMagic);
    }

    let version = cursor
        .read_u16()
        .map_err(|()| CheckpointParseError::TooShort)?;
    if version != CHECKPOINT_VERSION {
        return Err(CheckpointParseError::UnsupportedVersion { got: version });
    }

    let header_len = cursor
        .read_u32()
        .map_err(|()| CheckpointParseError::TooShort)? as usize;
    if cursor.remaining() < header_len.saturating_add(FOOTER_SIZE) {
        return Err(CheckpointParseError::HeaderTruncated);
    }
    let header_bytes = cursor
        .read_bytes(header_len)
        .map_err(|()| CheckpointParseError::HeaderTruncated)?;
    let header: CheckpointHeader = serde_json::from_slice(header_bytes)
        .map_err(|e| CheckpointParseError::InvalidHeader(e.to_string()))?;
    if header.format != CHECKPOINT_FORMAT {
        return Err(CheckpointParseError::UnknownFormat(header.format));
    }

    let mut chain_hash = canonical_hash(DOMAIN_CHECKPOINT, header_bytes);

    let footer_start = bytes.len() - FOOTER_SIZE;
    let mut nodes = Vec::new();
    let mut frontier = Vec::new();
    let mut aliases = Vec::new();
    let mut record_index: u64 = 0;
    let mut last_type = RECORD_TYPE_NODE;

    while cursor.pos < footer_start {
        let frame_start = cursor.pos;
        let frame_len = cursor
            .read_u32()
            .map_err(|()| CheckpointParseError::RecordTruncated { record_index })?
            as usize;
        if cursor.pos + frame_len > footer_start {
            return Err(CheckpointParseError::RecordTruncated { record_index });
        }

        // Bounded sub-cursor so record parsers cannot over-read into the next frame.
        let mut frame = Cursor::new(&bytes[cursor.pos..cursor.pos + frame_len]);
        cursor.pos += frame_len;

        let record_type = frame
            .read_u8()
            .map_err(|()| CheckpointParseError::RecordTruncated { record_index })?;
        if !matches!(
            record_type,
            RECORD_TYPE_NODE | RECORD_TYPE_FRONTIER | RECORD_TYPE_ALIAS
        ) {
            return Err(CheckpointParseError::UnknownRecordType {
                tag: record_type,
                record_index,
            });
        }
        if record_type < last_type {
            return Err(CheckpointParseError::RecordOutOfOrder { record_index });
        }
        last_type = record_type;

        match record_type {
            RECORD_TYPE_NODE => nodes.push(parse_node(&mut frame, record_index)?),
            RECORD_TYPE_FRONTIER => frontier.push(parse_frontier(&mut frame, record_index)?),
            _ => aliases.push(parse_alias(&mut frame, record_index)?),
        }

        if frame.remaining() > 0 {
            return Err(CheckpointParseError::FrameBodyNotFullyConsumed {
                record_index,
                remaining: frame.remaining(),
            });
        }

        chain_hash = hash_parts(
            DOMAIN_CHECKPOINT_CHAIN,
            &[chain_hash.as_bytes(), &bytes[frame_start..cursor.pos]],
        );
        record_index += 1;
    }

    let footer_count = cursor
        .read_u64()
        .map_err(|()| CheckpointParseError::BadFooterMagic)?;
    let footer_hash = cursor
        .read_bytes(32)
        .map_err(|()| CheckpointParseError::BadFooterMagic)?;
    let footer_magic = cursor
        .read_bytes(4)
        .map_err(|()| CheckpointParseError::BadFooterMagic)?;
    if footer_magic != CHECKPOINT_FOOTER_MAGIC {
        return Err(CheckpointParseError::BadFooterMagic);
    }
    if cursor.remaining() > 0 {
        return Err(CheckpointParseError::TrailingBytes {
            excess: cursor.remaining(),
        });
    }
    if footer_count != record_index {
        return Err(CheckpointParseError::RecordCountMismatch {
            expected: footer_count,
            actual: record_index,
        });
    }
    if chain_hash.as_bytes().as_slice() != footer_hash {
        return Err(CheckpointParseError::ChainHashMismatch);
    }

    check_count("node", header.node_count, nodes.len())?;
    check_count("frontier", header.frontier_count, frontier.len())?;
    check_count("alias", header.alias_count, aliases.len())?;

    validate_tree(&mut nodes)?;
    validate_frontier(&nodes, &frontier)?;
    validate_aliases(&nodes, &aliases)?;

    Ok(CheckpointImage {
        header,
        nodes,
        frontier,
        aliases,
    })
}

fn check_count(kind: &'static str, declared: u64, actual: usize) -> Result<(), CheckpointParseError> {
    let actual = actual as u64;
    if declared == actual {
        Ok(())
    } else {
        Err(CheckpointParseError::SectionCountMismatch {
            kind,
            declared,
            actual,
        })
    }
}

// ---------------------------------------------------------------------------
// Record bodies
// ---------------------------------------------------------------------------

fn parse_node(cursor: &mut Cursor<'_>, record_index: u64) -> Result<SearchNode, CheckpointParseError> {
    let truncated = |detail| CheckpointParseError::RecordBodyTruncated {
        record_index,
        detail,
    };

    let id = read_node_id(cursor).map_err(|()| truncated("id"))?;
    let parent = match cursor.read_u8().map_err(|()| truncated("parent flag"))? {
        0 => None,
        1 => Some(read_node_id(cursor).map_err(|()| truncated("parent"))?),
        flag => {
            return Err(CheckpointParseError::InvalidFlag {
                field: "parent",
                flag,
                record_index,
            })
        }
    };
    let depth = cursor.read_u32().map_err(|()| truncated("depth"))?;
    let seq = cursor.read_u64().map_err(|()| truncated("seq"))?;

    let status_tag = cursor.read_u8().map_err(|()| truncated("status"))?;
    let status = NodeStatus::from_tag(status_tag).ok_or(CheckpointParseError::UnknownEnumTag {
        field: "status",
        tag: status_tag,
        record_index,
    })?;

    let score = match cursor.read_u8().map_err(|()| truncated("score flag"))? {
        0 => None,
        1 => Some(f64::from_bits(
            cursor.read_u64().map_err(|()| truncated("score"))?,
        )),
        flag => {
            return Err(CheckpointParseError::InvalidFlag {
                field: "score",
                flag,
                record_index,
            })
        }
    };

    let terminal_tag = cursor.read_u8().map_err(|()| truncated("terminal"))?;
    let terminal =
        Terminality::from_tag(terminal_tag).ok_or(CheckpointParseError::UnknownEnumTag {
            field: "terminal",
            tag: terminal_tag,
            record_index,
        })?;

    let retries = cursor.read_u32().map_err(|()| truncated("retries"))?;

    let prune_reason = match cursor.read_u8().map_err(|()| truncated("prune reason"))? {
        0 => None,
        tag => Some(
            PruneReason::from_tag(tag).ok_or(CheckpointParseError::UnknownEnumTag {
                field: "prune reason",
                tag,
                record_index,
            })?,
        ),
    };

    let patch_len = cursor.read_u32().map_err(|()| truncated("patch length"))? as usize;
    let body = cursor
        .read_bytes(patch_len)
        .map_err(|()| truncated("patch"))?;
    let meta_len = cursor
        .read_u32()
        .map_err(|()| truncated("metadata length"))? as usize;
    let meta_bytes = cursor
        .read_bytes(meta_len)
        .map_err(|()| truncated("metadata"))?;
    let metadata: BTreeMap<String, String> = serde_json::from_slice(meta_bytes)
        .map_err(|_| CheckpointParseError::InvalidMetadata { record_index })?;

    Ok(SearchNode {
        id,
        parent,
        depth,
        patch: Patch::with_metadata(body.to_vec(), metadata),
        seq,
        status,
        score,
        terminal,
        claim: None,
        retries,
        prune_reason,
        children: Vec::new(),
    })
}

fn parse_frontier(
    cursor: &mut Cursor<'_>,
    record_index: u64,
) -> Result<FrontierRecord, CheckpointParseError> {
    let truncated = |detail| CheckpointParseError::RecordBodyTruncated {
        record_index,
        detail,
    };
    let node = read_node_id(cursor).map_err(|()| truncated("id"))?;
    let priority = f64::from_bits(cursor.read_u64().map_err(|()| truncated("priority"))?);
    let seq = cursor.read_u64().map_err(|()| truncated("seq"))?;
    let counted = read_bool(cursor, "counted", record_index)?;
    let leased = read_bool(cursor, "leased", record_index)?;
    Ok(FrontierRecord {
        node,
        priority,
        seq,
        counted,
        leased,
    })
}

fn parse_alias(cursor: &mut Cursor<'_>, record_index: u64) -> Result<Alias, CheckpointParseError> {
    let truncated = |detail| CheckpointParseError::RecordBodyTruncated {
        record_index,
        detail,
    };
    let node = read_node_id(cursor).map_err(|()| truncated("node"))?;
    let parent = read_node_id(cursor).map_err(|()| truncated("parent"))?;
    Ok(Alias { node, parent })
}

fn read_node_id(cursor: &mut Cursor<'_>) -> Result<NodeId, ()> {
    let mut raw = [0u8; 32];
    raw.copy_from_slice(cursor.read_bytes(32)?);
    Ok(NodeId::from_digest(ContentHash::from_raw(raw)))
}

fn read_bool(
    cursor: &mut Cursor<'_>,
    field: &'static str,
    record_index: u64,
) -> Result<bool, CheckpointParseError> {
    match cursor
        .read_u8()
        .map_err(|()| CheckpointParseError::RecordBodyTruncated {
            record_index,
            detail: field,
        })? {
        0 => Ok(false),
        1 => Ok(true),
        flag => Err(CheckpointParseError::InvalidFlag {
            field,
            flag,
            record_index,
        }),
    }
}

// ---------------------------------------------------------------------------
// Structural invariants
// ---------------------------------------------------------------------------

fn validate_tree(nodes: &mut [SearchNode]) -> Result<(), CheckpointParseError> {
    let first = nodes.first().ok_or(CheckpointParseError::MissingRoot)?;
    if first.parent.is_some() {
        return Err(CheckpointParseError::MissingRoot);
    }
    if first.depth != 0 {
        return Err(CheckpointParseError::DepthMismatch {
            node: first.id,
            expected: 0,
            actual: first.depth,
        });
    }

    let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(nodes.len());
    let mut last_seq: Option<u64> = None;

    for i in 0..nodes.len() {
        let node = &nodes[i];
        let id = node.id;

        if index.contains_key(&id) {
            return Err(CheckpointParseError::DuplicateNode { node: id });
        }
        if NodeId::for_patch(&node.patch) != id {
            return Err(CheckpointParseError::IdMismatch { node: id });
        }
        if last_seq.is_some_and(|prev| node.seq <= prev) {
            return Err(CheckpointParseError::NonMonotonicSeq { node: id });
        }
        last_seq = Some(node.seq);
        check_score(node)?;
        if (node.status == NodeStatus::Pruned) != node.prune_reason.is_some() {
            return Err(CheckpointParseError::PruneReasonMismatch {
                node: id,
                status: node.status,
            });
        }

        if let Some(parent) = node.parent {
            if i == 0 {
                return Err(CheckpointParseError::MissingRoot);
            }
            let parent_idx = *index
                .get(&parent)
                .ok_or(CheckpointParseError::DanglingParent { node: id, parent })?;
            let expected = nodes[parent_idx].depth + 1;
            if node.depth != expected {
                return Err(CheckpointParseError::DepthMismatch {
                    node: id,
                    expected,
                    actual: node.depth,
                });
            }
            nodes[parent_idx].children.push(id);
        } else if i > 0 {
            return Err(CheckpointParseError::RootNotFirst { node: id });
        }

        index.insert(id, i);
    }
    Ok(())
}

/// Scores appear exactly where the lifecycle can have produced one.
///
/// `terminal-failure` may lack a score (retry limit reached); `pruned` and
/// `expired` may or may not carry one depending on when they were closed.
fn check_score(node: &SearchNode) -> Result<(), CheckpointParseError> {
    match node.status {
        NodeStatus::Pending | NodeStatus::Scoring if node.score.is_some() => {
            Err(CheckpointParseError::UnexpectedScore {
                node: node.id,
                status: node.status,
            })
        }
        NodeStatus::Expandable | NodeStatus::TerminalSuccess if node.score.is_none() => {
            Err(CheckpointParseError::MissingScore {
                node: node.id,
                status: node.status,
            })
        }
        _ => Ok(()),
    }
}

fn validate_frontier(
    nodes: &[SearchNode],
    frontier: &[FrontierRecord],
) -> Result<(), CheckpointParseError> {
    let by_id: HashMap<NodeId, &SearchNode> = nodes.iter().map(|n| (n.id, n)).collect();
    let mut seen: HashSet<NodeId> = HashSet::with_capacity(frontier.len());

    for entry in frontier {
        let node = *by_id
            .get(&entry.node)
            .ok_or(CheckpointParseError::DanglingFrontierRef { node: entry.node })?;
        if !seen.insert(entry.node) {
            return Err(CheckpointParseError::DuplicateFrontierEntry { node: entry.node });
        }
        if !entry.priority.is_finite() {
            return Err(CheckpointParseError::NonFinitePriority { node: entry.node });
        }
        if entry.seq != node.seq {
            return Err(CheckpointParseError::FrontierSeqMismatch {
                node: entry.node,
                entry: entry.seq,
                node_seq: node.seq,
            });
        }
        let expected = if entry.leased {
            NodeStatus::Scoring
        } else {
            NodeStatus::Pending
        };
        if node.status != expected {
            return Err(CheckpointParseError::FrontierStatusMismatch {
                node: entry.node,
                status: node.status,
            });
        }
    }

    for node in nodes {
        if seen.contains(&node.id) {
            continue;
        }
        match node.status {
            NodeStatus::Pending => {
                return Err(CheckpointParseError::PendingWithoutEntry { node: node.id })
            }
            NodeStatus::Scoring => {
                return Err(CheckpointParseError::ScoringWithoutLease { node: node.id })
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_aliases(nodes: &[SearchNode], aliases: &[Alias]) -> Result<(), CheckpointParseError> {
    let ids: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
    for alias in aliases {
        if !ids.contains(&alias.node) || !ids.contains(&alias.parent) {
            return Err(CheckpointParseError::DanglingAlias {
                node: alias.node,
                parent: alias.parent,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Cursor helper
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ()> {
        if n > self.remaining() {
            return Err(());
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ()> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, ()> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ()> {
        self.read_array().map(u16::from_le_bytes)
    }

    fn read_u32(&mut self) -> Result<u32, ()> {
        self.read_array().map(u32::from_le_bytes)
    }

    fn read_u64(&mut self) -> Result<u64, ()> {
        self.read_array().map(u64::from_le_bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
