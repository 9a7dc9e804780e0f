//! `CheckpointWriter`: framed, hash-chained checkpoint encoding.

use patchtree_kernel::proof::canon::to_canonical_json;
use patchtree_kernel::proof::hash::{canonical_hash, hash_parts, ContentHash};

use crate::checkpoint::{
    CheckpointImage, CheckpointOutput, CheckpointWriteError, CHECKPOINT_FOOTER_MAGIC,
    CHECKPOINT_MAGIC, CHECKPOINT_VERSION, DOMAIN_CHECKPOINT, DOMAIN_CHECKPOINT_CHAIN, FOOTER_SIZE,
    RECORD_TYPE_ALIAS, RECORD_TYPE_FRONTIER, RECORD_TYPE_NODE,
};
use crate::frontier::FrontierRecord;
use crate::node::SearchNode;
use crate::store::Alias;

/// Encode a full image.
///
/// The header's section counts are overwritten with the actual lengths, so
/// callers do not need to keep them in sync.
///
/// # Errors
///
/// Returns [`CheckpointWriteError`] if the header cannot be canonicalized or
/// a field exceeds the frame size limit.
pub fn encode_checkpoint(image: &CheckpointImage) -> Result<Vec<u8>, CheckpointWriteError> {
    let mut header = image.header.clone();
    header.node_count = image.nodes.len() as u64;
    header.frontier_count = image.frontier.len() as u64;
    header.alias_count = image.aliases.len() as u64;
    let header_bytes =
        to_canonical_json(&header).map_err(|e| CheckpointWriteError::Header(e.to_string()))?;

    let mut writer = CheckpointWriter::new(&header_bytes)?;
    for node in &image.nodes {
        writer.write_node(node)?;
    }
    for entry in &image.frontier {
        writer.write_frontier(entry);
    }
    for alias in &image.aliases {
        writer.write_alias(alias);
    }
    Ok(writer.finish().bytes)
}

/// Streaming writer over an in-memory buffer.
pub struct CheckpointWriter {
    buf: Vec<u8>,
    chain_hash: ContentHash,
    record_count: u64,
    /// Record body under construction. `buf` is untouched until the body is complete.
    scratch: Vec<u8>,
}

impl CheckpointWriter {
    /// Write magic, version and header, and seed the chain.
    ///
    /// # Errors
    ///
    /// [`CheckpointWriteError::FieldTooLarge`] if the header exceeds `u32::MAX` bytes.
    pub fn new(header_json_bytes: &[u8]) -> Result<Self, CheckpointWriteError> {
        let header_len = u32_len("header", header_json_bytes.len())?;
        let mut buf = Vec::with_capacity(10 + header_json_bytes.len() + 4096);
        buf.extend_from_slice(&CHECKPOINT_MAGIC);
        buf.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        buf.extend_from_slice(&header_len.to_le_bytes());
        buf.extend_from_slice(header_json_bytes);

        Ok(Self {
            buf,
            chain_hash: canonical_hash(DOMAIN_CHECKPOINT, header_json_bytes),
            record_count: 0,
            scratch: Vec::with_capacity(256),
        })
    }

    /// # Errors
    ///
    /// [`CheckpointWriteError::FieldTooLarge`] for an oversized patch or metadata.
    pub fn write_node(&mut self, node: &SearchNode) -> Result<(), CheckpointWriteError> {
        let patch = node.patch.bytes();
        let patch_len = u32_len("patch", patch.len())?;
        let meta = node.patch.metadata_json();
        let meta_len = u32_len("metadata", meta.len())?;

        self.scratch.clear();
        self.scratch.extend_from_slice(node.id.digest().as_bytes());
        match node.parent {
            Some(parent) => {
                self.scratch.push(1);
                self.scratch.extend_from_slice(parent.digest().as_bytes());
            }
            None => self.scratch.push(0),
        }
        self.scratch.extend_from_slice(&node.depth.to_le_bytes());
        self.scratch.extend_from_slice(&node.seq.to_le_bytes());
        self.scratch.push(node.status.tag());
        match node.score {
            Some(score) => {
                self.scratch.push(1);
                self.scratch.extend_from_slice(&score.to_bits().to_le_bytes());
            }
            None => self.scratch.push(0),
        }
        self.scratch.push(node.terminal.tag());
        self.scratch.extend_from_slice(&node.retries.to_le_bytes());
        self.scratch
            .push(node.prune_reason.map_or(0, |reason| reason.tag()));
        self.scratch.extend_from_slice(&patch_len.to_le_bytes());
        self.scratch.extend_from_slice(patch);
        self.scratch.extend_from_slice(&meta_len.to_le_bytes());
        self.scratch.extend_from_slice(&meta);

        self.commit_record(RECORD_TYPE_NODE);
        Ok(())
    }

    pub fn write_frontier(&mut self, entry: &FrontierRecord) {
        self.scratch.clear();
        self.scratch.extend_from_slice(entry.node.digest().as_bytes());
        self.scratch
            .extend_from_slice(&entry.priority.to_bits().to_le_bytes());
        self.scratch.extend_from_slice(&entry.seq.to_le_bytes());
        self.scratch.push(u8::from(entry.counted));
        self.scratch.push(u8::from(entry.leased));
        self.commit_record(RECORD_TYPE_FRONTIER);
    }

    pub fn write_alias(&mut self, alias: &Alias) {
        self.scratch.clear();
        self.scratch.extend_from_slice(alias.node.digest().as_bytes());
        self.scratch.extend_from_slice(alias.parent.digest().as_bytes());
        self.commit_record(RECORD_TYPE_ALIAS);
    }

    /// Write the footer and return the finished bytes.
    #[must_use]
    pub fn finish(mut self) -> CheckpointOutput {
        self.buf.reserve(FOOTER_SIZE);
        self.buf.extend_from_slice(&self.record_count.to_le_bytes());
        self.buf.extend_from_slice(self.chain_hash.as_bytes());
        self.buf.extend_from_slice(&CHECKPOINT_FOOTER_MAGIC);
        CheckpointOutput {
            bytes: self.buf,
            final_chain_hash: self.chain_hash,
            record_count: self.record_count,
        }
    }

    /// Frame the scratch body as `[len:u32le][type:u8][body]` and advance the chain.
    fn commit_record(&mut self, record_type: u8) {
        // Bodies are bounded by the u32 checks on their variable-length fields.
        #[allow(clippy::cast_possible_truncation)]
        let frame_len = (1 + self.scratch.len()) as u32;
        let frame_start = self.buf.len();
        self.buf.extend_from_slice(&frame_len.to_le_bytes());
        self.buf.push(record_type);
        self.buf.extend_from_slice(&self.scratch);

        self.chain_hash = hash_parts(
            DOMAIN_CHECKPOINT_CHAIN,
            &[self.chain_hash.as_bytes(), &self.buf[frame_start..]],
        );
        self.record_count += 1;
    }
}

fn u32_len(field: &'static str, len: usize) -> Result<u32, CheckpointWriteError> {
    u32::try_from(len).map_err(|_| CheckpointWriteError::FieldTooLarge { field, len })
}
