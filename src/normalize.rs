use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::provider::{ArtifactId, OwnerId};

/// One content chunk reference within a payload entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    /// Hex content hash of the chunk.
    pub sha: String,
    pub offset: u64,
    pub size: u64,
}

/// One path entry in a manifest payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub chunks: Vec<ChunkRef>,
}

/// Metadata stored alongside the normalized payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub owner: OwnerId,
    pub artifact: ArtifactId,
    /// Opaque public version id as reported by the provider.
    pub gid: String,
    pub created_at: DateTime<Utc>,
    /// CRC32 over the length-prefixed serialized entries (see [`checksum`]).
    pub checksum: u32,
}

/// A manifest version as persisted in an owner worktree, one file per
/// (artifact, version). Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestBlob {
    pub metadata: BlobMetadata,
    pub entries: Vec<FileEntry>,
}

/// Characters some provider payloads pad path names with.
const PATH_PADDING: &[char] = &['\0', ' ', '\n', '\t'];

/// Normalize payload entries in place: strip trailing padding from paths,
/// order chunk lists by content hash, order entries case-insensitively by
/// path. Normalization is idempotent.
pub fn normalize_entries(entries: &mut [FileEntry]) {
    for entry in entries.iter_mut() {
        let trimmed = entry.path.trim_end_matches(PATH_PADDING);
        if trimmed.len() != entry.path.len() {
            entry.path = trimmed.to_string();
        }
        entry.chunks.sort_by(|a, b| a.sha.cmp(&b.sha));
    }
    entries.sort_by_key(|entry| entry.path.to_lowercase());
}

/// Integrity checksum over the serialized payload: CRC32 of the compact
/// JSON encoding of the entries, prefixed with its length as a little-endian
/// u32 — so a truncated payload never checksums clean.
pub fn checksum(entries: &[FileEntry]) -> Result<u32> {
    let buffer = serde_json::to_vec(entries).context("serializing payload entries")?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(buffer.len() as u32).to_le_bytes());
    hasher.update(&buffer);
    Ok(hasher.finalize())
}

impl ManifestBlob {
    /// Build a blob from a raw fetched payload: normalize the entries and
    /// stamp the metadata with the recomputed checksum.
    pub fn build(
        owner: OwnerId,
        artifact: ArtifactId,
        gid: impl Into<String>,
        created_at: DateTime<Utc>,
        mut entries: Vec<FileEntry>,
    ) -> Result<Self> {
        normalize_entries(&mut entries);
        let checksum = checksum(&entries)?;
        Ok(Self {
            metadata: BlobMetadata {
                owner,
                artifact,
                gid: gid.into(),
                created_at,
                checksum,
            },
            entries,
        })
    }

    /// Parse a raw payload as a JSON entries array.
    pub fn parse_entries(payload: &[u8]) -> Result<Vec<FileEntry>> {
        serde_json::from_slice(payload).context("parsing payload entries")
    }

    /// Parse a stored blob. A checksum mismatch is logged and overwritten
    /// with the recomputed value — the payload content is authoritative.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut blob: Self = serde_json::from_slice(bytes).context("parsing manifest blob")?;
        let recomputed = checksum(&blob.entries)?;
        if blob.metadata.checksum != recomputed {
            warn!(
                artifact = blob.metadata.artifact,
                gid = %blob.metadata.gid,
                stored = blob.metadata.checksum,
                recomputed,
                "stored checksum mismatch, overwriting with recomputed value"
            );
            blob.metadata.checksum = recomputed;
        }
        Ok(blob)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("serializing manifest blob")
    }

    /// The idempotency/existence key in the version-control backend.
    pub fn tag(&self) -> String {
        version_tag(self.metadata.artifact, &self.metadata.gid)
    }
}

/// Composite tag key for a specific (artifact, version) pair.
pub fn version_tag(artifact: ArtifactId, gid: &str) -> String {
    format!("{artifact}_{gid}")
}

/// File name of a stored blob within its owner worktree.
pub fn blob_file_name(artifact: ArtifactId, gid: &str) -> String {
    format!("{artifact}_{gid}.manifest")
}
