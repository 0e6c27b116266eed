use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One persisted chunk: where it lives, what it hashes to, how long it is.
///
/// Field names on disk follow the `metadata.json` format already in use
/// (`path`, `checksum`, `chunk_size`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 digest of the stored bytes.
    pub checksum: String,
    #[serde(rename = "chunk_size")]
    pub size: u64,
}

/// Ordered chunk set for one logical file. Position in `chunks` is the chunk index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub file_name: String,
    #[serde(rename = "chunk_metas", alias = "chunks", default)]
    pub chunks: Vec<ChunkDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_utc: Option<String>,
}

impl FileRecord {
    pub fn new(file_name: impl Into<String>, chunks: Vec<ChunkDescriptor>) -> Self {
        Self { file_name: file_name.into(), chunks, updated_utc: None }
    }

    /// Stamp the record with the current UTC time.
    pub fn touched(mut self) -> Self {
        self.updated_utc = Some(chrono::Utc::now().to_rfc3339());
        self
    }

    /// Total byte length of the reconstructed file.
    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}
