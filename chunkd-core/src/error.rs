//! Error taxonomy shared by the codec, reconciliation engine, store and service.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by chunkd-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Stream or storage unreadable/unwritable.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored chunk bytes no longer hash to the recorded checksum.
    #[error("checksum mismatch for chunk {index} ({}): expected {expected}, got {actual}", path.display())]
    ChecksumMismatch { index: usize, path: PathBuf, expected: String, actual: String },

    /// Stored chunk holds fewer bytes than recorded.
    #[error("chunk {index} ({}) is short: expected {expected} bytes, found {actual}", path.display())]
    ChunkSizeMismatch { index: usize, path: PathBuf, expected: u64, actual: u64 },

    /// Storage location of a chunk cannot be opened.
    #[error("chunk {index} missing at {}: {source}", path.display())]
    ChunkMissing {
        index: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No record is stored under this file name.
    #[error("no record for file {0:?}")]
    RecordNotFound(String),

    #[error("invalid file name {name:?}: {reason}")]
    InvalidFileName { name: String, reason: &'static str },

    /// Another upload of the same file name has not finished yet.
    #[error("upload already in progress for {0:?}")]
    UploadInProgress(String),

    /// The file is being merged; its chunks cannot change until that ends.
    #[error("merge in progress for {0:?}")]
    MergeInProgress(String),

    /// Uploaded chunk bytes do not hash to the checksum the client sent.
    #[error("chunk {index} does not match its declared checksum: declared {declared}, got {actual}")]
    DeclaredChecksumMismatch { index: usize, declared: String, actual: String },

    /// A single-chunk upload would leave a gap in the chunk sequence.
    #[error("chunk index {index} out of range: record has {len} chunk(s)")]
    ChunkIndexOutOfRange { index: usize, len: usize },

    /// Durable metadata could not be understood.
    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// True for the integrity failures a merge must never paper over.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::ChecksumMismatch { .. } | Error::ChunkSizeMismatch { .. } | Error::ChunkMissing { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_classification() {
        let e = Error::ChecksumMismatch {
            index: 1,
            path: PathBuf::from("chunks/a/chunk_1"),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(e.is_integrity());
        assert!(format!("{e}").contains("chunk_1"));
        assert!(!Error::RecordNotFound("x".into()).is_integrity());
    }
}
