use std::path::PathBuf;

use crate::codec::DEFAULT_CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::path_safety::PathPolicy;

/// Where chunks and metadata live, and how big a chunk is.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Root under which each file name gets its own chunk directory.
    pub chunk_root: PathBuf,
    /// Snapshot file; the journal sits beside it.
    pub metadata_path: PathBuf,
    pub chunk_size: usize,
    /// Allow a file's chunk directory to be a symlink, as long as it resolves
    /// inside `chunk_root`.
    pub follow_symlinks: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_root: PathBuf::from("chunks"),
            metadata_path: PathBuf::from("metadata.json"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            follow_symlinks: false,
        }
    }
}

impl StoreConfig {
    /// Everything under one directory: `<base>/chunks` and `<base>/metadata.json`.
    pub fn under(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            chunk_root: base.join("chunks"),
            metadata_path: base.join("metadata.json"),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn path_policy(&self) -> PathPolicy {
        PathPolicy { follow_symlinks: self.follow_symlinks }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk size must be non-zero".into()));
        }
        if self.chunk_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!("chunk size {} too large", self.chunk_size)));
        }
        if self.metadata_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("metadata path is empty".into()));
        }
        Ok(())
    }
}
