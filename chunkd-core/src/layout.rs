use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::manifest::ChunkDescriptor;
use crate::path_safety::{scoped_dir, PathPolicy};

/// Standard chunk file name for an index.
pub fn chunk_name(index: usize) -> String {
    format!("chunk_{index}")
}

/// Storage scope for one logical file: `<chunk_root>/<encoded file_name>/`.
///
/// The encoding is one-to-one and flat, so different names never share or
/// nest inside each other's directory.
#[derive(Clone, Debug)]
pub struct ChunkDir {
    dir: PathBuf,
}

impl ChunkDir {
    pub fn new(chunk_root: &Path, file_name: &str) -> Result<Self> {
        Self::with_policy(chunk_root, file_name, PathPolicy::default())
    }

    pub fn with_policy(chunk_root: &Path, file_name: &str, policy: PathPolicy) -> Result<Self> {
        let dir = scoped_dir(chunk_root, file_name, policy)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_path(&self, index: usize) -> PathBuf {
        self.dir.join(chunk_name(index))
    }

    /// Location for new bytes of chunk `index` that is not one of the file
    /// names in `in_use`: `chunk_<index>` if free, else `chunk_<index>.<n>`.
    pub fn fresh_chunk_path(&self, index: usize, in_use: &HashSet<&OsStr>) -> PathBuf {
        let base = chunk_name(index);
        if !in_use.contains(OsStr::new(&base)) {
            return self.dir.join(base);
        }
        let mut n = 1usize;
        loop {
            let name = format!("{base}.{n}");
            if !in_use.contains(OsStr::new(&name)) {
                return self.dir.join(name);
            }
            n += 1;
        }
    }

    /// Persist `data` as chunk `index` at `chunk_<index>`.
    pub fn write_chunk(&self, index: usize, data: &[u8]) -> Result<PathBuf> {
        write_file(self.chunk_path(index), data)
    }

    /// Remove the whole scope directory; absent is fine.
    pub fn remove_all(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `data` to `path`. The bytes go to a temp sibling first and are
/// renamed into place only after they hit disk.
pub fn write_file(path: PathBuf, data: &[u8]) -> Result<PathBuf> {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("not a chunk file path: {}", path.display()),
        )
        .into());
    };
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(name);
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
        f.write_all(data)?;
        f.sync_data()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// A recorded location counts as present when it opens as a regular file
/// holding at least the recorded number of bytes.
pub fn is_present(desc: &ChunkDescriptor) -> bool {
    match File::open(&desc.path).and_then(|f| f.metadata()) {
        Ok(m) => m.is_file() && m.len() >= desc.size,
        Err(_) => false,
    }
}

/// Delete one chunk file; returns whether something was removed.
pub fn remove_chunk(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
