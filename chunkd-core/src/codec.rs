//! Fixed-size content-addressed chunking and verified reassembly.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::manifest::ChunkDescriptor;

/// Nominal chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

// Recorded sizes come from disk; never trust them for an allocation.
const MAX_PREALLOC: u64 = 1 << 20;

/// Lowercase hex SHA-256 digest of `data` (64 chars).
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Streaming SHA-256 over a whole file, hex encoded.
pub fn checksum_file(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match f.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// A block read from the input stream, not yet persisted.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub index: usize,
    pub data: Vec<u8>,
    pub checksum: String,
}

impl Chunk {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Descriptor for this chunk once its bytes live at `path`.
    pub fn descriptor(&self, path: PathBuf) -> ChunkDescriptor {
        ChunkDescriptor { path, checksum: self.checksum.clone(), size: self.size() }
    }

    /// Whether `desc` records exactly these bytes (checksum and size).
    pub fn matches(&self, desc: &ChunkDescriptor) -> bool {
        desc.size == self.size() && desc.checksum == self.checksum
    }
}

/// Fill `buf` from `r`, stopping early only at EOF.
pub(crate) fn read_block<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reads a stream in consecutive `chunk_size` blocks and hashes each one.
///
/// A short block marks end of stream; empty input yields no chunks.
pub struct ChunkReader<R> {
    inner: R,
    chunk_size: usize,
    next_index: usize,
    done: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk size must be non-zero".into()));
        }
        Ok(Self { inner, chunk_size, next_index: 0, done: false })
    }

    /// Reads the next chunk. Returns `None` at EOF.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.chunk_size];
        let n = match read_block(&mut self.inner, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Err(e.into());
            }
        };
        if n < self.chunk_size {
            self.done = true;
        }
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        let chunk = Chunk { index: self.next_index, checksum: checksum(&buf), data: buf };
        self.next_index += 1;
        Ok(Some(chunk))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

/// Split a whole stream into chunks held in memory.
pub fn split<R: Read>(reader: R, chunk_size: usize) -> Result<Vec<Chunk>> {
    ChunkReader::new(reader, chunk_size)?.collect()
}

/// Read exactly `desc.size` bytes from `desc.path` and check them against the checksum.
pub fn read_verified(index: usize, desc: &ChunkDescriptor) -> Result<Vec<u8>> {
    let f = File::open(&desc.path).map_err(|source| Error::ChunkMissing {
        index,
        path: desc.path.clone(),
        source,
    })?;
    let mut buf = Vec::with_capacity(desc.size.min(MAX_PREALLOC) as usize);
    f.take(desc.size).read_to_end(&mut buf)?;
    if (buf.len() as u64) < desc.size {
        return Err(Error::ChunkSizeMismatch {
            index,
            path: desc.path.clone(),
            expected: desc.size,
            actual: buf.len() as u64,
        });
    }
    let actual = checksum(&buf);
    if actual != desc.checksum {
        return Err(Error::ChecksumMismatch {
            index,
            path: desc.path.clone(),
            expected: desc.checksum.clone(),
            actual,
        });
    }
    Ok(buf)
}

/// Concatenate chunks in index order into `out`, verifying each before it is written.
///
/// Stops at the first bad chunk. Whatever was already written stays in `out`;
/// the caller must discard it.
pub fn merge<W: Write>(descriptors: &[ChunkDescriptor], out: &mut W) -> Result<u64> {
    let mut written = 0u64;
    for (index, desc) in descriptors.iter().enumerate() {
        let data = read_verified(index, desc)?;
        out.write_all(&data)?;
        written += data.len() as u64;
    }
    out.flush()?;
    Ok(written)
}

/// Health of one stored chunk relative to its descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkHealth {
    Intact,
    Missing,
    Truncated { found: u64 },
    Corrupt { actual: String },
}

impl ChunkHealth {
    pub fn is_intact(&self) -> bool {
        matches!(self, ChunkHealth::Intact)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChunkHealth::Intact => "ok",
            ChunkHealth::Missing => "missing",
            ChunkHealth::Truncated { .. } => "truncated",
            ChunkHealth::Corrupt { .. } => "corrupt",
        }
    }
}

/// Non-failing variant of [`read_verified`] for reporting.
pub fn verify_chunk(desc: &ChunkDescriptor) -> ChunkHealth {
    match read_verified(0, desc) {
        Ok(_) => ChunkHealth::Intact,
        Err(Error::ChunkSizeMismatch { actual, .. }) => ChunkHealth::Truncated { found: actual },
        Err(Error::ChecksumMismatch { actual, .. }) => ChunkHealth::Corrupt { actual },
        Err(_) => ChunkHealth::Missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Yields at most `step` bytes per read call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        let chunks = split(Cursor::new(Vec::<u8>::new()), 16).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn short_reads_still_fill_blocks() {
        let data: Vec<u8> = (0..100u8).collect();
        let chunks = split(Trickle { data: &data, step: 7 }, 32).unwrap();
        let sizes: Vec<u64> = chunks.iter().map(Chunk::size).collect();
        assert_eq!(sizes, vec![32, 32, 32, 4]);
        assert_eq!(chunks[3].index, 3);
        assert_eq!(chunks[0].checksum, checksum(&data[..32]));
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_chunk() {
        let chunks = split(Cursor::new(vec![7u8; 64]), 32).unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(matches!(
            ChunkReader::new(Cursor::new(vec![1u8]), 0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn checksum_is_lowercase_hex() {
        let c = checksum(b"abc");
        assert_eq!(c.len(), 64);
        assert!(c.chars().all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch)));
        assert_eq!(
            checksum(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn absurd_recorded_size_is_a_mismatch_not_a_panic() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("chunk_0");
        std::fs::write(&path, b"tiny").unwrap();
        let desc = ChunkDescriptor { path, checksum: checksum(b"tiny"), size: u64::MAX };
        assert!(matches!(
            read_verified(0, &desc),
            Err(Error::ChunkSizeMismatch { actual: 4, expected: u64::MAX, .. })
        ));
        assert_eq!(verify_chunk(&desc), ChunkHealth::Truncated { found: 4 });
    }
}
