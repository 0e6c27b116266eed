//! Concurrent file-name → [`FileRecord`] map with durable snapshot and journal.
//!
//! Durable layout next to each other on disk:
//! - `<snapshot>`: pretty JSON object keyed by file name, rewritten by [`MetadataStore::save_all`].
//! - `<snapshot>.journal`: one `<crc32 hex>\t<json>` line per [`MetadataStore::commit`] or
//!   [`MetadataStore::remove`] since the last snapshot, replayed by [`MetadataStore::load_all`].
//!
//! Every accessor runs under a single `RwLock`: lookups share it, every
//! mutation (including save and load) holds it exclusively. A `save_all`
//! therefore stalls concurrent uploads for as long as the snapshot write takes;
//! uploads use `commit`, which journals only the one record.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::manifest::FileRecord;

type RecordMap = HashMap<String, FileRecord>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Put { record: FileRecord },
    Delete { file_name: String },
}

impl JournalEntry {
    fn apply(self, map: &mut RecordMap) {
        match self {
            JournalEntry::Put { record } => {
                map.insert(record.file_name.clone(), record);
            }
            JournalEntry::Delete { file_name } => {
                map.remove(&file_name);
            }
        }
    }
}

fn encode_line(entry: &JournalEntry) -> Result<String> {
    let json = serde_json::to_string(entry)?;
    let crc = crc32fast::hash(json.as_bytes());
    Ok(format!("{crc:08x}\t{json}\n"))
}

fn decode_line(line: &[u8]) -> Option<JournalEntry> {
    let line = line.strip_suffix(b"\n")?;
    // a write torn inside a multi-byte character is just another bad line
    let line = std::str::from_utf8(line).ok()?;
    let (crc_hex, json) = line.split_once('\t')?;
    let crc = u32::from_str_radix(crc_hex, 16).ok()?;
    if crc32fast::hash(json.as_bytes()) != crc {
        return None;
    }
    serde_json::from_str(json).ok()
}

/// Journal file that sits beside a snapshot path.
pub fn journal_path_for(snapshot: &Path) -> PathBuf {
    let mut s = snapshot.as_os_str().to_owned();
    s.push(".journal");
    PathBuf::from(s)
}

fn read_snapshot(path: &Path) -> Result<RecordMap> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RecordMap::new()),
        Err(e) => return Err(e.into()),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(RecordMap::new());
    }
    serde_json::from_slice(&data)
        .map_err(|e| Error::Metadata(format!("{}: {e}", path.display())))
}

/// Replay journal lines into `map`. Returns the number of entries applied and,
/// if the final line was torn, the byte length of the good prefix.
fn replay_journal(path: &Path, map: &mut RecordMap) -> Result<(usize, Option<u64>)> {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((0, None)),
        Err(e) => return Err(e.into()),
    };
    let lines: Vec<&[u8]> = content.split_inclusive(|b| *b == b'\n').collect();
    let mut applied = 0usize;
    let mut good_len = 0u64;
    for (i, line) in lines.iter().enumerate() {
        match decode_line(line) {
            Some(entry) => {
                entry.apply(map);
                applied += 1;
                good_len += line.len() as u64;
            }
            None if i + 1 == lines.len() => {
                warn!(journal = %path.display(), line = i + 1, "ignoring torn journal tail");
                return Ok((applied, Some(good_len)));
            }
            None => {
                return Err(Error::Metadata(format!(
                    "{}: corrupt journal line {}",
                    path.display(),
                    i + 1
                )))
            }
        }
    }
    Ok((applied, None))
}

fn open_journal(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let f = OpenOptions::new().create(true).read(true).append(true).open(path)?;
    Ok(f)
}

pub struct MetadataStore {
    records: RwLock<RecordMap>,
    snapshot_path: PathBuf,
    journal_path: PathBuf,
}

impl MetadataStore {
    /// Empty store persisting to `snapshot_path` (and its journal).
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        let journal_path = journal_path_for(&snapshot_path);
        Self { records: RwLock::new(RecordMap::new()), snapshot_path, journal_path }
    }

    /// [`MetadataStore::new`] followed by [`MetadataStore::load_all`].
    pub fn open(snapshot_path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(snapshot_path);
        store.load_all()?;
        Ok(store)
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    // Records are only ever replaced wholesale, so a poisoned lock still guards a consistent map.
    fn read(&self) -> RwLockReadGuard<'_, RecordMap> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RecordMap> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a record in memory only. Last writer wins.
    pub fn put(&self, record: FileRecord) {
        self.write().insert(record.file_name.clone(), record);
    }

    pub fn get(&self, file_name: &str) -> Option<FileRecord> {
        self.read().get(file_name).cloned()
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.read().contains_key(file_name)
    }

    /// Remove a record from memory only.
    pub fn delete(&self, file_name: &str) -> Option<FileRecord> {
        self.write().remove(file_name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted copy of every record.
    pub fn records(&self) -> BTreeMap<String, FileRecord> {
        self.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn append_journal(&self, entry: &JournalEntry) -> Result<()> {
        let line = encode_line(entry)?;
        let mut f = open_journal(&self.journal_path)?;
        FileExt::lock_exclusive(&f)?;
        let res = f.write_all(line.as_bytes()).and_then(|_| f.sync_data());
        FileExt::unlock(&f)?;
        res?;
        Ok(())
    }

    /// Durably journal `record`, then make it visible. Nothing changes in memory
    /// if the journal write fails.
    pub fn commit(&self, record: FileRecord) -> Result<()> {
        let mut map = self.write();
        self.append_journal(&JournalEntry::Put { record: record.clone() })?;
        debug!(file = %record.file_name, chunks = record.chunks.len(), "journaled record");
        map.insert(record.file_name.clone(), record);
        Ok(())
    }

    /// Durably journal the removal of `file_name`, then drop it from memory.
    pub fn remove(&self, file_name: &str) -> Result<Option<FileRecord>> {
        let mut map = self.write();
        if !map.contains_key(file_name) {
            return Ok(None);
        }
        self.append_journal(&JournalEntry::Delete { file_name: file_name.to_string() })?;
        Ok(map.remove(file_name))
    }

    /// Write the whole map as a fresh snapshot and truncate the journal.
    ///
    /// Holds the write lock throughout so the snapshot is consistent.
    pub fn save_all(&self) -> Result<()> {
        let map = self.write();
        let sorted: BTreeMap<&String, &FileRecord> = map.iter().collect();
        let data = serde_json::to_vec_pretty(&sorted)?;

        let journal = open_journal(&self.journal_path)?;
        FileExt::lock_exclusive(&journal)?;
        let res = self.write_snapshot(&data).and_then(|_| {
            journal.set_len(0)?;
            journal.sync_data()?;
            Ok(())
        });
        FileExt::unlock(&journal)?;
        res?;
        info!(path = %self.snapshot_path.display(), records = map.len(), "metadata saved");
        Ok(())
    }

    fn write_snapshot(&self, data: &[u8]) -> Result<()> {
        let mut tmp = self.snapshot_path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut f = File::create(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.snapshot_path)?;
        Ok(())
    }

    /// Replace the in-memory map with snapshot + journal. Missing files mean empty.
    pub fn load_all(&self) -> Result<()> {
        let mut map = self.write();
        let mut loaded = read_snapshot(&self.snapshot_path)?;
        let (replayed, torn) = replay_journal(&self.journal_path, &mut loaded)?;
        if let Some(good_len) = torn {
            let journal = open_journal(&self.journal_path)?;
            FileExt::lock_exclusive(&journal)?;
            let res = journal.set_len(good_len).and_then(|_| journal.sync_data());
            FileExt::unlock(&journal)?;
            res?;
        }
        *map = loaded;
        info!(
            path = %self.snapshot_path.display(),
            records = map.len(),
            replayed,
            "metadata loaded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ChunkDescriptor;

    fn record(name: &str) -> FileRecord {
        FileRecord::new(
            name,
            vec![ChunkDescriptor {
                path: PathBuf::from(format!("chunks/{name}/chunk_0")),
                checksum: crate::codec::checksum(name.as_bytes()),
                size: name.len() as u64,
            }],
        )
    }

    #[test]
    fn journal_line_roundtrip_and_crc_guard() {
        let entry = JournalEntry::Put { record: record("a") };
        let line = encode_line(&entry).unwrap();
        assert_eq!(decode_line(line.as_bytes()), Some(entry));
        let tampered = line.replacen("chunk_0", "chunk_9", 1);
        assert_eq!(decode_line(tampered.as_bytes()), None);
        assert_eq!(decode_line(line.trim_end().as_bytes()), None);
        assert_eq!(decode_line(b"0badc0de\t{\"op\":\"delete\",\"file_name\":\"caf\xc3\n"), None);
    }

    #[test]
    fn journal_path_sits_beside_snapshot() {
        assert_eq!(
            journal_path_for(Path::new("/var/lib/chunkd/metadata.json")),
            PathBuf::from("/var/lib/chunkd/metadata.json.journal")
        );
    }

    #[test]
    fn put_get_delete() {
        let td = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(td.path().join("metadata.json"));
        assert!(store.get("a").is_none());
        store.put(record("a"));
        assert_eq!(store.get("a"), Some(record("a")));
        assert_eq!(store.delete("a"), Some(record("a")));
        assert!(store.is_empty());
    }

    #[test]
    fn middle_corruption_is_an_error() {
        let td = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(td.path().join("metadata.json"));
        store.commit(record("a")).unwrap();
        store.commit(record("b")).unwrap();
        let jp = store.journal_path().to_path_buf();
        let content = fs::read_to_string(&jp).unwrap();
        fs::write(&jp, content.replacen('\t', " ", 1)).unwrap();
        assert!(matches!(store.load_all(), Err(Error::Metadata(_))));
    }
}
