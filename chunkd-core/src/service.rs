//! Upload and merge orchestration on top of the codec, reconciliation engine and store.

use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::codec::{self, checksum_file, ChunkHealth};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::layout::{is_present, remove_chunk, write_file, ChunkDir};
use crate::manifest::{ChunkDescriptor, FileRecord};
use crate::reconcile::{reconcile, ReconcileReport};
use crate::store::MetadataStore;

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub record: FileRecord,
    pub report: ReconcileReport,
    /// Chunk files of the previous record that the new one no longer uses
    /// and that were deleted.
    pub reclaimed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkStatus {
    pub index: usize,
    pub descriptor: ChunkDescriptor,
    pub health: ChunkHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Reads chunk files of the committed record.
    Read,
    /// Writes chunk files and commits a new record.
    Write,
}

#[derive(Debug, Default)]
struct Activity {
    writing: bool,
    reading: usize,
}

type BusyMap = HashMap<String, Activity>;

/// Marks a file name busy for the lifetime of the guard.
struct Claim<'a> {
    busy: &'a Mutex<BusyMap>,
    name: String,
    access: Access,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(a) = busy.get_mut(&self.name) {
            match self.access {
                Access::Write => a.writing = false,
                Access::Read => a.reading = a.reading.saturating_sub(1),
            }
            if !a.writing && a.reading == 0 {
                busy.remove(&self.name);
            }
        }
    }
}

/// Entry point used by the CLI (and any transport in front of it).
///
/// Safe to share across threads; uploads of different names run in parallel.
/// For one name, an upload excludes every other upload and merge, while
/// merges may overlap each other.
pub struct ChunkService {
    config: StoreConfig,
    store: MetadataStore,
    busy: Mutex<BusyMap>,
}

impl ChunkService {
    /// Validate `config` and load metadata from its snapshot and journal.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let store = MetadataStore::open(&config.metadata_path)?;
        Ok(Self { config, store, busy: Mutex::new(BusyMap::new()) })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    fn chunk_dir(&self, file_name: &str) -> Result<ChunkDir> {
        ChunkDir::with_policy(&self.config.chunk_root, file_name, self.config.path_policy())
    }

    fn claim(&self, file_name: &str, access: Access) -> Result<Claim<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        let a = busy.entry(file_name.to_string()).or_default();
        if a.writing {
            return Err(Error::UploadInProgress(file_name.to_string()));
        }
        match access {
            Access::Write if a.reading > 0 => {
                return Err(Error::MergeInProgress(file_name.to_string()))
            }
            Access::Write => a.writing = true,
            Access::Read => a.reading += 1,
        }
        Ok(Claim { busy: &self.busy, name: file_name.to_string(), access })
    }

    /// Reconcile `reader` against whatever is recorded for `file_name` and
    /// durably record the result.
    ///
    /// On error the previously committed record and its chunk files are left
    /// as they were.
    pub fn upload<R: Read>(&self, file_name: &str, reader: R) -> Result<UploadOutcome> {
        let dir = self.chunk_dir(file_name)?;
        let _claim = self.claim(file_name, Access::Write)?;
        let existing = self.store.get(file_name).map(|r| r.chunks).unwrap_or_default();
        let pass = reconcile(reader, &existing, &dir, self.config.chunk_size)?;

        let record = FileRecord::new(file_name, pass.chunks).touched();
        self.store.commit(record.clone())?;
        let reclaimed = reclaim(&pass.superseded);

        info!(
            file = file_name,
            chunks = record.chunks.len(),
            reused = pass.report.reused,
            regenerated = pass.report.regenerated,
            bytes_written = pass.report.bytes_written,
            reclaimed,
            "upload committed"
        );
        Ok(UploadOutcome { record, report: pass.report, reclaimed })
    }

    /// Store one chunk sent on its own, as a resumable client does.
    ///
    /// `data` must hash to `declared_checksum`. `index` may replace an existing
    /// chunk or append right after the last one; anything further would leave
    /// a gap.
    pub fn upload_chunk(
        &self,
        file_name: &str,
        index: usize,
        data: &[u8],
        declared_checksum: &str,
    ) -> Result<UploadOutcome> {
        let dir = self.chunk_dir(file_name)?;
        let actual = codec::checksum(data);
        if !actual.eq_ignore_ascii_case(declared_checksum.trim()) {
            return Err(Error::DeclaredChecksumMismatch {
                index,
                declared: declared_checksum.to_string(),
                actual,
            });
        }
        let _claim = self.claim(file_name, Access::Write)?;
        let current = self.store.get(file_name);
        let mut chunks = current.as_ref().map(|r| r.chunks.clone()).unwrap_or_default();
        if index > chunks.len() {
            return Err(Error::ChunkIndexOutOfRange { index, len: chunks.len() });
        }

        let size = data.len() as u64;
        let old = chunks.get(index).cloned();
        let same_bytes = old.as_ref().is_some_and(|d| d.checksum == actual && d.size == size);
        let mut report = ReconcileReport::default();
        if let (true, Some(desc), Some(record)) = (same_bytes, old.as_ref(), current.as_ref()) {
            if is_present(desc) {
                debug!(file = file_name, index, "chunk already stored");
                report.reused = 1;
                report.bytes_skipped = size;
                return Ok(UploadOutcome { record: record.clone(), report, reclaimed: 0 });
            }
        }

        let target = match &old {
            Some(desc) if same_bytes => desc.path.clone(),
            _ => {
                let in_use: HashSet<&OsStr> =
                    chunks.iter().filter_map(|d| d.path.file_name()).collect();
                dir.fresh_chunk_path(index, &in_use)
            }
        };
        let path = write_file(target, data)?;
        let desc = ChunkDescriptor { path, checksum: actual, size };
        if index == chunks.len() {
            chunks.push(desc);
        } else {
            chunks[index] = desc;
        }
        report.regenerated = 1;
        report.bytes_written = size;

        let record = FileRecord::new(file_name, chunks).touched();
        self.store.commit(record.clone())?;
        let superseded: Vec<ChunkDescriptor> = old
            .into_iter()
            .filter(|d| !record.chunks.iter().any(|c| c.path == d.path))
            .collect();
        let reclaimed = reclaim(&superseded);
        info!(file = file_name, index, bytes = size, "chunk committed");
        Ok(UploadOutcome { record, report, reclaimed })
    }

    fn record(&self, file_name: &str) -> Result<FileRecord> {
        self.store.get(file_name).ok_or_else(|| Error::RecordNotFound(file_name.to_string()))
    }

    /// Reassemble `file_name` into `out`. Returns bytes written.
    pub fn merge<W: Write>(&self, file_name: &str, out: &mut W) -> Result<u64> {
        let _claim = self.claim(file_name, Access::Read)?;
        let record = self.record(file_name)?;
        let written = codec::merge(&record.chunks, out)?;
        info!(file = file_name, bytes = written, "merge complete");
        Ok(written)
    }

    /// Reassemble `file_name` into a new file at `output`.
    ///
    /// On failure the partial file is left behind and must not be trusted.
    pub fn merge_to_path(&self, file_name: &str, output: &Path) -> Result<u64> {
        let _claim = self.claim(file_name, Access::Read)?;
        let record = self.record(file_name)?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut w = BufWriter::new(File::create(output)?);
        let written = codec::merge(&record.chunks, &mut w)?;
        let f = w.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        f.sync_all()?;
        info!(file = file_name, output = %output.display(), bytes = written, "merge complete");
        Ok(written)
    }

    pub fn list_chunks(&self, file_name: &str) -> Result<Vec<ChunkDescriptor>> {
        Ok(self.record(file_name)?.chunks)
    }

    /// Verify every stored chunk of `file_name` in parallel. Read-only.
    pub fn chunk_status(&self, file_name: &str) -> Result<Vec<ChunkStatus>> {
        let record = self.record(file_name)?;
        Ok(record
            .chunks
            .into_par_iter()
            .enumerate()
            .map(|(index, descriptor)| {
                let health = codec::verify_chunk(&descriptor);
                ChunkStatus { index, descriptor, health }
            })
            .collect())
    }

    /// Whether chunk `index` of `file_name` is on disk and hashes to `checksum`.
    ///
    /// Looks at the recorded location when there is one, else at
    /// `chunk_<index>` in the file's directory.
    pub fn check_chunk(&self, file_name: &str, index: usize, checksum: &str) -> Result<bool> {
        let dir = self.chunk_dir(file_name)?;
        let path = self
            .store
            .get(file_name)
            .and_then(|r| r.chunks.get(index).map(|d| d.path.clone()))
            .unwrap_or_else(|| dir.chunk_path(index));
        match checksum_file(&path) {
            Ok(actual) => Ok(actual.eq_ignore_ascii_case(checksum.trim())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Forget `file_name` and delete its chunk files.
    pub fn remove(&self, file_name: &str) -> Result<FileRecord> {
        let dir = self.chunk_dir(file_name)?;
        let _claim = self.claim(file_name, Access::Write)?;
        let record = self
            .store
            .remove(file_name)?
            .ok_or_else(|| Error::RecordNotFound(file_name.to_string()))?;
        for desc in record.chunks.iter().filter(|d| !d.path.starts_with(dir.path())) {
            if let Err(e) = remove_chunk(&desc.path) {
                warn!(path = %desc.path.display(), error = %e, "failed to delete chunk");
            }
        }
        dir.remove_all()?;
        info!(file = file_name, chunks = record.chunks.len(), "record removed");
        Ok(record)
    }

    /// Flush every record to the snapshot (and compact the journal).
    pub fn persist(&self) -> Result<()> {
        self.store.save_all()
    }

    /// Reload every record from durable storage.
    pub fn load(&self) -> Result<()> {
        self.store.load_all()
    }
}

/// Delete chunk files the committed record no longer references.
fn reclaim(superseded: &[ChunkDescriptor]) -> usize {
    let mut removed = 0;
    for desc in superseded {
        match remove_chunk(&desc.path) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => warn!(path = %desc.path.display(), error = %e, "failed to reclaim chunk"),
        }
    }
    removed
}
