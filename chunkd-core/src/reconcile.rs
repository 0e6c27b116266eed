use std::collections::HashSet;
use std::ffi::OsStr;
use std::io::Read;
use tracing::debug;

use crate::codec::{Chunk, ChunkReader};
use crate::error::Result;
use crate::layout::{is_present, write_file, ChunkDir};
use crate::manifest::ChunkDescriptor;

/// Per-pass counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reused: u64,
    pub regenerated: u64,
    pub bytes_written: u64,
    pub bytes_skipped: u64,
}

impl ReconcileReport {
    pub fn total(&self) -> u64 {
        self.reused + self.regenerated
    }
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// One descriptor per block read from the stream, in index order.
    pub chunks: Vec<ChunkDescriptor>,
    pub report: ReconcileReport,
    /// Old descriptors whose files the new chunk set no longer uses: replaced
    /// blocks and anything past the end of the new stream.
    pub superseded: Vec<ChunkDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Regen {
    New,
    Changed,
    Missing,
}

enum Decision<'a> {
    Reuse(&'a ChunkDescriptor),
    Write(Regen),
}

fn decide<'a>(chunk: &Chunk, existing: Option<&'a ChunkDescriptor>) -> Decision<'a> {
    match existing {
        None => Decision::Write(Regen::New),
        Some(desc) if !chunk.matches(desc) => Decision::Write(Regen::Changed),
        // metadata alone is not proof the bytes are still on disk
        Some(desc) if !is_present(desc) => Decision::Write(Regen::Missing),
        Some(desc) => Decision::Reuse(desc),
    }
}

/// Walk `reader` block by block against the descriptors of a previous upload.
///
/// A block whose checksum and size match the descriptor at the same index,
/// and whose stored file is still there, keeps that descriptor untouched.
/// A matching block whose file is gone is rewritten at the recorded path.
/// Any other block goes to a path no previous descriptor uses, so the old
/// record stays intact until the caller commits the new one.
pub fn reconcile<R: Read>(
    reader: R,
    existing: &[ChunkDescriptor],
    dir: &ChunkDir,
    chunk_size: usize,
) -> Result<Reconciliation> {
    let in_use: HashSet<&OsStr> = existing.iter().filter_map(|d| d.path.file_name()).collect();
    let mut report = ReconcileReport::default();
    let mut chunks: Vec<ChunkDescriptor> = Vec::with_capacity(existing.len());
    for chunk in ChunkReader::new(reader, chunk_size)? {
        let chunk = chunk?;
        match decide(&chunk, existing.get(chunk.index)) {
            Decision::Reuse(desc) => {
                debug!(index = chunk.index, "chunk unchanged, reusing");
                report.reused += 1;
                report.bytes_skipped += chunk.size();
                chunks.push(desc.clone());
            }
            Decision::Write(why) => {
                let target = match (why, existing.get(chunk.index)) {
                    // same bytes as recorded, so the old record stays valid
                    (Regen::Missing, Some(desc)) => desc.path.clone(),
                    _ => dir.fresh_chunk_path(chunk.index, &in_use),
                };
                debug!(index = chunk.index, reason = ?why, path = %target.display(), "writing chunk");
                let path = write_file(target, &chunk.data)?;
                report.regenerated += 1;
                report.bytes_written += chunk.size();
                chunks.push(chunk.descriptor(path));
            }
        }
    }
    let kept: HashSet<&std::path::Path> = chunks.iter().map(|c| c.path.as_path()).collect();
    let superseded = existing.iter().filter(|d| !kept.contains(d.path.as_path())).cloned().collect();
    Ok(Reconciliation { chunks, report, superseded })
}
