use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chunkd_core::codec::{ChunkHealth, DEFAULT_CHUNK_SIZE};
use chunkd_core::config::StoreConfig;
use chunkd_core::service::ChunkService;

#[derive(Parser)]
#[command(name = "chunkd", version, about = "Chunked file store with resumable uploads")]
struct Cli {
    /// Directory holding one chunk directory per stored file
    #[arg(long, global = true, env = "CHUNKD_ROOT", default_value = "chunks")]
    chunk_root: PathBuf,
    /// Metadata snapshot; the journal lives next to it
    #[arg(long, global = true, env = "CHUNKD_METADATA", default_value = "metadata.json")]
    metadata: PathBuf,
    /// Bytes per chunk for new uploads; must match the size used for earlier
    /// uploads of a name for its chunks to be reused
    #[arg(long, global = true, env = "CHUNKD_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    /// Allow a chunk directory to be a symlink, as long as it resolves
    /// inside the chunk root
    #[arg(long, global = true, env = "CHUNKD_FOLLOW_SYMLINKS", default_value_t = false)]
    follow_symlinks: bool,
    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Split a file into chunks, reusing chunks already stored
    Upload {
        path: PathBuf,
        /// Logical name (defaults to the file's base name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Store one chunk of a file, checked against its declared checksum
    UploadChunk { name: String, index: usize, path: PathBuf, checksum: String },
    /// Reassemble a stored file
    Merge { name: String, output: PathBuf },
    /// List chunks of a stored file with their on-disk health
    Chunks {
        name: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Check whether one chunk exists with the given checksum
    CheckChunk { name: String, index: usize, checksum: String },
    /// Print stored metadata as JSON
    Show { name: Option<String> },
    /// Delete a stored file and its chunks
    Remove { name: String },
    /// Write the metadata snapshot and compact the journal
    Save,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let config = StoreConfig {
        chunk_root: cli.chunk_root,
        metadata_path: cli.metadata,
        chunk_size: cli.chunk_size,
        follow_symlinks: cli.follow_symlinks,
    };
    debug!(?config, "opening chunk store");
    let svc = ChunkService::open(config).context("open chunk store")?;
    match cli.cmd {
        Cmd::Upload { path, name } => upload(&svc, &path, name)?,
        Cmd::UploadChunk { name, index, path, checksum } => {
            let data = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
            let out = svc
                .upload_chunk(&name, index, &data, &checksum)
                .with_context(|| format!("upload chunk {index} of {name}"))?;
            let state = if out.report.reused > 0 { "already stored" } else { "stored" };
            println!(
                "{name}: chunk {index} {state} ({} byte(s)), {} chunk(s) recorded",
                data.len(),
                out.record.chunks.len()
            );
        }
        Cmd::Merge { name, output } => merge(&svc, &name, &output)?,
        Cmd::Chunks { name, json } => chunks(&svc, &name, json)?,
        Cmd::CheckChunk { name, index, checksum } => {
            let exists = svc
                .check_chunk(&name, index, &checksum)
                .with_context(|| format!("check chunk {index} of {name}"))?;
            println!("exists: {exists}");
        }
        Cmd::Show { name } => show(&svc, name.as_deref())?,
        Cmd::Remove { name } => {
            let rec = svc.remove(&name).with_context(|| format!("remove {name}"))?;
            println!("removed {} ({} chunks)", rec.file_name, rec.chunks.len());
        }
        Cmd::Save => {
            svc.persist().context("save metadata")?;
            println!(
                "saved {} record(s) to {}",
                svc.store().len(),
                svc.store().snapshot_path().display()
            );
        }
    }
    Ok(())
}

fn init_logging(verbosity: u8) -> Result<()> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chunkd={level},chunkd_core={level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(verbosity >= 2))
        .try_init()
        .map_err(|e| anyhow!("init logging: {e}"))
}

fn upload(svc: &ChunkService, path: &Path, name: Option<String>) -> Result<()> {
    let name = match name {
        Some(n) => n,
        None => path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("cannot derive a name from {}; pass --name", path.display()))?,
    };
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let out = svc
        .upload(&name, BufReader::new(f))
        .with_context(|| format!("upload {} as {name}", path.display()))?;
    let r = &out.report;
    println!(
        "{}: {} chunk(s), reused {}, regenerated {}, {} byte(s) written",
        out.record.file_name,
        out.record.chunks.len(),
        r.reused,
        r.regenerated,
        r.bytes_written
    );
    if out.reclaimed > 0 {
        println!("reclaimed {} stale chunk(s)", out.reclaimed);
    }
    Ok(())
}

fn merge(svc: &ChunkService, name: &str, output: &Path) -> Result<()> {
    let written = svc
        .merge_to_path(name, output)
        .with_context(|| format!("merge {name} into {}", output.display()))?;
    println!("{name}: {written} byte(s) -> {}", output.display());
    Ok(())
}

fn chunks(svc: &ChunkService, name: &str, as_json: bool) -> Result<()> {
    let status = svc.chunk_status(name).with_context(|| format!("list chunks of {name}"))?;
    if as_json {
        let rows: Vec<_> = status
            .iter()
            .map(|s| {
                let mut row = json!({
                    "index": s.index,
                    "path": s.descriptor.path.display().to_string(),
                    "checksum": s.descriptor.checksum,
                    "chunk_size": s.descriptor.size,
                    "status": s.health.label(),
                });
                match &s.health {
                    ChunkHealth::Truncated { found } => row["found_size"] = json!(found),
                    ChunkHealth::Corrupt { actual } => row["actual_checksum"] = json!(actual),
                    _ => {}
                }
                row
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for s in &status {
        println!(
            "{:5}  {:>10}  {}  {:9}  {}",
            s.index,
            s.descriptor.size,
            s.descriptor.checksum,
            s.health.label(),
            s.descriptor.path.display()
        );
    }
    let bad = status.iter().filter(|s| !s.health.is_intact()).count();
    eprintln!("{name}: {} chunk(s), {bad} damaged", status.len());
    Ok(())
}

fn show(svc: &ChunkService, name: Option<&str>) -> Result<()> {
    let text = match name {
        Some(n) => {
            let rec = svc.store().get(n).ok_or_else(|| anyhow!("no record for {n}"))?;
            serde_json::to_string_pretty(&rec)?
        }
        None => serde_json::to_string_pretty(&svc.store().records())?,
    };
    println!("{text}");
    Ok(())
}
