use crate::error::{Error, Result};
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

/// Longest directory name most filesystems accept.
const MAX_SEGMENT_LEN: usize = 255;

#[derive(Clone, Copy, Debug, Default)]
pub struct PathPolicy {
    pub follow_symlinks: bool,
}

fn invalid(name: &str, reason: &'static str) -> Error {
    Error::InvalidFileName { name: name.to_string(), reason }
}

/// Check that a logical file name is acceptable: non-empty, no NUL, not
/// absolute, no `..` or `.` components.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(invalid(name, "empty"));
    }
    if name.contains('\0') {
        return Err(invalid(name, "contains NUL"));
    }
    let rel = Path::new(name);
    if rel.is_absolute() || rel.has_root() {
        return Err(invalid(name, "absolute paths are not allowed"));
    }
    for comp in rel.components() {
        match comp {
            Component::Normal(_) => {}
            Component::ParentDir => return Err(invalid(name, "parent traversal not allowed")),
            Component::CurDir => return Err(invalid(name, "`.` components not allowed")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid(name, "absolute paths are not allowed"))
            }
        }
    }
    Ok(())
}

/// Map a file name to a single directory name, one-to-one.
///
/// `[a-z0-9._-]` pass through, everything else (separators, upper case,
/// non-ASCII bytes, `%` itself) becomes `%xx`. A leading `.` is escaped too,
/// so the result is never hidden. The output has no upper-case letters, so
/// distinct names stay distinct on case-insensitive filesystems.
pub fn encode_dir_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, b) in name.bytes().enumerate() {
        let plain = matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-')
            || (b == b'.' && i > 0);
        if plain {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{b:02x}");
        }
    }
    out
}

/// Resolve `name` to its own directory directly under `root`.
///
/// Without `follow_symlinks`, an existing symlink at that location is refused;
/// with it, the canonical path must stay under the canonical root.
pub fn scoped_dir(root: &Path, name: &str, policy: PathPolicy) -> Result<PathBuf> {
    validate_file_name(name)?;
    let segment = encode_dir_name(name);
    if segment.len() > MAX_SEGMENT_LEN {
        return Err(invalid(name, "name too long"));
    }
    let candidate = root.join(segment);
    if !policy.follow_symlinks {
        if let Ok(m) = std::fs::symlink_metadata(&candidate) {
            if m.file_type().is_symlink() {
                return Err(invalid(name, "symlink in chunk path (not following)"));
            }
        }
        Ok(candidate)
    } else {
        if !candidate.exists() {
            return Ok(candidate);
        }
        let root_can = std::fs::canonicalize(root)?;
        let cand_can = std::fs::canonicalize(&candidate)?;
        if !cand_can.starts_with(&root_can) {
            return Err(invalid(name, "path escapes chunk root"));
        }
        Ok(cand_can)
    }
}
