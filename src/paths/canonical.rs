//! Lexical normalization and symlink-resolving canonicalization helpers.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Normalizes `.` and `..` components without touching the filesystem.
///
/// `..` at the root stays at the root. Relative inputs stay relative, with
/// leading `..` components preserved.
#[must_use]
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = out.has_root() && out.parent().is_none();
                let ends_with_parent =
                    matches!(out.components().next_back(), Some(Component::ParentDir));
                if at_root {
                    continue;
                }
                if out.as_os_str().is_empty() || ends_with_parent {
                    out.push("..");
                } else {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Failure to canonicalize a path.
#[derive(Debug)]
pub enum CanonicalizeError {
    /// An existing entry on the path is a symlink that does not resolve.
    DanglingSymlink(PathBuf),
    /// Any other filesystem error.
    Io(io::Error),
}

/// Returns true for errors meaning "this path does not exist (yet)".
pub(crate) fn is_missing(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(nix::libc::ENOTDIR)
}

/// Canonicalizes an absolute, lexically normalized path that may not exist.
///
/// The longest existing ancestor is resolved with `realpath` and the missing
/// tail is appended unchanged. An entry that exists but cannot be resolved is a
/// dangling symlink and is reported as such, since its eventual target cannot
/// be checked.
pub fn canonicalize_lenient(path: &Path) -> Result<PathBuf, CanonicalizeError> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();

    loop {
        match fs::canonicalize(&existing) {
            Ok(mut canonical) => {
                for part in tail.iter().rev() {
                    canonical.push(part);
                }
                return Ok(canonical);
            }
            Err(err) if is_missing(&err) => {
                if fs::symlink_metadata(&existing).is_ok() {
                    return Err(CanonicalizeError::DanglingSymlink(existing));
                }
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Err(CanonicalizeError::Io(err));
                };
                tail.push(name);
                if !existing.pop() {
                    return Err(CanonicalizeError::Io(err));
                }
            }
            Err(err) => return Err(CanonicalizeError::Io(err)),
        }
    }
}

/// Returns true if `path` equals `root` or lies beneath it (component-wise).
#[must_use]
pub fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}
