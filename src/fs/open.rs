//! Symlink-race-resistant file opening.
//!
//! The checked object and the opened descriptor must be the same inode:
//!
//! 1. optional `lstat` of the literal path (no symlink allowed)
//! 2. `realpath`, then `lstat` of the real path (regular file, size limit)
//! 3. `open` with `O_NOFOLLOW`
//! 4. `fstat` of the descriptor (regular file, size limit)
//! 5. identity check between step 2 and step 4
//!
//! A symlink swapped in between steps 2 and 3 either makes the open fail with
//! `ELOOP` or yields a descriptor whose identity differs; both are refusals.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use tracing::{debug, instrument, warn};

use crate::error::{OpenError, OpenViolation};
use crate::paths::canonical::is_within;

/// Options for [`open_verified`].
#[derive(Debug, Clone, Default)]
pub struct VerifiedOpenOptions {
    /// Already-canonicalized path; skips the `realpath` step when set.
    pub resolved_path: Option<PathBuf>,
    /// Refuse when the literal input path is itself a symlink.
    pub reject_path_symlink: bool,
    /// Maximum accepted file size in bytes.
    pub max_bytes: Option<u64>,
    /// Root the real path must stay inside.
    pub root: Option<PathBuf>,
}

impl VerifiedOpenOptions {
    /// Creates default options (no limit, symlinks followed to a real path).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an already-resolved real path.
    #[must_use]
    pub fn with_resolved_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolved_path = Some(path.into());
        self
    }

    /// Refuses a literal path that is a symlink.
    #[must_use]
    pub fn reject_path_symlink(mut self) -> Self {
        self.reject_path_symlink = true;
        self
    }

    /// Sets the maximum file size.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Requires the real path to be inside `root`.
    #[must_use]
    pub fn within_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }
}

/// An open descriptor whose identity matched the checked path.
///
/// The descriptor is closed when this value is dropped.
#[derive(Debug)]
pub struct VerifiedFile {
    /// Real path that was opened.
    pub path: PathBuf,
    /// The open descriptor.
    pub file: File,
    /// `fstat` of the descriptor.
    pub metadata: Metadata,
    max_bytes: Option<u64>,
}

impl VerifiedFile {
    /// Reads the whole file, enforcing the size limit on bytes actually read.
    ///
    /// # Errors
    ///
    /// Returns `OpenError::Validation` if the file grew past the limit, or
    /// `OpenError::Io` if reading fails.
    pub fn read_to_end_limited(mut self) -> Result<Vec<u8>, OpenError> {
        let mut buf = Vec::with_capacity(usize::try_from(self.metadata.len()).unwrap_or(0));
        let read_result = match self.max_bytes {
            Some(limit) => (&mut self.file)
                .take(limit.saturating_add(1))
                .read_to_end(&mut buf),
            None => self.file.read_to_end(&mut buf),
        };
        read_result.map_err(|source| OpenError::Io {
            path: self.path.clone(),
            source,
        })?;

        if let Some(limit) = self.max_bytes
            && buf.len() as u64 > limit
        {
            return Err(OpenError::Validation {
                path: self.path,
                violation: OpenViolation::TooLarge {
                    size: buf.len() as u64,
                    limit,
                },
            });
        }
        Ok(buf)
    }
}

/// Opens `file_path` only if the opened descriptor is the regular file that was checked.
///
/// # Errors
///
/// - `OpenError::Path` if the file or an intermediate directory is missing
/// - `OpenError::Validation` for symlinks, non-regular files, size or root
///   violations, and identity mismatches
/// - `OpenError::Io` for any other failure
#[instrument(skip(options), fields(path = %file_path.display(), max_bytes = ?options.max_bytes))]
pub fn open_verified(
    file_path: &Path,
    options: &VerifiedOpenOptions,
) -> Result<VerifiedFile, OpenError> {
    let result = open_verified_inner(file_path, options);
    if let Err(err) = &result {
        warn!(error = %err, "Verified open refused");
    }
    result
}

fn open_verified_inner(
    file_path: &Path,
    options: &VerifiedOpenOptions,
) -> Result<VerifiedFile, OpenError> {
    let refuse = |path: &Path, violation: OpenViolation| OpenError::Validation {
        path: path.to_path_buf(),
        violation,
    };

    if options.reject_path_symlink {
        let literal = fs::symlink_metadata(file_path).map_err(|e| classify(file_path, e))?;
        if literal.file_type().is_symlink() {
            return Err(refuse(file_path, OpenViolation::SymlinkPath));
        }
    }

    let real_path = match &options.resolved_path {
        Some(resolved) => resolved.clone(),
        None => fs::canonicalize(file_path).map_err(|e| classify(file_path, e))?,
    };

    if let Some(root) = &options.root {
        let canonical_root = fs::canonicalize(root).map_err(|e| classify(root, e))?;
        if !is_within(&real_path, &canonical_root) {
            return Err(refuse(&real_path, OpenViolation::OutsideRoot { root: canonical_root }));
        }
    }

    let pre_open = fs::symlink_metadata(&real_path).map_err(|e| classify(&real_path, e))?;
    check_shape(&real_path, &pre_open, options.max_bytes)?;

    let file = OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).bits())
        .open(&real_path)
        .map_err(|e| {
            if e.raw_os_error() == Some(nix::libc::ELOOP) {
                refuse(&real_path, OpenViolation::SymlinkSwapped)
            } else {
                classify(&real_path, e)
            }
        })?;

    // From here on `file` is dropped (closed) on every early return.
    let post_open = file.metadata().map_err(|e| classify(&real_path, e))?;
    check_shape(&real_path, &post_open, options.max_bytes)?;

    if !same_file(&pre_open, &post_open) {
        return Err(refuse(&real_path, OpenViolation::IdentityMismatch));
    }

    debug!(real_path = %real_path.display(), size = post_open.len(), "Verified open succeeded");
    Ok(VerifiedFile {
        path: real_path,
        file,
        metadata: post_open,
        max_bytes: options.max_bytes,
    })
}

fn check_shape(path: &Path, metadata: &Metadata, max_bytes: Option<u64>) -> Result<(), OpenError> {
    if !metadata.file_type().is_file() {
        return Err(OpenError::Validation {
            path: path.to_path_buf(),
            violation: OpenViolation::NotRegularFile,
        });
    }
    if let Some(limit) = max_bytes
        && metadata.len() > limit
    {
        return Err(OpenError::Validation {
            path: path.to_path_buf(),
            violation: OpenViolation::TooLarge {
                size: metadata.len(),
                limit,
            },
        });
    }
    Ok(())
}

/// Device + inode identity; inode only when either side reports device 0.
#[must_use]
pub fn same_file(a: &Metadata, b: &Metadata) -> bool {
    same_identity((a.dev(), a.ino()), (b.dev(), b.ino()))
}

fn same_identity((dev_a, ino_a): (u64, u64), (dev_b, ino_b): (u64, u64)) -> bool {
    if dev_a == 0 || dev_b == 0 {
        return ino_a == ino_b;
    }
    dev_a == dev_b && ino_a == ino_b
}

/// Missing objects are `Path`; everything else is `Io`.
fn classify(path: &Path, source: io::Error) -> OpenError {
    let missing = source.kind() == io::ErrorKind::NotFound
        || matches!(
            source.raw_os_error(),
            Some(code) if code == nix::libc::ENOENT
                || code == nix::libc::ENOTDIR
                || code == nix::libc::ELOOP
        );
    if missing {
        OpenError::Path {
            path: path.to_path_buf(),
            source,
        }
    } else {
        OpenError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_same_identity_falls_back_to_inode() {
        assert!(same_identity((5, 42), (5, 42)));
        assert!(!same_identity((5, 42), (6, 42)));
        assert!(same_identity((0, 42), (6, 42)));
        assert!(!same_identity((0, 42), (0, 43)));
    }

    #[test]
    fn test_opens_regular_file() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("hello.txt");
        fs::write(&path, b"hello").expect("write");

        let opened = open_verified(&path, &VerifiedOpenOptions::new()).expect("open");
        assert_eq!(opened.metadata.len(), 5);
        assert_eq!(opened.read_to_end_limited().expect("read"), b"hello");
    }

    #[test]
    fn test_missing_file_is_path_class() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let err = open_verified(&dir.path().join("nope.txt"), &VerifiedOpenOptions::new())
            .expect_err("missing file");
        assert_eq!(err.class(), ErrorClass::Path);
    }

    #[test]
    fn test_missing_intermediate_directory_is_path_class() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let file = dir.path().join("file.txt");
        fs::write(&file, b"x").expect("write");

        let err = open_verified(&file.join("child"), &VerifiedOpenOptions::new())
            .expect_err("file used as directory");
        assert_eq!(err.class(), ErrorClass::Path);
    }

    #[test]
    fn test_directory_is_validation_class() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let err = open_verified(dir.path(), &VerifiedOpenOptions::new()).expect_err("directory");
        assert_eq!(err.violation(), Some(&OpenViolation::NotRegularFile));
    }

    #[test]
    fn test_size_limit() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("big.bin");
        fs::write(&path, vec![0u8; 64]).expect("write");

        let err = open_verified(&path, &VerifiedOpenOptions::new().with_max_bytes(16))
            .expect_err("too large");
        assert_eq!(
            err.violation(),
            Some(&OpenViolation::TooLarge { size: 64, limit: 16 })
        );

        assert!(open_verified(&path, &VerifiedOpenOptions::new().with_max_bytes(64)).is_ok());
    }

    #[test]
    fn test_rejects_literal_symlink_when_asked() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let target = dir.path().join("target.txt");
        fs::write(&target, b"data").expect("write");
        let link = dir.path().join("link.txt");
        symlink(&target, &link).expect("symlink");

        let err = open_verified(&link, &VerifiedOpenOptions::new().reject_path_symlink())
            .expect_err("symlink refused");
        assert_eq!(err.violation(), Some(&OpenViolation::SymlinkPath));

        // Without the flag the symlink is followed to its real path.
        let opened = open_verified(&link, &VerifiedOpenOptions::new()).expect("followed");
        assert_eq!(opened.path, fs::canonicalize(&target).expect("canonicalize"));
    }

    #[test]
    fn test_resolved_path_pointing_at_symlink_is_refused() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let target = dir.path().join("target.txt");
        fs::write(&target, b"data").expect("write");
        let link = dir.path().join("link.txt");
        symlink(&target, &link).expect("symlink");

        // A stale resolved path that is now a symlink fails the regular-file check.
        let err = open_verified(&link, &VerifiedOpenOptions::new().with_resolved_path(&link))
            .expect_err("symlink as resolved path");
        assert_eq!(err.class(), ErrorClass::Validation);
    }
}
