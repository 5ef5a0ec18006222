//! Bind mount descriptors and the mount table used by the container bridge.
//!
//! A bind mount exposes a host directory inside the container at a fixed
//! container path. Descriptors use the `hostPath:containerPath[:mode]` form,
//! where `mode` is `ro` or `rw` and defaults to `rw`.
//!
//! # Security Considerations
//!
//! - Container paths are compared component-wise, never by string prefix
//! - The longest matching container path wins, so a read-only mount nested in
//!   a read-write workspace stays read-only
//! - A host path that resolves through a symlink is rejected outright

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use crate::error::MountSpecError;
use crate::paths::canonical::normalize_lexically;

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    /// Returns true if writes are permitted.
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

impl std::fmt::Display for MountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "ro"),
            Self::ReadWrite => write!(f, "rw"),
        }
    }
}

/// A host directory exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Absolute host directory.
    pub host_path: PathBuf,
    /// Absolute container directory, without a trailing slash.
    pub container_path: String,
    /// Access mode.
    pub mode: MountMode,
}

impl BindMount {
    /// Creates a bind mount from already-validated parts.
    #[must_use]
    pub fn new(
        host_path: impl Into<PathBuf>,
        container_path: impl Into<String>,
        mode: MountMode,
    ) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: normalize_container_path(&container_path.into()),
            mode,
        }
    }

    /// Parses a `hostPath:containerPath[:ro|rw]` descriptor.
    ///
    /// # Errors
    ///
    /// Returns `MountSpecError::Invalid` if the descriptor is malformed, a path
    /// is relative, the mode is unknown, or the container path is `/`.
    pub fn parse(spec: &str) -> Result<Self, MountSpecError> {
        let invalid = |reason: &str| MountSpecError::Invalid {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = spec.trim().split(':').collect();
        let (host, container, mode) = match parts.as_slice() {
            [host, container] => (*host, *container, MountMode::ReadWrite),
            [host, container, mode] => {
                let mode = match mode.trim().to_ascii_lowercase().as_str() {
                    "ro" => MountMode::ReadOnly,
                    "rw" => MountMode::ReadWrite,
                    _ => return Err(invalid("mode must be ro or rw")),
                };
                (*host, *container, mode)
            }
            _ => return Err(invalid("expected hostPath:containerPath[:mode]")),
        };

        let host = host.trim();
        let container = container.trim();
        if host.is_empty() || container.is_empty() {
            return Err(invalid("host and container paths must be non-empty"));
        }
        if !host.starts_with('/') || !container.starts_with('/') {
            return Err(invalid("host and container paths must be absolute"));
        }

        let container_path = normalize_container_path(container);
        if container_path == "/" {
            return Err(invalid("container path cannot be the container root"));
        }

        Ok(Self {
            host_path: normalize_lexically(Path::new(host)),
            container_path,
            mode,
        })
    }

    /// Parses a descriptor and verifies its host path.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`BindMount::parse`] and
    /// [`BindMount::verify_host_path`].
    pub fn parse_verified(spec: &str) -> Result<Self, MountSpecError> {
        let mount = Self::parse(spec)?;
        mount.verify_host_path()?;
        Ok(mount)
    }

    /// Rejects a host path that exists but reaches its target through a symlink.
    ///
    /// Host paths that do not exist yet are accepted; the container runtime
    /// creates them as plain directories.
    ///
    /// # Errors
    ///
    /// Returns `MountSpecError::SymlinkedHostPath` if the canonical host path
    /// differs from its lexical form.
    #[instrument(skip(self), fields(host_path = %self.host_path.display()))]
    pub fn verify_host_path(&self) -> Result<(), MountSpecError> {
        if fs::symlink_metadata(&self.host_path).is_err() {
            debug!("Host path does not exist yet, nothing to verify");
            return Ok(());
        }

        let canonical = fs::canonicalize(&self.host_path).map_err(|e| MountSpecError::Invalid {
            spec: self.host_path.display().to_string(),
            reason: format!("cannot canonicalize host path: {e}"),
        })?;

        if canonical != normalize_lexically(&self.host_path) {
            warn!(
                canonical = %canonical.display(),
                "Bind mount host path resolves through a symlink"
            );
            return Err(MountSpecError::SymlinkedHostPath {
                host_path: self.host_path.clone(),
                canonical,
            });
        }

        Ok(())
    }

    /// Returns the path relative to this mount's container path, if it lies under it.
    #[must_use]
    pub fn strip_container_prefix<'a>(&self, container_path: &'a str) -> Option<&'a str> {
        strip_prefix_components(container_path, &self.container_path)
    }
}

impl std::fmt::Display for BindMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            self.mode
        )
    }
}

/// Removes trailing slashes and collapses `.`/`..` in a container path.
#[must_use]
pub fn normalize_container_path(path: &str) -> String {
    let normalized = normalize_lexically(Path::new(path));
    let text = normalized.to_string_lossy().into_owned();
    if text.is_empty() { "/".to_string() } else { text }
}

/// Component-wise prefix strip for `/`-separated container paths.
///
/// Returns the remainder without a leading slash (empty when equal).
#[must_use]
pub fn strip_prefix_components<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return path.strip_prefix('/');
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some("")
    } else {
        rest.strip_prefix('/')
    }
}

/// The set of mounts visible to the container bridge.
///
/// The workspace mount (`workspace_dir` at `container_workdir`) is always
/// present; extra bind mounts are layered on top of it.
#[derive(Debug, Clone)]
pub struct MountTable {
    mounts: Vec<BindMount>,
}

impl MountTable {
    /// Builds a table from already-parsed mounts.
    #[must_use]
    pub fn new(mounts: Vec<BindMount>) -> Self {
        let mut mounts = mounts;
        // Longest container path first so nested mounts take precedence.
        mounts.sort_by(|a, b| b.container_path.len().cmp(&a.container_path.len()));
        Self { mounts }
    }

    /// Builds a table from the workspace mount plus `host:container[:mode]` descriptors.
    ///
    /// # Errors
    ///
    /// Returns `MountSpecError` if any descriptor is invalid or has a
    /// symlinked host path.
    pub fn from_specs<S: AsRef<str>>(
        workspace: BindMount,
        specs: &[S],
    ) -> Result<Self, MountSpecError> {
        let mut mounts = vec![workspace];
        for spec in specs {
            mounts.push(BindMount::parse_verified(spec.as_ref())?);
        }
        Ok(Self::new(mounts))
    }

    /// Returns the innermost mount containing `container_path`.
    #[must_use]
    pub fn find_by_container_path(&self, container_path: &str) -> Option<&BindMount> {
        self.mounts
            .iter()
            .find(|m| m.strip_container_prefix(container_path).is_some())
    }

    /// Maps a host path under some mount's host directory to its container path.
    #[must_use]
    pub fn host_to_container(&self, host_path: &Path) -> Option<String> {
        let normalized = normalize_lexically(host_path);
        self.mounts
            .iter()
            .filter_map(|m| {
                let rest = normalized.strip_prefix(&m.host_path).ok()?;
                let rest = rest.to_string_lossy();
                Some((m.host_path.as_os_str().len(), join_container(&m.container_path, &rest)))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, path)| path)
    }

    /// Returns all mounts, innermost first.
    #[must_use]
    pub fn mounts(&self) -> &[BindMount] {
        &self.mounts
    }
}

/// Joins a relative remainder onto a container directory.
#[must_use]
pub fn join_container(base: &str, rest: &str) -> String {
    let rest = rest.trim_start_matches('/');
    if rest.is_empty() {
        base.to_string()
    } else if base.ends_with('/') {
        normalize_container_path(&format!("{base}{rest}"))
    } else {
        normalize_container_path(&format!("{base}/{rest}"))
    }
}
