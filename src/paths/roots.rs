//! Allowed roots a resolved path may live under.

use std::path::{Path, PathBuf};

use crate::sandbox::BindMount;

/// A directory subtree that contained paths may resolve into.
///
/// Roots are always supplied by the caller; none are derived from the
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedRoot {
    /// The agent's host-side sandbox workspace.
    WorkspaceRoot(PathBuf),
    /// Temp directory used for ephemeral media interchange.
    TmpRoot(PathBuf),
    /// A host directory exposed in the container at `container_path`.
    BindMount(BindMount),
}

impl AllowedRoot {
    /// Returns the host directory this root covers.
    #[must_use]
    pub fn host_path(&self) -> &Path {
        match self {
            Self::WorkspaceRoot(path) | Self::TmpRoot(path) => path,
            Self::BindMount(mount) => &mount.host_path,
        }
    }
}

/// The OS temp directory used for the temp-file allowance.
///
/// Fixed to `/tmp` on Unix so that `TMPDIR` cannot widen the allowance.
#[must_use]
pub fn os_temp_dir() -> PathBuf {
    if cfg!(unix) {
        PathBuf::from("/tmp")
    } else {
        std::env::temp_dir()
    }
}
