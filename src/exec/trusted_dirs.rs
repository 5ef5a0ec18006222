//! Trusted safe-bin directories and their signature-keyed cache.
//!
//! # Security Considerations
//!
//! The trusted set is built only from a fixed baseline plus directories named
//! explicitly in configuration. `PATH` is never consulted, so dropping a binary
//! into a writable directory on the search path does not make it trusted.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, instrument, trace};

use crate::paths::canonical::normalize_lexically;

/// Conventional system and package-manager bin directories.
pub const DEFAULT_TRUSTED_DIRS: &[&str] = &[
    "/bin",
    "/usr/bin",
    "/usr/local/bin",
    "/opt/homebrew/bin",
    "/opt/local/bin",
    "/snap/bin",
    "/run/current-system/sw/bin",
];

/// Immutable set of canonical absolute directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedBinDirSet {
    dirs: BTreeSet<PathBuf>,
}

impl TrustedBinDirSet {
    /// Builds the set from normalized directory entries, resolving symlinks
    /// where the directory exists.
    fn build(entries: &[String]) -> Self {
        let dirs = entries
            .iter()
            .map(|entry| {
                let path = PathBuf::from(entry);
                std::fs::canonicalize(&path).unwrap_or(path)
            })
            .collect();
        Self { dirs }
    }

    /// Returns `true` if `dir` is a member.
    #[must_use]
    pub fn contains(&self, dir: &Path) -> bool {
        self.dirs.contains(dir)
    }

    /// Returns `true` if the parent of an already canonical executable path
    /// is a member.
    #[must_use]
    pub fn contains_executable(&self, canonical: &Path) -> bool {
        canonical.parent().is_some_and(|parent| self.contains(parent))
    }

    /// Iterates over the directories in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.dirs.iter().map(PathBuf::as_path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

/// Normalizes configured directories into the cache signature.
///
/// Entries are trimmed, blanks dropped, made absolute, lexically normalized,
/// deduplicated, sorted, and serialized to JSON.
#[must_use]
pub fn trusted_dirs_signature<S: AsRef<str>>(extra_dirs: &[S]) -> String {
    serde_json::to_string(&signature_entries(extra_dirs)).unwrap_or_default()
}

fn signature_entries<S: AsRef<str>>(extra_dirs: &[S]) -> Vec<String> {
    let entries: BTreeSet<String> = DEFAULT_TRUSTED_DIRS
        .iter()
        .copied()
        .chain(extra_dirs.iter().map(AsRef::as_ref))
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .map(|dir| {
            let path = Path::new(dir);
            let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
            normalize_lexically(&absolute).to_string_lossy().into_owned()
        })
        .collect();
    entries.into_iter().collect()
}

type CacheEntry = (String, Arc<TrustedBinDirSet>);

/// Signature-keyed cache of the trusted directory set.
///
/// Owned by an authorization context rather than living in a global, so
/// independent contexts (and tests) never share state. A refresh builds a new
/// set and swaps the `Arc`; readers holding the old one are unaffected.
#[derive(Debug, Default)]
pub struct TrustedDirCache {
    entry: RwLock<Option<CacheEntry>>,
}

impl TrustedDirCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the trusted directory set for the baseline plus `extra_dirs`.
    ///
    /// The same signature returns the same `Arc`; a changed signature or
    /// `force_refresh` rebuilds it.
    #[instrument(skip(self, extra_dirs), fields(extra = extra_dirs.len()))]
    pub fn get_trusted_safe_bin_dirs<S: AsRef<str>>(
        &self,
        extra_dirs: &[S],
        force_refresh: bool,
    ) -> Arc<TrustedBinDirSet> {
        let entries = signature_entries(extra_dirs);
        let signature = serde_json::to_string(&entries).unwrap_or_default();

        if !force_refresh {
            let guard = self.entry.read().unwrap_or_else(PoisonError::into_inner);
            if let Some((cached_signature, set)) = guard.as_ref()
                && *cached_signature == signature
            {
                trace!("Trusted directory cache hit");
                return Arc::clone(set);
            }
        }

        let set = Arc::new(TrustedBinDirSet::build(&entries));
        debug!(dirs = set.len(), force_refresh, "Rebuilt trusted directory set");
        let mut guard = self.entry.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some((signature, Arc::clone(&set)));
        set
    }
}

/// Returns `true` if the executable's canonical parent directory is trusted.
///
/// The executable is canonicalized first, so a symlink in a trusted directory
/// pointing elsewhere is judged by where it lands.
#[must_use]
pub fn is_trusted_path(resolved_path: &Path, trusted_dirs: &TrustedBinDirSet) -> bool {
    let Ok(canonical) = std::fs::canonicalize(resolved_path) else {
        trace!(path = %resolved_path.display(), "Executable does not resolve");
        return false;
    };
    trusted_dirs.contains_executable(&canonical)
}
