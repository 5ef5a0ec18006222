//! Path containment resolution.
//!
//! Every input, whatever branch it takes, goes through the same discipline:
//! lexical normalization, a lexical containment check, symlink-resolving
//! canonicalization, then a component-wise containment check of the canonical
//! result. A path that is inside a root lexically but outside canonically was
//! redirected by a symlink that already existed on disk, and is reported as
//! such.

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace, warn};
use url::Url;

use super::canonical::{CanonicalizeError, canonicalize_lenient, is_within, normalize_lexically};
use super::roots::{AllowedRoot, os_temp_dir};
use crate::sandbox::BindMount;
use crate::sandbox::mounts::strip_prefix_components;

/// Conventional workspace path inside the agent's container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Result of resolving a raw path or URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathResolutionOutcome {
    /// A canonical host path inside an allowed root (empty for blank input).
    Contained(PathBuf),
    /// A URL this component does not govern, returned unchanged.
    Passthrough(String),
    /// The input was refused.
    Rejected(RejectReason),
}

impl PathResolutionOutcome {
    /// Returns the contained path, if any.
    #[must_use]
    pub fn contained(&self) -> Option<&Path> {
        match self {
            Self::Contained(path) => Some(path),
            _ => None,
        }
    }

    /// Returns true if the input was rejected.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Why a path was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// `file://` URL could not be parsed or carried a NUL byte or remote host.
    InvalidFileUrl,
    /// Raw path contained a NUL byte.
    InvalidPath,
    /// URL scheme other than http(s) or file.
    UnsupportedScheme { scheme: String },
    /// Lexical traversal leaves every allowed root.
    EscapesSandbox { root: PathBuf },
    /// A symlink already on disk redirects the path out of every allowed root.
    SymlinkEscape { root: PathBuf },
    /// The path could not be canonicalized, so containment cannot be proven.
    Unverifiable { detail: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFileUrl => write!(f, "invalid file URL"),
            Self::InvalidPath => write!(f, "invalid path"),
            Self::UnsupportedScheme { scheme } => write!(f, "unsupported URL scheme {scheme}"),
            Self::EscapesSandbox { root } => write!(f, "escapes sandbox ({})", root.display()),
            Self::SymlinkEscape { root } => {
                write!(f, "symlink escapes sandbox ({})", root.display())
            }
            Self::Unverifiable { detail } => write!(f, "cannot verify path: {detail}"),
        }
    }
}

/// Resolves raw agent-supplied paths against a fixed set of allowed roots.
///
/// # Example
///
/// ```no_run
/// use sandbox_authz::paths::{PathResolver, PathResolutionOutcome};
///
/// let resolver = PathResolver::new("/srv/agents/alpha");
/// match resolver.resolve("notes/today.md") {
///     PathResolutionOutcome::Contained(path) => println!("ok: {}", path.display()),
///     other => println!("refused: {other:?}"),
/// }
/// ```
#[derive(Debug, Clone)]
pub struct PathResolver {
    workspace: PathBuf,
    tmp_root: Option<PathBuf>,
    mounts: Vec<BindMount>,
    container_workdir: String,
}

impl PathResolver {
    /// Creates a resolver for `sandbox_root` with the OS temp allowance enabled.
    #[must_use]
    pub fn new(sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace: normalize_lexically(&sandbox_root.into()),
            tmp_root: Some(os_temp_dir()),
            mounts: Vec::new(),
            container_workdir: CONTAINER_WORKDIR.to_string(),
        }
    }

    /// Builds a resolver from explicit roots.
    ///
    /// Returns `None` when no `WorkspaceRoot` is present. Without a `TmpRoot`
    /// the temp-file allowance is disabled.
    #[must_use]
    pub fn from_roots(roots: impl IntoIterator<Item = AllowedRoot>) -> Option<Self> {
        let mut workspace = None;
        let mut tmp_root = None;
        let mut mounts = Vec::new();
        for root in roots {
            match root {
                AllowedRoot::WorkspaceRoot(path) => workspace = Some(path),
                AllowedRoot::TmpRoot(path) => tmp_root = Some(normalize_lexically(&path)),
                AllowedRoot::BindMount(mount) => mounts.push(mount),
            }
        }
        let mut resolver = Self::new(workspace?);
        resolver.tmp_root = tmp_root;
        for mount in mounts {
            resolver = resolver.with_bind_mount(mount);
        }
        Some(resolver)
    }

    /// Overrides the temp directory allowance.
    #[must_use]
    pub fn with_tmp_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.tmp_root = Some(normalize_lexically(&path.into()));
        self
    }

    /// Disables the temp directory allowance.
    #[must_use]
    pub fn without_tmp_root(mut self) -> Self {
        self.tmp_root = None;
        self
    }

    /// Adds a bind mount whose container paths remap to its host directory.
    #[must_use]
    pub fn with_bind_mount(mut self, mount: BindMount) -> Self {
        self.mounts.push(mount);
        self.mounts
            .sort_by(|a, b| b.container_path.len().cmp(&a.container_path.len()));
        self
    }

    /// Sets the in-container workspace prefix remapped onto the sandbox root.
    #[must_use]
    pub fn with_container_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.container_workdir = crate::sandbox::mounts::normalize_container_path(&workdir.into());
        self
    }

    /// Returns the sandbox root.
    #[must_use]
    pub fn sandbox_root(&self) -> &Path {
        &self.workspace
    }

    /// Returns the configured roots.
    #[must_use]
    pub fn roots(&self) -> Vec<AllowedRoot> {
        let mut roots = vec![AllowedRoot::WorkspaceRoot(self.workspace.clone())];
        if let Some(tmp) = &self.tmp_root {
            roots.push(AllowedRoot::TmpRoot(tmp.clone()));
        }
        roots.extend(self.mounts.iter().cloned().map(AllowedRoot::BindMount));
        roots
    }

    /// Resolves a raw path or URL.
    #[instrument(skip(self), fields(sandbox_root = %self.workspace.display()))]
    pub fn resolve(&self, raw: &str) -> PathResolutionOutcome {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return PathResolutionOutcome::Contained(PathBuf::new());
        }

        let outcome = match url_scheme(trimmed) {
            Some(scheme)
                if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") =>
            {
                trace!("Passing through network URL");
                return PathResolutionOutcome::Passthrough(raw.to_string());
            }
            Some(scheme) if scheme.eq_ignore_ascii_case("file") => match parse_file_url(trimmed) {
                Some(path) => self.resolve_absolute(&path),
                None => PathResolutionOutcome::Rejected(RejectReason::InvalidFileUrl),
            },
            Some(scheme) => PathResolutionOutcome::Rejected(RejectReason::UnsupportedScheme {
                scheme: scheme.to_ascii_lowercase(),
            }),
            None if trimmed.contains('\0') => {
                PathResolutionOutcome::Rejected(RejectReason::InvalidPath)
            }
            None => {
                let path = Path::new(trimmed);
                if path.is_absolute() {
                    self.resolve_absolute(path)
                } else {
                    let candidate = self.workspace.join(path);
                    self.check_contained(&candidate, &[&self.workspace])
                }
            }
        };

        match &outcome {
            PathResolutionOutcome::Rejected(reason) => {
                warn!(reason = %reason, "Path rejected");
            }
            PathResolutionOutcome::Contained(path) => {
                debug!(resolved = %path.display(), "Path contained");
            }
            PathResolutionOutcome::Passthrough(_) => {}
        }
        outcome
    }

    fn resolve_absolute(&self, path: &Path) -> PathResolutionOutcome {
        let normalized = normalize_lexically(path);

        if let Some(tmp) = &self.tmp_root
            && is_within(&normalized, tmp)
        {
            return self.check_tmp(normalized, tmp);
        }

        if is_within(&normalized, &self.workspace) {
            return self.check_contained(&normalized, &[&self.workspace]);
        }

        // Explicit mounts first: one may be nested under the container workdir.
        let text = normalized.to_string_lossy();
        for mount in &self.mounts {
            if let Some(rest) = mount.strip_container_prefix(&text) {
                trace!(mount = %mount, rest, "Remapping bind mount path");
                let candidate = mount.host_path.join(rest);
                return self.check_contained(&candidate, &[&mount.host_path]);
            }
        }

        if let Some(rest) = strip_prefix_components(&text, &self.container_workdir) {
            trace!(rest, "Remapping container workspace path");
            let candidate = self.workspace.join(rest);
            return self.check_contained(&candidate, &[&self.workspace]);
        }

        let mut roots: Vec<&Path> = vec![&self.workspace];
        roots.extend(self.mounts.iter().map(|m| m.host_path.as_path()));
        self.check_contained(&normalized, &roots)
    }

    /// Temp paths are returned as given once their canonical form stays in the temp tree.
    fn check_tmp(&self, normalized: PathBuf, tmp: &Path) -> PathResolutionOutcome {
        match self.check_contained(&normalized, &[tmp]) {
            PathResolutionOutcome::Contained(_) => PathResolutionOutcome::Contained(normalized),
            other => other,
        }
    }

    fn check_contained(&self, candidate: &Path, roots: &[&Path]) -> PathResolutionOutcome {
        let lexical = normalize_lexically(candidate);
        let first_root = roots.first().map(|r| r.to_path_buf()).unwrap_or_default();

        let mut canonical_roots = Vec::with_capacity(roots.len());
        for root in roots {
            match canonicalize_lenient(root) {
                Ok(canonical) => canonical_roots.push(canonical),
                Err(err) => {
                    return PathResolutionOutcome::Rejected(RejectReason::Unverifiable {
                        detail: describe(&err, root),
                    });
                }
            }
        }

        let lexically_inside = roots
            .iter()
            .any(|root| is_within(&lexical, root))
            || canonical_roots.iter().any(|root| is_within(&lexical, root));
        if !lexically_inside {
            return PathResolutionOutcome::Rejected(RejectReason::EscapesSandbox {
                root: first_root,
            });
        }

        let canonical = match canonicalize_lenient(&lexical) {
            Ok(canonical) => canonical,
            Err(CanonicalizeError::DanglingSymlink(link)) => {
                debug!(link = %link.display(), "Dangling symlink on path");
                return PathResolutionOutcome::Rejected(RejectReason::SymlinkEscape {
                    root: first_root,
                });
            }
            Err(err) => {
                return PathResolutionOutcome::Rejected(RejectReason::Unverifiable {
                    detail: describe(&err, &lexical),
                });
            }
        };

        match canonical_roots.iter().find(|root| is_within(&canonical, root)) {
            Some(_) => PathResolutionOutcome::Contained(canonical),
            None => PathResolutionOutcome::Rejected(RejectReason::SymlinkEscape {
                root: first_root,
            }),
        }
    }
}

/// Resolves `raw` against `sandbox_root` plus the OS temp directory.
pub fn resolve(raw: &str, sandbox_root: &Path) -> PathResolutionOutcome {
    PathResolver::new(sandbox_root).resolve(raw)
}

fn describe(err: &CanonicalizeError, path: &Path) -> String {
    match err {
        CanonicalizeError::DanglingSymlink(link) => {
            format!("dangling symlink {}", link.display())
        }
        CanonicalizeError::Io(e) => format!("{}: {}", path.display(), e.kind()),
    }
}

/// Returns the scheme of a `scheme://...` input.
fn url_scheme(input: &str) -> Option<&str> {
    let (scheme, _) = input.split_once("://")?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    chars
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        .then_some(scheme)
}

/// Parses a local `file://` URL into an absolute path.
fn parse_file_url(input: &str) -> Option<PathBuf> {
    if input.contains('\0') {
        return None;
    }
    let url = Url::parse(input).ok()?;
    match url.host_str() {
        None | Some("") | Some("localhost") => {}
        Some(_) => return None,
    }
    let path = url.to_file_path().ok()?;
    if path.as_os_str().as_bytes().contains(&0) {
        return None;
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_scheme_detection() {
        assert_eq!(url_scheme("https://example.com"), Some("https"));
        assert_eq!(url_scheme("file:///tmp/a"), Some("file"));
        assert_eq!(url_scheme("s3+x://bucket"), Some("s3+x"));
        assert_eq!(url_scheme("notes/a://b"), None);
        assert_eq!(url_scheme("plain/path"), None);
    }

    #[test]
    fn test_parse_file_url() {
        assert_eq!(parse_file_url("file:///tmp/a%20b.png"), Some(PathBuf::from("/tmp/a b.png")));
        assert_eq!(parse_file_url("file://localhost/tmp/x"), Some(PathBuf::from("/tmp/x")));
        assert_eq!(parse_file_url("file:///tmp/a%00b"), None);
        assert_eq!(parse_file_url("file://evil.example/tmp/x"), None);
    }

    #[test]
    fn test_reject_reason_messages() {
        assert_eq!(RejectReason::InvalidFileUrl.to_string(), "invalid file URL");
        assert!(
            RejectReason::EscapesSandbox { root: PathBuf::from("/srv") }
                .to_string()
                .starts_with("escapes sandbox")
        );
    }

    #[test]
    fn test_from_roots_requires_workspace() {
        let tmp_only = vec![AllowedRoot::TmpRoot(PathBuf::from("/tmp"))];
        assert!(PathResolver::from_roots(tmp_only).is_none());
        let workspace = vec![AllowedRoot::WorkspaceRoot(PathBuf::from("/srv/a"))];
        let resolver = PathResolver::from_roots(workspace).expect("workspace root present");
        assert_eq!(resolver.roots().len(), 1);
    }
}
