//! Error types for the sandbox authorization pipeline.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//!
//! Every component reports failures in the same four classes:
//!
//! - **Path**: the input does not resolve to an existing filesystem object.
//! - **Validation**: the object exists but fails a security or shape invariant.
//! - **Io**: the underlying syscall or transport failed unexpectedly.
//! - **PermissionDenied**: bridge-only, a containment or read-only mount violation.
//!
//! Error messages name the violated root, mount or field but never carry file
//! contents or command payloads.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the crate.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Verified file open failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Open(#[from] OpenError),

    /// Container filesystem bridge failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Bridge(#[from] BridgeError),

    /// Configuration could not be loaded
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// Bind mount descriptor could not be parsed
    #[error(transparent)]
    #[diagnostic(transparent)]
    MountSpec(#[from] MountSpecError),

    /// Path was rejected by the containment resolver
    #[error("path rejected: {0}")]
    #[diagnostic(code(authz::path::rejected))]
    PathRejected(crate::paths::RejectReason),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(authz::io))]
    Io(#[from] std::io::Error),
}

/// Coarse failure class shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Path,
    Validation,
    Io,
    PermissionDenied,
}

impl Error {
    /// Returns the failure class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Open(e) => e.class(),
            Self::Bridge(e) => e.class(),
            Self::Config(_) | Self::MountSpec(_) | Self::PathRejected(_) => ErrorClass::Validation,
            Self::Io(_) => ErrorClass::Io,
        }
    }
}

/// Why an existing file was refused by a verified open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenViolation {
    /// The literal path is a symlink and symlinks were disallowed.
    SymlinkPath,
    /// The object is not a regular file.
    NotRegularFile,
    /// The file is larger than the configured limit.
    TooLarge { size: u64, limit: u64 },
    /// The opened descriptor does not refer to the object that was checked.
    IdentityMismatch,
    /// A symlink appeared at the path between the check and the open.
    SymlinkSwapped,
    /// The real path lies outside the required root.
    OutsideRoot { root: PathBuf },
}

impl std::fmt::Display for OpenViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SymlinkPath => write!(f, "path is a symlink"),
            Self::NotRegularFile => write!(f, "not a regular file"),
            Self::TooLarge { size, limit } => {
                write!(f, "file size {size} exceeds limit of {limit} bytes")
            }
            Self::IdentityMismatch => write!(f, "file changed between check and open"),
            Self::SymlinkSwapped => write!(f, "symlink appeared between check and open"),
            Self::OutsideRoot { root } => write!(f, "real path is outside {}", root.display()),
        }
    }
}

/// Errors from [`crate::fs::open_verified`].
#[derive(Error, Debug, Diagnostic)]
pub enum OpenError {
    /// File is missing or a path component is not a directory
    #[error("path not found: {path}")]
    #[diagnostic(code(authz::open::path))]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File exists but was refused
    #[error("refused to open {path}: {violation}")]
    #[diagnostic(
        code(authz::open::validation),
        help("the file must be a regular, non-symlinked file inside the allowed root")
    )]
    Validation {
        path: PathBuf,
        violation: OpenViolation,
    },

    /// Unexpected syscall failure
    #[error("I/O error opening {path}")]
    #[diagnostic(code(authz::open::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OpenError {
    /// Returns the failure class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Path { .. } => ErrorClass::Path,
            Self::Validation { .. } => ErrorClass::Validation,
            Self::Io { .. } => ErrorClass::Io,
        }
    }

    /// Returns the violation for validation failures.
    #[must_use]
    pub fn violation(&self) -> Option<&OpenViolation> {
        match self {
            Self::Validation { violation, .. } => Some(violation),
            _ => None,
        }
    }
}

/// Why the bridge refused an operation without running it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeDenial {
    /// Write-role operation targets a mount declared read-only.
    ReadOnlyMount { mount: String },
    /// Path is not under any configured mount.
    OutsideMounts,
    /// Container-side canonicalization left every allowed mount.
    CanonicalEscape { canonical: String },
    /// Removing or renaming a mount point itself.
    MountRoot { mount: String },
}

impl std::fmt::Display for BridgeDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnlyMount { mount } => write!(f, "read-only mount {mount}"),
            Self::OutsideMounts => write!(f, "path is outside every sandbox mount"),
            Self::CanonicalEscape { canonical } => {
                write!(f, "path resolves to {canonical}, outside every sandbox mount")
            }
            Self::MountRoot { mount } => write!(f, "cannot remove or rename mount point {mount}"),
        }
    }
}

/// Errors from the container filesystem bridge.
#[derive(Error, Debug, Diagnostic)]
pub enum BridgeError {
    /// Target does not exist in the container
    #[error("no such file in sandbox: {path}")]
    #[diagnostic(code(authz::bridge::path))]
    Path { path: String },

    /// Path is malformed
    #[error("invalid sandbox path {path:?}: {reason}")]
    #[diagnostic(code(authz::bridge::validation))]
    Validation { path: String, reason: String },

    /// Containment or read-only violation
    #[error("permission denied for {path}: {denial}")]
    #[diagnostic(
        code(authz::bridge::permission_denied),
        help("check the sandbox bind mounts and their ro/rw modes")
    )]
    PermissionDenied { path: String, denial: BridgeDenial },

    /// Remote command or transport failure
    #[error("sandbox {operation} failed: {detail}")]
    #[diagnostic(code(authz::bridge::io))]
    Io { operation: &'static str, detail: String },

    /// Transport could not run the command at all
    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

impl BridgeError {
    /// Returns the failure class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Path { .. } => ErrorClass::Path,
            Self::Validation { .. } => ErrorClass::Validation,
            Self::PermissionDenied { .. } => ErrorClass::PermissionDenied,
            Self::Io { .. } | Self::Transport(_) => ErrorClass::Io,
        }
    }
}

/// Errors raised by an exec transport.
#[derive(Error, Debug, Diagnostic)]
pub enum TransportError {
    /// Failed to spawn the exec client
    #[error("failed to spawn {program}: {source}")]
    #[diagnostic(
        code(authz::transport::spawn),
        help("make sure the container CLI is installed and on the configured path")
    )]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Command exceeded its timeout
    #[error("command timed out after {timeout_ms}ms")]
    #[diagnostic(code(authz::transport::timeout))]
    Timeout { timeout_ms: u128 },

    /// Generic transport failure
    #[error("transport failure: {0}")]
    #[diagnostic(code(authz::transport::failed))]
    Failed(String),
}

/// Errors related to loading configuration.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// Failed to read a configuration file
    #[error("failed to read config: {context}")]
    #[diagnostic(code(authz::config::read))]
    Read {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for the expected schema
    #[error("invalid config {path}: {source}")]
    #[diagnostic(
        code(authz::config::parse),
        help("expected keys: safeBins, safeBinProfiles, safeBinTrustedDirs")
    )]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors related to bind mount descriptors.
#[derive(Error, Debug, Diagnostic, PartialEq, Eq)]
pub enum MountSpecError {
    /// Descriptor is not `host:container[:mode]`
    #[error("invalid bind mount {spec:?}: {reason}")]
    #[diagnostic(
        code(authz::mount::invalid),
        help("use hostPath:containerPath or hostPath:containerPath:ro|rw")
    )]
    Invalid { spec: String, reason: String },

    /// Host path has a symlink component
    #[error("bind mount host path {host_path} resolves through a symlink to {canonical}")]
    #[diagnostic(
        code(authz::mount::symlinked_host),
        help("point the mount at the real directory instead of a symlink")
    )]
    SymlinkedHostPath { host_path: PathBuf, canonical: PathBuf },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
