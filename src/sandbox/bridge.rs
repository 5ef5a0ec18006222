//! Filesystem operations inside a container over an exec transport.
//!
//! Every operation follows the same pipeline:
//!
//! 1. Map the requested path to a container path (relative paths resolve
//!    against the container workdir, host paths under a mount are translated).
//! 2. Check the lexical container path against the mount table. Write-role
//!    targets under a read-only mount are refused here, before any remote call.
//! 3. One remote round trip canonicalizes every target (`readlink -f` on the
//!    longest existing ancestor).
//! 4. Each canonical result must lie under a mount (a writable one for write
//!    roles). Only then is the content-bearing command issued.
//!
//! Scripts always start with `set -eu;` and avoid `pipefail`, which POSIX `sh`
//! does not have.

use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, trace, warn};

use super::config::BridgeConfig;
use super::mounts::{MountTable, join_container, normalize_container_path};
use super::transport::{CommandOutput, ExecRequest, ExecTransport};
use crate::error::{BridgeDenial, BridgeError, MountSpecError};

const CANONICALIZE_SCRIPT: &str = r#"set -eu;
while [ "$#" -gt 1 ]; do
  mode="$1"; target="$2"; shift 2
  leaf=""
  probe="$target"
  if [ "$mode" = parent ]; then
    leaf=$(basename -- "$target")
    probe=$(dirname -- "$target")
  fi
  suffix=""
  while [ ! -e "$probe" ] && [ ! -L "$probe" ]; do
    parent=$(dirname -- "$probe")
    if [ "$parent" = "$probe" ]; then break; fi
    suffix="/$(basename -- "$probe")$suffix"
    probe="$parent"
  done
  resolved=$(readlink -f -- "$probe")
  if [ -n "$leaf" ]; then suffix="$suffix/$leaf"; fi
  printf '%s%s\n' "$resolved" "$suffix"
done"#;

const READ_SCRIPT: &str = r#"set -eu; cat -- "$1""#;

const WRITE_SCRIPT: &str = r#"set -eu;
dir=$(dirname -- "$1")
if [ "$2" = 1 ]; then mkdir -p -- "$dir"; fi
tmp=$(mktemp "$dir/.sandbox-fs-write.XXXXXX")
if ! cat >"$tmp"; then rm -f -- "$tmp"; exit 1; fi
mv -f -T -- "$tmp" "$1""#;

const MKDIRP_SCRIPT: &str = r#"set -eu; mkdir -p -- "$1""#;

const RENAME_SCRIPT: &str = r#"set -eu; mkdir -p -- "$(dirname -- "$2")"; mv -T -- "$1" "$2""#;

const STAT_SCRIPT: &str = r#"set -eu;
if [ -e "$1" ] || [ -L "$1" ]; then stat -c '%F|%s|%Y' -- "$1"; else printf 'missing\n'; fi"#;

fn remove_script(options: RemoveOptions) -> &'static str {
    match (options.recursive, options.force) {
        (true, true) => r#"set -eu; rm -r -f -- "$1""#,
        (true, false) => r#"set -eu; rm -r -- "$1""#,
        (false, true) => r#"set -eu; rm -f -- "$1""#,
        (false, false) => r#"set -eu; rm -- "$1""#,
    }
}

/// Options for [`SandboxFsBridge::remove`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Remove directories and their contents.
    pub recursive: bool,
    /// Ignore a missing target.
    pub force: bool,
}

/// Options for [`SandboxFsBridge::write_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Create missing parent directories.
    pub mkdir: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { mkdir: true }
    }
}

/// Kind of a container filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Result of [`SandboxFsBridge::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// Entry kind.
    pub kind: FileKind,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Follow {
    /// Resolve the whole path, final component included.
    Full,
    /// Resolve the parent only; the final component is not followed.
    Parent,
}

impl Follow {
    fn as_arg(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Parent => "parent",
        }
    }
}

#[derive(Debug)]
struct Target {
    /// Path as sent to the container.
    remote: String,
    role: Role,
    follow: Follow,
}

/// Container filesystem access confined to the configured mounts.
///
/// # Example
///
/// ```no_run
/// use sandbox_authz::sandbox::{BridgeConfig, SandboxFsBridge};
///
/// # fn main() -> miette::Result<()> {
/// let config = BridgeConfig::new("agent-alpha", "/srv/agents/alpha")
///     .with_bind_mount("/srv/reference:/reference:ro");
/// let bridge = SandboxFsBridge::new(&config, config.docker_transport())?;
///
/// let readme = bridge.read_file("/reference/README.md")?;
/// bridge.write_file("notes/summary.md", &readme, Default::default())?;
/// # Ok(())
/// # }
/// ```
pub struct SandboxFsBridge<T: ExecTransport> {
    container: String,
    workdir: String,
    mounts: MountTable,
    transport: T,
}

impl<T: ExecTransport> SandboxFsBridge<T> {
    /// Creates a bridge for the configured container and mounts.
    ///
    /// # Errors
    ///
    /// Returns `MountSpecError` if a bind mount descriptor is malformed or its
    /// host path resolves through a symlink.
    pub fn new(config: &BridgeConfig, transport: T) -> Result<Self, MountSpecError> {
        Ok(Self {
            container: config.container_name.clone(),
            workdir: normalize_container_path(&config.container_workdir),
            mounts: config.mount_table()?,
            transport,
        })
    }

    /// Returns the mount table.
    #[must_use]
    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    /// Returns the transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Reads a file from the container.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::PermissionDenied` if the path or its canonical
    /// form is outside every mount, `BridgeError::Path` if it does not exist,
    /// and `BridgeError::Io` for remote failures.
    #[instrument(skip(self), fields(container = %self.container))]
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, BridgeError> {
        let target = self.target(path, Role::Read, Follow::Full)?;
        let [canonical] = self.canonicalize("read", [target])?;
        let output = self.run("read", READ_SCRIPT, vec![canonical.clone()], None)?;
        self.check_op("read", &canonical, &output)?;
        debug!(bytes = output.stdout.len(), "Read file from sandbox");
        Ok(output.stdout)
    }

    /// Writes a file atomically (temp sibling + rename) inside the container.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::PermissionDenied` for read-only or out-of-mount
    /// targets without contacting the container.
    #[instrument(skip(self, contents), fields(container = %self.container, bytes = contents.len()))]
    pub fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        options: WriteOptions,
    ) -> Result<(), BridgeError> {
        let target = self.target(path, Role::Write, Follow::Full)?;
        let [canonical] = self.canonicalize("write", [target])?;
        let mkdir = if options.mkdir { "1" } else { "0" };
        let output = self.run(
            "write",
            WRITE_SCRIPT,
            vec![canonical.clone(), mkdir.to_string()],
            Some(contents),
        )?;
        self.check_op("write", &canonical, &output)
    }

    /// Creates a directory and its parents.
    ///
    /// # Errors
    ///
    /// Same as [`SandboxFsBridge::write_file`].
    #[instrument(skip(self), fields(container = %self.container))]
    pub fn mkdirp(&self, path: &str) -> Result<(), BridgeError> {
        let target = self.target(path, Role::Write, Follow::Full)?;
        let [canonical] = self.canonicalize("mkdirp", [target])?;
        let output = self.run("mkdirp", MKDIRP_SCRIPT, vec![canonical.clone()], None)?;
        self.check_op("mkdirp", &canonical, &output)
    }

    /// Removes a file or directory. A symlink is removed itself, not its target.
    ///
    /// # Errors
    ///
    /// Same as [`SandboxFsBridge::write_file`]; removing a mount point is denied.
    #[instrument(skip(self), fields(container = %self.container))]
    pub fn remove(&self, path: &str, options: RemoveOptions) -> Result<(), BridgeError> {
        let target = self.target(path, Role::Write, Follow::Parent)?;
        let [canonical] = self.canonicalize("remove", [target])?;
        self.deny_mount_root(&canonical)?;
        let output = self.run("remove", remove_script(options), vec![canonical.clone()], None)?;
        self.check_op("remove", &canonical, &output)
    }

    /// Renames `from` to `to`, creating the destination's parents.
    ///
    /// The destination is also resolved through its final component, so an
    /// existing symlink there must point inside a writable mount. The move
    /// itself never descends into an existing destination directory.
    ///
    /// # Errors
    ///
    /// Same as [`SandboxFsBridge::write_file`], applied to both paths.
    #[instrument(skip(self), fields(container = %self.container))]
    pub fn rename(&self, from: &str, to: &str) -> Result<(), BridgeError> {
        let source = self.target(from, Role::Write, Follow::Parent)?;
        let destination = self.target(to, Role::Write, Follow::Parent)?;
        let destination_target = self.target(to, Role::Write, Follow::Full)?;
        let [source, destination, _] =
            self.canonicalize("rename", [source, destination, destination_target])?;
        self.deny_mount_root(&source)?;
        self.deny_mount_root(&destination)?;
        let output = self.run(
            "rename",
            RENAME_SCRIPT,
            vec![source.clone(), destination],
            None,
        )?;
        self.check_op("rename", &source, &output)
    }

    /// Returns kind, size and mtime, or `None` if the path does not exist.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::PermissionDenied` for out-of-mount paths and
    /// `BridgeError::Io` if the output cannot be parsed.
    #[instrument(skip(self), fields(container = %self.container))]
    pub fn stat(&self, path: &str) -> Result<Option<FileStat>, BridgeError> {
        let target = self.target(path, Role::Read, Follow::Full)?;
        let [canonical] = self.canonicalize("stat", [target])?;
        let output = self.run("stat", STAT_SCRIPT, vec![canonical.clone()], None)?;
        self.check_op("stat", &canonical, &output)?;
        parse_stat(&output.stdout_text())
    }

    /// Maps a requested path to a container path and applies the local mount checks.
    fn target(&self, path: &str, role: Role, follow: Follow) -> Result<Target, BridgeError> {
        let trimmed = path.trim();
        let invalid = |reason: &str| BridgeError::Validation {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        if trimmed.is_empty() {
            return Err(invalid("path is empty"));
        }
        if trimmed.contains('\0') || trimmed.contains('\n') {
            return Err(invalid("path contains a NUL byte or newline"));
        }

        let (lexical, remote) = if trimmed.starts_with('/') {
            let normalized = normalize_container_path(trimmed);
            if self.mounts.find_by_container_path(&normalized).is_some() {
                // Mount-prefixed container paths go to the container as given.
                (normalized, trimmed.to_string())
            } else if let Some(translated) = self.mounts.host_to_container(Path::new(trimmed)) {
                trace!(translated = %translated, "Translated host path to container path");
                (translated.clone(), translated)
            } else {
                return Err(self.deny(path, BridgeDenial::OutsideMounts));
            }
        } else {
            let joined = join_container(&self.workdir, trimmed);
            (joined.clone(), joined)
        };

        let mount = self
            .mounts
            .find_by_container_path(&lexical)
            .ok_or_else(|| self.deny(path, BridgeDenial::OutsideMounts))?;

        if role == Role::Write && !mount.mode.is_writable() {
            return Err(self.deny(
                path,
                BridgeDenial::ReadOnlyMount {
                    mount: mount.container_path.clone(),
                },
            ));
        }

        Ok(Target { remote, role, follow })
    }

    /// Canonicalizes all targets in one round trip and re-checks them against the mounts.
    fn canonicalize<const N: usize>(
        &self,
        operation: &'static str,
        targets: [Target; N],
    ) -> Result<[String; N], BridgeError> {
        let mut args = Vec::with_capacity(N * 2);
        for target in &targets {
            args.push(target.follow.as_arg().to_string());
            args.push(target.remote.clone());
        }

        let output = self.run(operation, CANONICALIZE_SCRIPT, args, None)?;
        if !output.success() {
            return Err(remote_failure(operation, &output));
        }

        let text = output.stdout_text();
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() != N {
            return Err(BridgeError::Io {
                operation,
                detail: format!("expected {N} canonical paths, got {}", lines.len()),
            });
        }

        let mut resolved: [String; N] = std::array::from_fn(|_| String::new());
        for (index, (target, line)) in targets.iter().zip(lines).enumerate() {
            let canonical = normalize_container_path(line.trim_end_matches('\r'));
            let Some(mount) = self.mounts.find_by_container_path(&canonical) else {
                return Err(self.deny(
                    &target.remote,
                    BridgeDenial::CanonicalEscape { canonical },
                ));
            };
            if target.role == Role::Write && !mount.mode.is_writable() {
                return Err(self.deny(
                    &target.remote,
                    BridgeDenial::ReadOnlyMount {
                        mount: mount.container_path.clone(),
                    },
                ));
            }
            trace!(
                requested = %target.remote,
                canonical = %canonical,
                "Canonical path inside mount"
            );
            if let Some(slot) = resolved.get_mut(index) {
                *slot = canonical;
            }
        }
        Ok(resolved)
    }

    fn deny_mount_root(&self, canonical: &str) -> Result<(), BridgeError> {
        match self
            .mounts
            .mounts()
            .iter()
            .find(|m| m.container_path == canonical)
        {
            Some(mount) => Err(self.deny(
                canonical,
                BridgeDenial::MountRoot {
                    mount: mount.container_path.clone(),
                },
            )),
            None => Ok(()),
        }
    }

    fn deny(&self, path: &str, denial: BridgeDenial) -> BridgeError {
        warn!(path, denial = %denial, "Sandbox filesystem operation denied");
        BridgeError::PermissionDenied {
            path: path.to_string(),
            denial,
        }
    }

    fn run(
        &self,
        operation: &'static str,
        script: &str,
        args: Vec<String>,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, BridgeError> {
        let request = ExecRequest {
            container: &self.container,
            script,
            args,
            stdin,
        };
        trace!(operation, "Issuing remote command");
        self.transport.exec(&request).map_err(|e| {
            warn!(operation, error = %e, "Exec transport failed");
            BridgeError::from(e)
        })
    }

    fn check_op(
        &self,
        operation: &'static str,
        path: &str,
        output: &CommandOutput,
    ) -> Result<(), BridgeError> {
        if output.success() {
            return Ok(());
        }
        if output.stderr.contains("No such file or directory") {
            return Err(BridgeError::Path {
                path: path.to_string(),
            });
        }
        Err(remote_failure(operation, output))
    }
}

impl<T: ExecTransport> std::fmt::Debug for SandboxFsBridge<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxFsBridge")
            .field("container", &self.container)
            .field("workdir", &self.workdir)
            .field("mounts", &self.mounts)
            .finish()
    }
}

fn remote_failure(operation: &'static str, output: &CommandOutput) -> BridgeError {
    let first_line = output.stderr.lines().next().unwrap_or("").trim();
    let detail = if first_line.is_empty() {
        format!("exit code {}", output.exit_code)
    } else {
        format!("exit code {}: {first_line}", output.exit_code)
    };
    BridgeError::Io { operation, detail }
}

/// Parses `%F|%s|%Y` (or `missing`) from the stat script.
fn parse_stat(text: &str) -> Result<Option<FileStat>, BridgeError> {
    let line = text.trim();
    if line == "missing" {
        return Ok(None);
    }

    let malformed = || BridgeError::Io {
        operation: "stat",
        detail: format!("unexpected stat output {line:?}"),
    };

    let mut parts = line.rsplitn(3, '|');
    let mtime = parts.next().ok_or_else(malformed)?;
    let size = parts.next().ok_or_else(malformed)?;
    let kind = parts.next().ok_or_else(malformed)?;

    let kind = match kind {
        "regular file" | "regular empty file" => FileKind::File,
        "directory" => FileKind::Directory,
        "symbolic link" => FileKind::Symlink,
        _ => FileKind::Other,
    };
    let size = size.parse::<u64>().map_err(|_| malformed())?;
    let seconds = mtime.parse::<i64>().map_err(|_| malformed())?;
    let modified = DateTime::<Utc>::from_timestamp(seconds, 0).ok_or_else(malformed)?;

    Ok(Some(FileStat { kind, size, modified }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_regular_file() {
        let stat = parse_stat("regular file|42|1700000000\n")
            .expect("parse")
            .expect("present");
        assert_eq!(stat.kind, FileKind::File);
        assert_eq!(stat.size, 42);
        assert_eq!(stat.modified.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_stat_variants() {
        assert_eq!(parse_stat("missing\n").expect("parse"), None);
        let dir = parse_stat("directory|4096|1").expect("parse").expect("present");
        assert_eq!(dir.kind, FileKind::Directory);
        let empty = parse_stat("regular empty file|0|1").expect("parse").expect("present");
        assert_eq!(empty.kind, FileKind::File);
        assert!(parse_stat("garbage").is_err());
        assert!(parse_stat("directory|x|1").is_err());
    }

    #[test]
    fn test_scripts_fail_fast_without_pipefail() {
        let scripts = [
            CANONICALIZE_SCRIPT,
            READ_SCRIPT,
            WRITE_SCRIPT,
            MKDIRP_SCRIPT,
            RENAME_SCRIPT,
            STAT_SCRIPT,
            remove_script(RemoveOptions::default()),
            remove_script(RemoveOptions { recursive: true, force: true }),
        ];
        for script in scripts {
            assert!(script.starts_with("set -eu;"), "script must fail fast: {script}");
            assert!(!script.contains("pipefail"));
        }
    }
}
