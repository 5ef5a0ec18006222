//! Integration tests for the container filesystem bridge.
//!
//! A recording transport stands in for `docker exec`, so these tests verify
//! exactly which remote commands are issued:
//! - Read-only and out-of-mount targets are refused with zero remote calls
//! - Canonicalization escapes are refused before any content command
//! - Failures map to Path, Io and PermissionDenied classes
//!
//! A second transport runs the same scripts with the local `sh` against a
//! temp directory mounted at its own path, to check their shell semantics.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use sandbox_authz::ErrorClass;
use sandbox_authz::error::{BridgeDenial, BridgeError, TransportError};
use sandbox_authz::sandbox::{
    BridgeConfig, CommandOutput, ExecRequest, ExecTransport, FileKind, RemoveOptions,
    SandboxFsBridge, WriteOptions,
};
use tempfile::TempDir;

#[derive(Debug, Clone)]
struct RecordedCall {
    container: String,
    script: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
}

impl RecordedCall {
    fn is_canonicalize(&self) -> bool {
        self.script.contains("readlink -f")
    }
}

/// Transport that records every request and answers from canned responses.
///
/// Canonicalization echoes each target unless it appears in `redirects`.
/// Any other script gets the first response whose key occurs in the script.
#[derive(Default)]
struct RecordingTransport {
    calls: Mutex<Vec<RecordedCall>>,
    redirects: HashMap<String, String>,
    responses: Vec<(&'static str, CommandOutput)>,
    fail_transport: bool,
}

impl RecordingTransport {
    fn with_redirect(mut self, from: &str, to: &str) -> Self {
        self.redirects.insert(from.to_string(), to.to_string());
        self
    }

    fn with_response(mut self, script_marker: &'static str, output: CommandOutput) -> Self {
        self.responses.push((script_marker, output));
        self
    }

    fn failing() -> Self {
        Self {
            fail_transport: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn content_calls(&self) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| !c.is_canonicalize()).collect()
    }
}

impl ExecTransport for RecordingTransport {
    fn exec(&self, request: &ExecRequest<'_>) -> Result<CommandOutput, TransportError> {
        let call = RecordedCall {
            container: request.container.to_string(),
            script: request.script.to_string(),
            args: request.args.clone(),
            stdin: request.stdin.map(<[u8]>::to_vec),
        };
        let canonicalize = call.is_canonicalize();
        self.calls.lock().expect("calls lock").push(call);

        if self.fail_transport {
            return Err(TransportError::Failed("connection reset".to_string()));
        }

        if canonicalize {
            let lines: Vec<String> = request
                .args
                .chunks(2)
                .filter_map(|pair| pair.get(1))
                .map(|target| self.redirects.get(target).cloned().unwrap_or_else(|| target.clone()))
                .collect();
            return Ok(CommandOutput {
                stdout: format!("{}\n", lines.join("\n")).into_bytes(),
                ..CommandOutput::default()
            });
        }

        Ok(self
            .responses
            .iter()
            .find(|(marker, _)| request.script.contains(marker))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }
}

fn config() -> BridgeConfig {
    BridgeConfig::new("agent-alpha", "/srv/agents/alpha")
        .with_bind_mount("/tmp/ws2:/workspace-two:ro")
}

type RecordingBridge = SandboxFsBridge<Arc<RecordingTransport>>;

fn new_bridge(transport: RecordingTransport) -> (RecordingBridge, Arc<RecordingTransport>) {
    let transport = Arc::new(transport);
    let bridge = SandboxFsBridge::new(&config(), Arc::clone(&transport)).expect("valid mounts");
    (bridge, transport)
}

fn stdout(text: &str) -> CommandOutput {
    CommandOutput {
        stdout: text.as_bytes().to_vec(),
        ..CommandOutput::default()
    }
}

fn failure(stderr: &str) -> CommandOutput {
    CommandOutput {
        stderr: stderr.to_string(),
        exit_code: 1,
        ..CommandOutput::default()
    }
}

fn denial(err: BridgeError) -> BridgeDenial {
    match err {
        BridgeError::PermissionDenied { denial, .. } => denial,
        other => panic!("expected PermissionDenied, got {other:?}"),
    }
}

// =============================================================================
// Read-only mounts
// =============================================================================

/// Test that a write into a read-only mount issues zero remote calls.
#[test]
fn test_write_to_read_only_mount_issues_no_calls() {
    let (bridge, transport) = new_bridge(RecordingTransport::default());

    let err = bridge
        .write_file("/workspace-two/new.txt", b"data", WriteOptions::default())
        .expect_err("read-only mount must refuse writes");
    assert_eq!(err.class(), ErrorClass::PermissionDenied);
    assert_eq!(
        denial(err),
        BridgeDenial::ReadOnlyMount {
            mount: "/workspace-two".to_string()
        }
    );
    assert!(transport.calls().is_empty());
}

/// Test that every write-role operation is refused locally on a read-only mount.
#[test]
fn test_write_roles_on_read_only_mount_issue_no_calls() {
    let (bridge, transport) = new_bridge(RecordingTransport::default());

    assert!(bridge.mkdirp("/workspace-two/dir").is_err());
    assert!(bridge.remove("/workspace-two/old.txt", RemoveOptions::default()).is_err());
    assert!(bridge.rename("/workspace/a.txt", "/workspace-two/a.txt").is_err());
    assert!(bridge.rename("/workspace-two/a.txt", "/workspace/a.txt").is_err());
    assert!(transport.calls().is_empty());
}

/// Test that a read from a read-only mount issues exactly one cat after canonicalization.
#[test]
fn test_read_from_read_only_mount_issues_one_cat() {
    let (bridge, transport) = new_bridge(
        RecordingTransport::default().with_response("cat --", stdout("# Workspace two\n")),
    );

    let bytes = bridge
        .read_file("/workspace-two/README.md")
        .expect("read should succeed");
    assert_eq!(bytes, b"# Workspace two\n");

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].is_canonicalize());
    assert_eq!(calls[0].args, vec!["full", "/workspace-two/README.md"]);

    let content = transport.content_calls();
    assert_eq!(content.len(), 1);
    assert!(content[0].script.contains("cat --"));
    assert_eq!(content[0].args, vec!["/workspace-two/README.md"]);
    assert_eq!(content[0].container, "agent-alpha");
}

// =============================================================================
// Containment
// =============================================================================

/// Test that canonicalization leaving every mount never reaches cat.
#[test]
fn test_canonical_escape_is_refused_before_content() {
    let (bridge, transport) = new_bridge(
        RecordingTransport::default()
            .with_redirect("/workspace/link.txt", "/etc/shadow")
            .with_response("cat --", stdout("root:*:...")),
    );

    let err = bridge.read_file("/workspace/link.txt").expect_err("escape");
    assert_eq!(
        denial(err),
        BridgeDenial::CanonicalEscape {
            canonical: "/etc/shadow".to_string()
        }
    );
    assert_eq!(transport.calls().len(), 1);
    assert!(transport.content_calls().is_empty());
}

/// Test that a writable path redirected into a read-only mount is refused.
#[test]
fn test_canonical_redirect_into_read_only_mount_is_refused() {
    let (bridge, transport) = new_bridge(
        RecordingTransport::default().with_redirect("/workspace/out", "/workspace-two/out"),
    );

    let err = bridge
        .write_file("/workspace/out", b"x", WriteOptions::default())
        .expect_err("redirect into ro mount");
    assert!(matches!(denial(err), BridgeDenial::ReadOnlyMount { .. }));
    assert!(transport.content_calls().is_empty());
}

/// Test that paths outside every mount are refused without remote calls.
#[test]
fn test_outside_mounts_is_refused_locally() {
    let (bridge, transport) = new_bridge(RecordingTransport::default());

    let err = bridge.read_file("/etc/passwd").expect_err("outside mounts");
    assert_eq!(denial(err), BridgeDenial::OutsideMounts);
    assert!(transport.calls().is_empty());
}

/// Test that mount points themselves cannot be removed.
#[test]
fn test_mount_root_cannot_be_removed() {
    let (bridge, transport) = new_bridge(RecordingTransport::default());

    let err = bridge
        .remove("/workspace", RemoveOptions { recursive: true, force: true })
        .expect_err("mount root");
    assert!(matches!(denial(err), BridgeDenial::MountRoot { .. }));
    assert!(transport.content_calls().is_empty());
}

/// Test that malformed paths are rejected as Validation.
#[test]
fn test_malformed_paths_are_validation() {
    let (bridge, transport) = new_bridge(RecordingTransport::default());

    for bad in ["", "   ", "a\nb", "a\0b"] {
        let err = bridge.read_file(bad).expect_err("malformed path");
        assert_eq!(err.class(), ErrorClass::Validation, "{bad:?}");
    }
    assert!(transport.calls().is_empty());
}

// =============================================================================
// Path mapping
// =============================================================================

/// Test that relative paths resolve against the container workdir.
#[test]
fn test_relative_path_uses_workdir() {
    let (bridge, transport) = new_bridge(RecordingTransport::default());

    bridge.mkdirp("notes/2024").expect("mkdirp");
    let content = transport.content_calls();
    assert_eq!(content.len(), 1);
    assert!(content[0].script.contains("mkdir -p"));
    assert_eq!(content[0].args, vec!["/workspace/notes/2024"]);
}

/// Test that host paths under a mount are translated to container paths.
#[test]
fn test_host_path_is_translated() {
    let (bridge, transport) =
        new_bridge(RecordingTransport::default().with_response("cat --", stdout("fn main() {}")));

    bridge.read_file("/srv/agents/alpha/src/main.rs").expect("read");
    assert_eq!(transport.calls()[0].args, vec!["full", "/workspace/src/main.rs"]);
}

// =============================================================================
// Operations
// =============================================================================

/// Test that writes stream the payload on stdin to an atomic temp-and-rename script.
#[test]
fn test_write_streams_payload() {
    let (bridge, transport) = new_bridge(RecordingTransport::default());

    bridge
        .write_file("out/report.md", b"# Report", WriteOptions::default())
        .expect("write");
    let content = transport.content_calls();
    assert_eq!(content.len(), 1);
    assert!(content[0].script.starts_with("set -eu;"));
    assert!(content[0].script.contains("mktemp"));
    assert_eq!(content[0].args, vec!["/workspace/out/report.md", "1"]);
    assert_eq!(content[0].stdin.as_deref(), Some(&b"# Report"[..]));

    bridge
        .write_file("out/report.md", b"x", WriteOptions { mkdir: false })
        .expect("write");
    assert_eq!(transport.content_calls()[1].args[1], "0");
}

/// Test that rename canonicalizes both paths in one round trip.
///
/// The destination is resolved twice: without and with its final component.
#[test]
fn test_rename_uses_single_canonicalization() {
    let (bridge, transport) = new_bridge(RecordingTransport::default());

    bridge.rename("draft.md", "published/final.md").expect("rename");
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0].args,
        vec![
            "parent",
            "/workspace/draft.md",
            "parent",
            "/workspace/published/final.md",
            "full",
            "/workspace/published/final.md",
        ]
    );
    assert!(calls[1].script.contains("mv -T --"));
    assert_eq!(calls[1].args, vec!["/workspace/draft.md", "/workspace/published/final.md"]);
}

/// Test stat parsing and missing entries.
#[test]
fn test_stat() {
    let (bridge, _) = new_bridge(
        RecordingTransport::default()
            .with_response("stat -c", stdout("regular file|8|1700000000\n")),
    );
    let stat = bridge.stat("report.md").expect("stat").expect("present");
    assert_eq!(stat.kind, FileKind::File);
    assert_eq!(stat.size, 8);
    assert_eq!(stat.modified.timestamp(), 1_700_000_000);

    let (bridge, _) =
        new_bridge(RecordingTransport::default().with_response("stat -c", stdout("missing\n")));
    assert_eq!(bridge.stat("gone.md").expect("stat"), None);
}

/// Test that a missing file maps to the Path class.
#[test]
fn test_missing_file_is_path_class() {
    let (bridge, _) = new_bridge(RecordingTransport::default().with_response(
        "cat --",
        failure("cat: /workspace/missing.txt: No such file or directory"),
    ));
    let err = bridge.read_file("missing.txt").expect_err("missing");
    assert_eq!(err.class(), ErrorClass::Path);
}

/// Test that other remote failures map to Io with the first stderr line.
#[test]
fn test_remote_failure_is_io_class() {
    let (bridge, _) = new_bridge(
        RecordingTransport::default()
            .with_response("mkdir -p", failure("mkdir: Permission denied\nmore")),
    );
    let err = bridge.mkdirp("locked").expect_err("failure");
    assert_eq!(err.class(), ErrorClass::Io);
    let message = err.to_string();
    assert!(message.contains("Permission denied"));
    assert!(!message.contains("more"));
}

/// Test that transport failures map to Io.
#[test]
fn test_transport_failure_is_io_class() {
    let (bridge, transport) = new_bridge(RecordingTransport::failing());
    let err = bridge.read_file("a.txt").expect_err("transport failure");
    assert_eq!(err.class(), ErrorClass::Io);
    assert_eq!(transport.calls().len(), 1);
}

/// Test that a rename whose destination symlink leaves every mount is refused.
#[test]
fn test_rename_onto_escaping_symlink_is_refused() {
    let (bridge, transport) = new_bridge(
        RecordingTransport::default().with_redirect("/workspace/link", "/etc/cron.d"),
    );

    let err = bridge.rename("a.txt", "link").expect_err("escaping destination");
    assert!(matches!(denial(err), BridgeDenial::CanonicalEscape { .. }));
    assert!(transport.content_calls().is_empty());
}

// =============================================================================
// Script semantics
// =============================================================================

/// Transport that runs bridge scripts with the local `sh`.
struct LocalShellTransport;

impl ExecTransport for LocalShellTransport {
    fn exec(&self, request: &ExecRequest<'_>) -> Result<CommandOutput, TransportError> {
        let argv = request.shell_argv();
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take()
            && let Some(bytes) = request.stdin
        {
            stdin
                .write_all(bytes)
                .map_err(|e| TransportError::Failed(e.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// A workspace mounted at its own host path, plus a directory outside it.
struct LocalFixture {
    _dirs: (TempDir, TempDir),
    workspace: PathBuf,
    outside: PathBuf,
    bridge: SandboxFsBridge<LocalShellTransport>,
}

fn local_fixture() -> LocalFixture {
    let ws_dir = TempDir::new().expect("failed to create workspace");
    let outside_dir = TempDir::new().expect("failed to create outside dir");
    let workspace = fs::canonicalize(ws_dir.path()).expect("canonicalize workspace");
    let outside = fs::canonicalize(outside_dir.path()).expect("canonicalize outside dir");

    let config = BridgeConfig::new("local", &workspace)
        .with_container_workdir(workspace.to_string_lossy().into_owned());
    let bridge = SandboxFsBridge::new(&config, LocalShellTransport).expect("valid mounts");
    LocalFixture {
        _dirs: (ws_dir, outside_dir),
        workspace,
        outside,
        bridge,
    }
}

/// Test that a rename onto a symlink to an outside directory moves nothing out.
#[cfg(target_os = "linux")]
#[test]
fn test_rename_into_symlinked_outside_dir_stays_contained() {
    let fx = local_fixture();
    fs::write(fx.workspace.join("a.txt"), b"a").expect("write source");
    std::os::unix::fs::symlink(&fx.outside, fx.workspace.join("link")).expect("symlink");

    let err = fx.bridge.rename("a.txt", "link").expect_err("escaping destination");
    assert_eq!(err.class(), ErrorClass::PermissionDenied);
    assert!(!fx.outside.join("a.txt").exists());
    assert!(fx.workspace.join("a.txt").exists());
}

/// Test that a rename onto an in-mount directory symlink replaces the link.
#[cfg(target_os = "linux")]
#[test]
fn test_rename_replaces_symlink_instead_of_descending() {
    let fx = local_fixture();
    fs::write(fx.workspace.join("a.txt"), b"a").expect("write source");
    fs::create_dir(fx.workspace.join("sub")).expect("mkdir sub");
    std::os::unix::fs::symlink(fx.workspace.join("sub"), fx.workspace.join("alias"))
        .expect("symlink");

    fx.bridge.rename("a.txt", "alias").expect("rename");
    assert!(!fx.workspace.join("sub/a.txt").exists());
    let meta = fs::symlink_metadata(fx.workspace.join("alias")).expect("alias");
    assert!(meta.file_type().is_file());
}

/// Test that canonicalization of a missing tail keeps the tail under the resolved ancestor.
#[cfg(target_os = "linux")]
#[test]
fn test_missing_tail_is_canonicalized_under_resolved_ancestor() {
    let fx = local_fixture();
    fx.bridge.mkdirp("new/deep/dir").expect("mkdirp");
    assert!(fx.workspace.join("new/deep/dir").is_dir());

    std::os::unix::fs::symlink(&fx.outside, fx.workspace.join("out")).expect("symlink");
    let err = fx
        .bridge
        .write_file("out/missing/x.txt", b"x", WriteOptions::default())
        .expect_err("escape through missing tail");
    assert!(matches!(denial(err), BridgeDenial::CanonicalEscape { .. }));
    assert!(!fx.outside.join("missing").exists());
}

/// Test the write, read, stat and remove scripts against a real filesystem.
#[cfg(target_os = "linux")]
#[test]
fn test_scripts_round_trip_on_local_filesystem() {
    let fx = local_fixture();
    fx.bridge
        .write_file("notes/a.md", b"hello", WriteOptions::default())
        .expect("write");
    assert_eq!(fx.bridge.read_file("notes/a.md").expect("read"), b"hello");

    let stat = fx.bridge.stat("notes/a.md").expect("stat").expect("present");
    assert_eq!(stat.kind, FileKind::File);
    assert_eq!(stat.size, 5);
    assert_eq!(fx.bridge.stat("notes/gone.md").expect("stat"), None);

    fs::create_dir(fx.workspace.join("keep")).expect("mkdir keep");
    fs::write(fx.workspace.join("keep/f.txt"), b"f").expect("write keep");
    std::os::unix::fs::symlink(fx.workspace.join("keep"), fx.workspace.join("l")).expect("symlink");
    fx.bridge.remove("l", RemoveOptions::default()).expect("remove link");
    assert!(fs::symlink_metadata(fx.workspace.join("l")).is_err());
    assert!(fx.workspace.join("keep/f.txt").exists());

    let err = fx.bridge.read_file("notes/missing.md").expect_err("missing");
    assert_eq!(err.class(), ErrorClass::Path);
}
