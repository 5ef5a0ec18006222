//! Per-agent authorization context.
//!
//! Owns everything the pipeline needs for one execution context: the allowed
//! roots, the resolved safe-bin policy, the trusted-directory cache and the
//! approval registry. Build one per agent (or per process) and share it by
//! reference; it is `Send + Sync`.
//!
//! # Example
//!
//! ```no_run
//! use sandbox_authz::context::{AuthzContext, ExecInvocation};
//! use sandbox_authz::exec::ApprovalBinding;
//!
//! # fn main() -> miette::Result<()> {
//! let ctx = AuthzContext::builder("/srv/agents/alpha").build();
//! let notes = ctx.read_host_file("notes/todo.md")?;
//!
//! let invocation = ExecInvocation::new("/usr/bin/jq", [".name"])
//!     .with_binding(ApprovalBinding::new().with_agent_id("alpha"));
//! println!("{} bytes, {:?}", notes.len(), ctx.authorize_exec(&invocation));
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::SafeBinConfigLayer;
use crate::error::{Error, Result};
use crate::exec::{
    ApprovalBinding, ApprovalRegistry, EXEC_HOST_NODE, SafeBinPolicy, SafeBinVerdict,
    TrustedBinDirSet, TrustedDirCache, evaluate_safe_bin, resolve_policy,
};
use crate::fs::{VerifiedOpenOptions, open_verified};
use crate::paths::canonical::{canonicalize_lenient, is_within};
use crate::paths::{PathResolutionOutcome, PathResolver, RejectReason};
use crate::sandbox::BindMount;

/// Default size limit for [`AuthzContext::read_host_file`].
pub const DEFAULT_MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

/// A command the agent wants to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecInvocation {
    /// Resolved executable path.
    pub executable: PathBuf,
    /// Full argv, program name first.
    pub argv: Vec<String>,
    /// Literal command text as shown to the approver.
    pub command_text: String,
    /// Context the command runs in.
    pub binding: ApprovalBinding,
}

impl ExecInvocation {
    /// Creates an invocation; argv[0] is the executable path and the command
    /// text is argv joined by spaces.
    #[must_use]
    pub fn new<I, S>(executable: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let executable = executable.into();
        let mut argv = vec![executable.to_string_lossy().into_owned()];
        argv.extend(args.into_iter().map(Into::into));
        let command_text = argv.join(" ");
        Self {
            executable,
            argv,
            command_text,
            binding: ApprovalBinding::default(),
        }
    }

    /// Overrides the command text.
    #[must_use]
    pub fn with_command_text(mut self, text: impl Into<String>) -> Self {
        self.command_text = text.into();
        self
    }

    /// Sets the binding context.
    #[must_use]
    pub fn with_binding(mut self, binding: ApprovalBinding) -> Self {
        self.binding = binding;
        self
    }

    /// Arguments after the program name.
    #[must_use]
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}

/// Outcome of [`AuthzContext::authorize_exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecDecision {
    /// Allowed by the safe-bin policy.
    SafeBin,
    /// Covered by a granted approval.
    Approved { approval_id: Uuid },
    /// Needs interactive approval; `reason` says why the policy did not allow it.
    NeedsApproval { reason: SafeBinVerdict },
}

impl ExecDecision {
    /// Returns `true` if the command may run now.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::NeedsApproval { .. })
    }
}

/// Builder for [`AuthzContext`].
#[derive(Debug, Clone)]
pub struct AuthzContextBuilder {
    resolver: PathResolver,
    global: Option<SafeBinConfigLayer>,
    local: Option<SafeBinConfigLayer>,
    max_read_bytes: u64,
    exec_host: String,
}

impl AuthzContextBuilder {
    /// Adds a bind mount as an allowed root.
    #[must_use]
    pub fn with_bind_mount(mut self, mount: BindMount) -> Self {
        self.resolver = self.resolver.with_bind_mount(mount);
        self
    }

    /// Overrides the temp directory allowance.
    #[must_use]
    pub fn with_tmp_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolver = self.resolver.with_tmp_root(path);
        self
    }

    /// Disables the temp directory allowance.
    #[must_use]
    pub fn without_tmp_root(mut self) -> Self {
        self.resolver = self.resolver.without_tmp_root();
        self
    }

    /// Sets the in-container workspace prefix.
    #[must_use]
    pub fn with_container_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.resolver = self.resolver.with_container_workdir(workdir);
        self
    }

    /// Sets the global safe-bin configuration layer.
    #[must_use]
    pub fn with_global_config(mut self, layer: SafeBinConfigLayer) -> Self {
        self.global = Some(layer);
        self
    }

    /// Sets the per-agent safe-bin configuration layer.
    #[must_use]
    pub fn with_local_config(mut self, layer: SafeBinConfigLayer) -> Self {
        self.local = Some(layer);
        self
    }

    /// Sets the size limit for host file reads.
    #[must_use]
    pub fn with_max_read_bytes(mut self, max_bytes: u64) -> Self {
        self.max_read_bytes = max_bytes;
        self
    }

    /// Sets the execution surface approvals must be granted for.
    #[must_use]
    pub fn with_exec_host(mut self, host: impl Into<String>) -> Self {
        self.exec_host = host.into();
        self
    }

    /// Resolves the safe-bin policy and builds the context.
    #[must_use]
    pub fn build(self) -> AuthzContext {
        let trusted_dir_cache = TrustedDirCache::new();
        let policy = resolve_policy(self.global.as_ref(), self.local.as_ref(), &trusted_dir_cache);
        info!(
            sandbox_root = %self.resolver.sandbox_root().display(),
            safe_bins = policy.trusted_bins.len(),
            "Authorization context ready"
        );
        AuthzContext {
            resolver: self.resolver,
            global: self.global,
            local: self.local,
            policy: RwLock::new(Arc::new(policy)),
            trusted_dir_cache,
            approvals: ApprovalRegistry::new(),
            max_read_bytes: self.max_read_bytes,
            exec_host: self.exec_host,
        }
    }
}

/// Authorization state for one execution context.
#[derive(Debug)]
pub struct AuthzContext {
    resolver: PathResolver,
    global: Option<SafeBinConfigLayer>,
    local: Option<SafeBinConfigLayer>,
    policy: RwLock<Arc<SafeBinPolicy>>,
    trusted_dir_cache: TrustedDirCache,
    approvals: ApprovalRegistry,
    max_read_bytes: u64,
    exec_host: String,
}

impl AuthzContext {
    /// Starts a builder for a context rooted at `sandbox_root`.
    #[must_use]
    pub fn builder(sandbox_root: impl Into<PathBuf>) -> AuthzContextBuilder {
        AuthzContextBuilder {
            resolver: PathResolver::new(sandbox_root),
            global: None,
            local: None,
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            exec_host: EXEC_HOST_NODE.to_string(),
        }
    }

    /// Returns the path resolver.
    #[must_use]
    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Resolves a raw path or URL against the allowed roots.
    pub fn resolve_path(&self, raw: &str) -> PathResolutionOutcome {
        self.resolver.resolve(raw)
    }

    /// Reads a host file: resolve, verified open inside the matching root,
    /// then a bounded read.
    ///
    /// # Errors
    ///
    /// Returns `Error::PathRejected` if the input is blank, a URL, or not
    /// contained, and `Error::Open` if the verified open or read fails.
    #[instrument(skip(self))]
    pub fn read_host_file(&self, raw: &str) -> Result<Vec<u8>> {
        let path = match self.resolver.resolve(raw) {
            PathResolutionOutcome::Contained(path) if !path.as_os_str().is_empty() => path,
            PathResolutionOutcome::Contained(_) => {
                return Err(Error::PathRejected(RejectReason::InvalidPath));
            }
            PathResolutionOutcome::Passthrough(url) => {
                let scheme = url.split_once("://").map_or("", |(scheme, _)| scheme);
                return Err(Error::PathRejected(RejectReason::UnsupportedScheme {
                    scheme: scheme.to_ascii_lowercase(),
                }));
            }
            PathResolutionOutcome::Rejected(reason) => return Err(Error::PathRejected(reason)),
        };

        let mut options = VerifiedOpenOptions::new()
            .reject_path_symlink()
            .with_max_bytes(self.max_read_bytes);
        if let Some(root) = self.root_containing(&path) {
            options = options.within_root(root);
        }

        let bytes = open_verified(&path, &options)?.read_to_end_limited()?;
        debug!(bytes = bytes.len(), "Read host file");
        Ok(bytes)
    }

    /// The allowed root whose subtree holds `path`, lexically or canonically.
    fn root_containing(&self, path: &Path) -> Option<PathBuf> {
        self.resolver.roots().into_iter().find_map(|root| {
            let host = root.host_path();
            let inside = is_within(path, host)
                || canonicalize_lenient(host).is_ok_and(|canonical| is_within(path, &canonical));
            inside.then(|| host.to_path_buf())
        })
    }

    /// Returns the current safe-bin policy.
    #[must_use]
    pub fn policy(&self) -> Arc<SafeBinPolicy> {
        Arc::clone(&self.policy.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Returns the trusted directory set, rebuilding it when forced.
    ///
    /// A rebuilt set replaces the one the policy uses.
    pub fn trusted_dirs(&self, force_refresh: bool) -> Arc<TrustedBinDirSet> {
        let extra_dirs: Vec<String> = [self.global.as_ref(), self.local.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|layer| layer.safe_bin_trusted_dirs.as_ref())
            .flatten()
            .cloned()
            .collect();
        let dirs = self
            .trusted_dir_cache
            .get_trusted_safe_bin_dirs(&extra_dirs, force_refresh);

        let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
        if !Arc::ptr_eq(&policy.trusted_dirs, &dirs) {
            let mut updated = SafeBinPolicy::clone(&policy);
            updated.trusted_dirs = Arc::clone(&dirs);
            *policy = Arc::new(updated);
        }
        dirs
    }

    /// Returns the approval registry.
    #[must_use]
    pub fn approvals(&self) -> &ApprovalRegistry {
        &self.approvals
    }

    /// Decides whether an invocation may run.
    ///
    /// The safe-bin policy is consulted first; otherwise a granted approval
    /// must match the invocation exactly.
    #[instrument(skip(self, invocation), fields(executable = %invocation.executable.display()))]
    pub fn authorize_exec(&self, invocation: &ExecInvocation) -> ExecDecision {
        let policy = self.policy();
        let verdict = evaluate_safe_bin(&policy, &invocation.executable, invocation.args());
        if verdict.is_allowed() {
            return ExecDecision::SafeBin;
        }

        if let Some(record) = self.approvals.find_match(
            &invocation.command_text,
            &invocation.argv,
            &invocation.binding,
            &self.exec_host,
            Utc::now(),
        ) {
            debug!(approval_id = %record.id, "Exec covered by approval");
            return ExecDecision::Approved {
                approval_id: record.id,
            };
        }

        warn!(reason = %verdict, "Exec needs approval");
        ExecDecision::NeedsApproval { reason: verdict }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{ApprovalDecision, ExecApprovalRequest};
    use tempfile::TempDir;

    #[test]
    fn test_read_host_file_inside_workspace() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        std::fs::write(tmp.path().join("notes.txt"), b"hello").expect("write notes");
        let ctx = AuthzContext::builder(tmp.path()).build();
        assert_eq!(ctx.read_host_file("notes.txt").expect("read notes"), b"hello");
    }

    #[test]
    fn test_read_host_file_rejections() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let ctx = AuthzContext::builder(tmp.path()).without_tmp_root().build();
        assert!(matches!(ctx.read_host_file(""), Err(Error::PathRejected(_))));
        assert!(matches!(
            ctx.read_host_file("https://example.com/x.png"),
            Err(Error::PathRejected(RejectReason::UnsupportedScheme { .. }))
        ));
        assert!(matches!(
            ctx.read_host_file("../outside.txt"),
            Err(Error::PathRejected(RejectReason::EscapesSandbox { .. }))
        ));
    }

    #[test]
    fn test_read_host_file_size_limit() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        std::fs::write(tmp.path().join("big.bin"), vec![0u8; 64]).expect("write big file");
        let ctx = AuthzContext::builder(tmp.path()).with_max_read_bytes(16).build();
        let err = ctx.read_host_file("big.bin").unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Validation);
    }

    #[test]
    fn test_authorize_exec_falls_back_to_approvals() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let ctx = AuthzContext::builder(tmp.path()).build();
        let binding = ApprovalBinding::new().with_agent_id("alpha");
        let invocation =
            ExecInvocation::new("/nonexistent/deploy", ["--prod"]).with_binding(binding.clone());

        assert_eq!(
            ctx.authorize_exec(&invocation),
            ExecDecision::NeedsApproval {
                reason: SafeBinVerdict::NotListed
            }
        );

        let id = ctx.approvals().grant(
            ExecApprovalRequest::new(EXEC_HOST_NODE, "/nonexistent/deploy --prod")
                .with_argv(invocation.argv.clone())
                .with_binding(&binding),
            ApprovalDecision::AllowOnce,
            None,
        );
        assert_eq!(ctx.authorize_exec(&invocation), ExecDecision::Approved { approval_id: id });
        assert!(!ctx.authorize_exec(&invocation).is_allowed());
    }

    #[test]
    fn test_trusted_dirs_refresh_updates_policy() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let ctx = AuthzContext::builder(tmp.path()).build();
        let before = ctx.trusted_dirs(false);
        assert!(Arc::ptr_eq(&before, &ctx.policy().trusted_dirs));

        let after = ctx.trusted_dirs(true);
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(&after, &ctx.policy().trusted_dirs));
    }
}
