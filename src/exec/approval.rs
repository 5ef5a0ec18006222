//! Exact matching of granted exec approvals against new requests.
//!
//! # Security Considerations
//!
//! Matching is exact on purpose: no prefix, subset or reordering of argv is
//! accepted, and the working directory, agent and session of the grant must
//! equal those of the new request (absent only matches absent). An approval
//! for `ls -la /tmp` therefore never authorizes `rm -rf /tmp`, and a grant
//! from one session cannot be replayed in another.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Execution surface for system-run requests on a node host.
pub const EXEC_HOST_NODE: &str = "node";

/// A previously granted exec approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecApprovalRequest {
    /// Execution surface the approval was granted for.
    pub host: String,
    /// Literal command text.
    pub command: String,
    /// Structured argv, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_argv: Option<Vec<String>>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
}

impl ExecApprovalRequest {
    /// Creates a request for `host` with the given command text.
    #[must_use]
    pub fn new(host: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            command: command.into(),
            command_argv: None,
            cwd: None,
            agent_id: None,
            session_key: None,
        }
    }

    /// Records a structured argv.
    #[must_use]
    pub fn with_argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_argv = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    /// Scopes the approval to the binding's cwd, agent and session.
    #[must_use]
    pub fn with_binding(mut self, binding: &ApprovalBinding) -> Self {
        self.cwd.clone_from(&binding.cwd);
        self.agent_id.clone_from(&binding.agent_id);
        self.session_key.clone_from(&binding.session_key);
        self
    }
}

/// The exact context of the request being authorized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalBinding {
    pub cwd: Option<String>,
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
}

impl ApprovalBinding {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    #[must_use]
    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }
}

/// Returns `true` if `request` exactly covers the invocation on `host`.
#[must_use]
pub fn approval_matches_for_host<S: AsRef<str>>(
    host: &str,
    cmd_text: &str,
    argv: &[S],
    request: &ExecApprovalRequest,
    binding: &ApprovalBinding,
) -> bool {
    if request.host != host {
        trace!(granted = %request.host, host, "Approval host mismatch");
        return false;
    }

    let command_matches = match request.command_argv.as_deref() {
        Some(recorded) if !recorded.is_empty() => {
            recorded.len() == argv.len()
                && recorded.iter().zip(argv).all(|(a, b)| a == b.as_ref())
        }
        _ => !cmd_text.is_empty() && request.command == cmd_text,
    };
    if !command_matches {
        trace!("Approval command mismatch");
        return false;
    }

    let binding_matches = request.cwd == binding.cwd
        && request.agent_id == binding.agent_id
        && request.session_key == binding.session_key;
    if !binding_matches {
        trace!("Approval binding mismatch");
    }
    binding_matches
}

/// Returns `true` if `request` exactly covers a system-run invocation on the
/// node surface.
#[must_use]
pub fn approval_matches_system_run_request<S: AsRef<str>>(
    cmd_text: &str,
    argv: &[S],
    request: &ExecApprovalRequest,
    binding: &ApprovalBinding,
) -> bool {
    approval_matches_for_host(EXEC_HOST_NODE, cmd_text, argv, request, binding)
}
