//! Exec authorization: safe-bin trust policy and approval matching.
//!
//! A command may run without a prompt when [`evaluate_safe_bin`] allows it.
//! Otherwise it needs a granted approval that exactly matches it, looked up in
//! an [`ApprovalRegistry`] through [`approval_matches_for_host`].

mod approval;
mod interpreter;
mod registry;
mod safe_bins;
mod trusted_dirs;

pub use approval::{
    ApprovalBinding, EXEC_HOST_NODE, ExecApprovalRequest, approval_matches_for_host,
    approval_matches_system_run_request,
};
pub use interpreter::{
    InterpreterClass, classify_interpreter, is_interpreter_like, normalize_bin_name,
};
pub use registry::{ApprovalDecision, ApprovalRecord, ApprovalRegistry};
pub use safe_bins::{
    ArgvViolation, DEFAULT_SAFE_BINS, SafeBinPolicy, SafeBinProfile, SafeBinVerdict,
    evaluate_safe_bin, merge_profile_fixtures, resolve_policy, scaffold_missing_profiles,
};
pub use trusted_dirs::{
    DEFAULT_TRUSTED_DIRS, TrustedBinDirSet, TrustedDirCache, is_trusted_path,
    trusted_dirs_signature,
};
