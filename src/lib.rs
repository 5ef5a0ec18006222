//! Sandbox Authz - trust boundary for agent file access and process execution.
//!
//! This crate decides whether an AI agent may touch a host path, open a file,
//! operate on files inside its container, or run a command:
//!
//! - [`paths`]: resolve raw paths and `file://` URLs to canonical host paths
//!   contained in an allowed root
//! - [`fs`]: open host files without symlink-swap races
//! - [`sandbox`]: container filesystem operations confined to bind mounts
//! - [`exec`]: safe-bin trust policy and exact approval matching
//! - [`context`]: the per-agent bundle of all of the above
//!
//! # Platform Requirements
//!
//! - Unix (`O_NOFOLLOW`, device/inode identity)
//! - A container CLI with `exec -i` for the real bridge transport
//!
//! # Example
//!
//! ```no_run
//! use sandbox_authz::context::{AuthzContext, ExecDecision, ExecInvocation};
//!
//! fn main() -> miette::Result<()> {
//!     let ctx = AuthzContext::builder("/srv/agents/alpha").build();
//!
//!     let bytes = ctx.read_host_file("/workspace/report.md")?;
//!     println!("{} bytes", bytes.len());
//!
//!     let decision = ctx.authorize_exec(&ExecInvocation::new("/usr/bin/wc", ["-l"]));
//!     assert_eq!(decision, ExecDecision::SafeBin);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod fs;
pub mod paths;
pub mod sandbox;

// Re-export commonly used types
pub use context::{AuthzContext, ExecDecision, ExecInvocation};
pub use error::{Error, ErrorClass, Result};
pub use paths::{PathResolutionOutcome, PathResolver, resolve};
pub use sandbox::{BridgeConfig, SandboxFsBridge};
