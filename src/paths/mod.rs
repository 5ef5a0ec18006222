//! Host path containment.
//!
//! Resolves raw agent-supplied paths and `file://` URLs into canonical host
//! paths that are provably inside an allowed root, or rejects them.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use sandbox_authz::paths::{resolve, PathResolutionOutcome};
//!
//! let outcome = resolve("../outside.png", Path::new("/srv/agents/alpha"));
//! assert!(matches!(outcome, PathResolutionOutcome::Rejected(_)));
//! ```

pub mod canonical;
mod resolve;
mod roots;

pub use resolve::{CONTAINER_WORKDIR, PathResolutionOutcome, PathResolver, RejectReason, resolve};
pub use roots::{AllowedRoot, os_temp_dir};
