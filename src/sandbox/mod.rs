//! Container filesystem bridge.
//!
//! Performs filesystem operations inside an agent container by issuing POSIX
//! shell scripts over an injected [`ExecTransport`], and confines every
//! operation to the configured bind mounts.
//!
//! # Example
//!
//! ```no_run
//! use sandbox_authz::sandbox::{BridgeConfig, SandboxFsBridge};
//!
//! # fn main() -> miette::Result<()> {
//! let config = BridgeConfig::new("agent-alpha", "/srv/agents/alpha")
//!     .with_bind_mount("/tmp/ws2:/workspace-two:ro");
//! let bridge = SandboxFsBridge::new(&config, config.docker_transport())?;
//!
//! // Refused locally: the mount is read-only.
//! assert!(bridge.write_file("/workspace-two/new.txt", b"x", Default::default()).is_err());
//! # Ok(())
//! # }
//! ```

mod bridge;
mod config;
pub mod mounts;
mod transport;

pub use bridge::{FileKind, FileStat, RemoveOptions, SandboxFsBridge, WriteOptions};
pub use config::BridgeConfig;
pub use mounts::{BindMount, MountMode, MountTable};
pub use transport::{CommandOutput, DockerExecTransport, ExecRequest, ExecTransport, SCRIPT_NAME};
