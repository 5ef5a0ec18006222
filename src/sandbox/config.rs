//! Configuration for the container filesystem bridge.

use std::path::PathBuf;
use std::time::Duration;

use super::mounts::{BindMount, MountMode, MountTable};
use super::transport::DockerExecTransport;
use crate::error::MountSpecError;
use crate::paths::CONTAINER_WORKDIR;

/// Configuration for a container filesystem bridge.
///
/// Use the builder methods to customize the bridge.
///
/// # Example
///
/// ```
/// use sandbox_authz::sandbox::{BridgeConfig, MountMode};
/// use std::time::Duration;
///
/// let config = BridgeConfig::new("agent-alpha", "/srv/agents/alpha")
///     .with_workspace_access(MountMode::ReadWrite)
///     .with_bind_mount("/srv/reference:/reference:ro")
///     .with_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Name of the container commands are executed in.
    pub container_name: String,

    /// Host directory mounted as the agent workspace.
    pub workspace_dir: PathBuf,

    /// Workspace path inside the container.
    pub container_workdir: String,

    /// Access mode of the workspace mount.
    pub workspace_access: MountMode,

    /// Extra `hostPath:containerPath[:ro|rw]` descriptors.
    pub bind_mounts: Vec<String>,

    /// Maximum time allowed for one remote command.
    pub timeout: Duration,
}

impl BridgeConfig {
    /// Creates a configuration with a read-write workspace at `/workspace`.
    #[must_use]
    pub fn new(container_name: impl Into<String>, workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            container_name: container_name.into(),
            workspace_dir: workspace_dir.into(),
            container_workdir: String::from(CONTAINER_WORKDIR),
            workspace_access: MountMode::ReadWrite,
            bind_mounts: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the workspace path inside the container.
    #[must_use]
    pub fn with_container_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.container_workdir = workdir.into();
        self
    }

    /// Sets the workspace access mode.
    #[must_use]
    pub fn with_workspace_access(mut self, mode: MountMode) -> Self {
        self.workspace_access = mode;
        self
    }

    /// Adds a bind mount descriptor.
    #[must_use]
    pub fn with_bind_mount(mut self, spec: impl Into<String>) -> Self {
        self.bind_mounts.push(spec.into());
        self
    }

    /// Adds multiple bind mount descriptors.
    #[must_use]
    pub fn with_bind_mounts<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bind_mounts.extend(specs.into_iter().map(Into::into));
        self
    }

    /// Sets the remote command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the implicit workspace mount.
    #[must_use]
    pub fn workspace_mount(&self) -> BindMount {
        BindMount::new(
            self.workspace_dir.clone(),
            self.container_workdir.clone(),
            self.workspace_access,
        )
    }

    /// Parses the workspace mount and descriptors into a mount table.
    ///
    /// # Errors
    ///
    /// Returns `MountSpecError` for malformed or symlinked mounts.
    pub fn mount_table(&self) -> Result<MountTable, MountSpecError> {
        MountTable::from_specs(self.workspace_mount(), &self.bind_mounts)
    }

    /// Builds a `docker exec` transport honoring the configured timeout.
    #[must_use]
    pub fn docker_transport(&self) -> DockerExecTransport {
        DockerExecTransport::new().with_timeout(self.timeout)
    }
}
