//! Container runtime seam used by the lifecycle
//!
//! The lifecycle only needs a handful of operations from the runtime:
//! idempotent creation of shared infrastructure, the ports an environment
//! currently publishes, and compose-style start/stop of the isolated
//! services. [`crate::docker::DockerRuntime`] is the production
//! implementation.

use crate::config::SharedServiceConfig;
use crate::hostnames::ProjectIdentity;
use std::collections::BTreeMap;
use std::path::Path;

/// Isolated services of one environment, as handed to the runtime
#[derive(Debug, Clone, Copy)]
pub struct ComposeProject<'a> {
    /// Used as the compose project name
    pub identity: &'a ProjectIdentity,
    pub workspace: &'a Path,
    pub compose_file: &'a Path,
    /// Exported configuration values (ports, hostnames, network)
    pub env: &'a BTreeMap<String, String>,
}

#[allow(async_fn_in_trait)]
pub trait ServiceRuntime {
    /// Create the network if absent. Returns whether it was created.
    async fn ensure_network(&self, name: &str) -> anyhow::Result<bool>;

    async fn remove_network(&self, name: &str) -> anyhow::Result<()>;

    /// Create and start the container if absent, start it if stopped.
    /// An existing container is never recreated. Returns whether it was created.
    async fn ensure_shared_service(
        &self,
        container_name: &str,
        service: &SharedServiceConfig,
        network: &str,
    ) -> anyhow::Result<bool>;

    async fn remove_shared_service(&self, container_name: &str) -> anyhow::Result<()>;

    /// Host ports currently published by the environment's own containers
    async fn published_ports(&self, identity: &ProjectIdentity) -> anyhow::Result<Vec<u16>>;

    /// Start the isolated services. `rebuild` rebuilds images, recreates
    /// containers and discards anonymous volumes.
    async fn compose_up(&self, project: &ComposeProject<'_>, rebuild: bool) -> anyhow::Result<()>;

    async fn compose_down(&self, project: &ComposeProject<'_>) -> anyhow::Result<()>;
}
