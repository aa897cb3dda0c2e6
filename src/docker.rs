//! Docker runtime: shared infrastructure through the Docker API, isolated
//! environments through the `docker compose` CLI

use crate::config::SharedServiceConfig;
use crate::error::DevgateError;
use crate::hostnames::ProjectIdentity;
use crate::runtime::{ComposeProject, ServiceRuntime};
use anyhow::Context;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Label set on shared infrastructure containers
pub const SHARED_LABEL: &str = "dev.devgate.shared";

/// Label docker compose puts on every container of a project
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Seconds bollard waits on a daemon request
const DAEMON_TIMEOUT_SECS: u64 = 120;

/// Where the Docker daemon listens
#[derive(Debug, Clone, PartialEq, Eq)]
enum DaemonEndpoint {
    Socket(String),
    Http(String),
}

impl DaemonEndpoint {
    fn parse(host: &str) -> anyhow::Result<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            Ok(Self::Socket(path.to_string()))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Ok(Self::Http(host.to_string()))
        } else {
            anyhow::bail!(
                "docker host '{}' must start with unix://, tcp:// or http://",
                host
            )
        }
    }

    fn client(&self) -> anyhow::Result<Docker> {
        let client = match self {
            Self::Socket(path) => {
                Docker::connect_with_socket(path, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
            Self::Http(url) => {
                Docker::connect_with_http(url, DAEMON_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
            }
        };
        Ok(client)
    }
}

/// Local daemon sockets in lookup order
fn local_sockets(home: Option<&str>) -> Vec<String> {
    let mut sockets = vec!["/var/run/docker.sock".to_string()];
    if let Some(home) = home.filter(|h| !h.is_empty()) {
        sockets.push(format!("{}/.docker/run/docker.sock", home));
        sockets.push(format!("{}/.colima/default/docker.sock", home));
    }
    sockets
}

/// Manages Docker resources for shared infrastructure and environments
pub struct DockerRuntime {
    client: Docker,
    docker_cli: String,
}

impl DockerRuntime {
    /// Connect to the Docker daemon named by `--docker-host`, then
    /// `DOCKER_HOST`, then the first local socket that answers a ping.
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let explicit = docker_host
            .map(str::to_string)
            .or_else(|| std::env::var("DOCKER_HOST").ok().filter(|h| !h.is_empty()));

        let client = match explicit {
            Some(host) => DaemonEndpoint::parse(&host)?
                .client()
                .with_context(|| format!("devgate cannot reach Docker at '{}'", host))?,
            None => Self::first_local_daemon().await?,
        };

        client
            .ping()
            .await
            .context("Docker daemon did not answer; start it before running devgate")?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            docker_cli: "docker".to_string(),
        })
    }

    /// Use a specific docker CLI binary for compose operations
    pub fn with_cli(mut self, path: impl Into<String>) -> Self {
        self.docker_cli = path.into();
        self
    }

    async fn first_local_daemon() -> anyhow::Result<Docker> {
        for socket in local_sockets(std::env::var("HOME").ok().as_deref()) {
            if !std::path::Path::new(&socket).exists() {
                continue;
            }
            let Ok(client) = DaemonEndpoint::Socket(socket.clone()).client() else {
                continue;
            };
            if client.ping().await.is_ok() {
                debug!(socket, "Using local Docker socket");
                return Ok(client);
            }
        }

        Docker::connect_with_local_defaults()
            .context("no Docker socket found; start Docker or pass --docker-host")
    }

    async fn pull_image_if_missing(&self, image: &str) -> anyhow::Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result.with_context(|| format!("Failed to pull image '{}'", image))?;
            if let Some(error) = progress.error {
                anyhow::bail!("Failed to pull image '{}': {}", image, error);
            }
            if let Some(status) = progress.status {
                debug!(image, status, "Pull progress");
            }
        }
        Ok(())
    }

    /// Run `docker compose -p <identity> -f <file> <args>` in the workspace
    async fn compose(&self, project: &ComposeProject<'_>, args: &[&str]) -> anyhow::Result<()> {
        let mut cmd = Command::new(&self.docker_cli);
        cmd.arg("compose")
            .arg("-p")
            .arg(project.identity.as_str())
            .arg("-f")
            .arg(project.compose_file)
            .args(args)
            .current_dir(project.workspace)
            .envs(project.env);

        info!(
            identity = %project.identity,
            compose_file = %project.compose_file.display(),
            args = %args.join(" "),
            "Running docker compose"
        );

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run '{} compose'", self.docker_cli))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines().chain(stderr.lines()) {
            if !line.trim().is_empty() {
                debug!(target: "compose", identity = %project.identity, "{}", line);
            }
        }

        if output.status.success() {
            return Ok(());
        }

        let text = format!("{}\n{}", stderr.trim(), stdout.trim());
        if let Some(conflict) = conflict_from_output(&text) {
            return Err(conflict.into());
        }
        anyhow::bail!(
            "docker compose {} failed for '{}': {}",
            args.first().copied().unwrap_or_default(),
            project.identity,
            stderr.trim()
        )
    }
}

impl ServiceRuntime for DockerRuntime {
    async fn ensure_network(&self, name: &str) -> anyhow::Result<bool> {
        match self.client.inspect_network::<String>(name, None).await {
            Ok(_) => {
                debug!(network = name, "Network already exists");
                return Ok(false);
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e).context("Failed to inspect Docker network"),
        }

        info!(network = name, "Creating Docker network");
        self.client
            .create_network(CreateNetworkOptions {
                name,
                driver: "bridge",
                ..Default::default()
            })
            .await
            .context("Failed to create Docker network")?;
        Ok(true)
    }

    async fn remove_network(&self, name: &str) -> anyhow::Result<()> {
        match self.client.remove_network(name).await {
            Ok(()) => {
                info!(network = name, "Removed Docker network");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(network = name, "Network not found");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to remove Docker network"),
        }
    }

    async fn ensure_shared_service(
        &self,
        container_name: &str,
        service: &SharedServiceConfig,
        network: &str,
    ) -> anyhow::Result<bool> {
        match self.client.inspect_container(container_name, None).await {
            Ok(existing) => {
                let running = existing.state.and_then(|s| s.running).unwrap_or(false);
                if running {
                    debug!(container = container_name, "Shared service already running");
                } else {
                    self.client
                        .start_container::<String>(container_name, None)
                        .await
                        .with_context(|| {
                            format!("Failed to start shared service '{}'", container_name)
                        })?;
                    info!(container = container_name, "Started existing shared service");
                }
                return Ok(false);
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e).context("Failed to inspect shared service"),
        }

        self.pull_image_if_missing(&service.image).await?;

        let pairs = service
            .port_pairs()
            .map_err(|e| anyhow::anyhow!("Shared service '{}': {}", container_name, e))?;

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for (host, container) in pairs {
            let key = format!("{}/tcp", container);
            port_bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(host.to_string()),
                }]),
            );
            exposed_ports.insert(key, HashMap::new());
        }

        let env: Vec<String> = service
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut labels = HashMap::new();
        labels.insert(SHARED_LABEL.to_string(), "true".to_string());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: service.volume.clone().map(|v| vec![v]),
            network_mode: Some(network.to_string()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(service.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.to_string(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(create_options), container_config)
            .await
            .map_err(|e| {
                let err_str = e.to_string();
                match conflict_from_output(&err_str) {
                    Some(conflict) => anyhow::Error::from(conflict),
                    None => anyhow::anyhow!(
                        "Failed to create shared service '{}' from image '{}': {}",
                        container_name,
                        service.image,
                        e
                    ),
                }
            })?;

        self.client
            .start_container::<String>(&response.id, None)
            .await
            .map_err(|e| match conflict_from_output(&e.to_string()) {
                Some(conflict) => anyhow::Error::from(conflict),
                None => anyhow::anyhow!(
                    "Failed to start shared service '{}': {}",
                    container_name,
                    e
                ),
            })?;

        info!(
            container = container_name,
            image = %service.image,
            network,
            "Created shared service"
        );
        Ok(true)
    }

    async fn remove_shared_service(&self, container_name: &str) -> anyhow::Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_name, Some(options))
            .await
        {
            Ok(_) => {
                info!(container = container_name, "Removed shared service");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = container_name, "Shared service not found");
                Ok(())
            }
            Err(e) => Err(e).context("Failed to remove shared service"),
        }
    }

    async fn published_ports(&self, identity: &ProjectIdentity) -> anyhow::Result<Vec<u16>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", COMPOSE_PROJECT_LABEL, identity)],
        );

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list environment containers")?;

        let ports: Vec<u16> = containers
            .into_iter()
            .flat_map(|c| c.ports.unwrap_or_default())
            .filter_map(|p| p.public_port)
            .collect();

        debug!(identity = %identity, ports = ?ports, "Ports published by running environment");
        Ok(ports)
    }

    async fn compose_up(&self, project: &ComposeProject<'_>, rebuild: bool) -> anyhow::Result<()> {
        if rebuild {
            self.compose(
                project,
                &[
                    "up",
                    "-d",
                    "--build",
                    "--force-recreate",
                    "--renew-anon-volumes",
                    "--remove-orphans",
                ],
            )
            .await
        } else {
            self.compose(project, &["up", "-d", "--remove-orphans"]).await
        }
    }

    async fn compose_down(&self, project: &ComposeProject<'_>) -> anyhow::Result<()> {
        if let Err(e) = self.compose(project, &["down", "--remove-orphans"]).await {
            warn!(identity = %project.identity, error = %e, "docker compose down failed");
            return Err(e);
        }
        Ok(())
    }
}

/// Recognise a bind conflict in Docker output and name the port if possible
pub fn conflict_from_output(output: &str) -> Option<DevgateError> {
    let line = output.lines().find(|l| {
        l.contains("port is already allocated") || l.contains("address already in use")
    })?;

    let port = line.split_whitespace().find_map(|token| {
        let (_, port) = token.trim_end_matches(':').rsplit_once(':')?;
        port.parse::<u16>().ok()
    });

    Some(DevgateError::port_conflict(match port {
        Some(port) => format!("port {}", port),
        None => "an allocated port".to_string(),
    }))
}
