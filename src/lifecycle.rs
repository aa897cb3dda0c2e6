//! Environment lifecycle: ordering of infra, allocation, build and routing
//!
//! `start` runs, in order: shared infrastructure, port allocation, hostname
//! derivation, the dependency fingerprint check, the isolated services and
//! finally the routing rules. Nothing is routed to services that failed to
//! start. `stop` reverses the last two steps and leaves shared
//! infrastructure alone.

use crate::config::{Config, CONFIG_FILE};
use crate::error::{DevgateError, Result};
use crate::fingerprint::{Fingerprint, FingerprintStore};
use crate::hostnames::{HostnameDirectory, ProjectIdentity};
use crate::infra::{self, InfraReport};
use crate::ports::{PortAllocator, PortSnapshot};
use crate::runtime::{ComposeProject, ServiceRuntime};
use crate::vhost::{ProxyController, RuleBlock, RuleStore, VhostManager};
use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the exported environment file inside the state directory
pub const ENV_FILE: &str = "env";

/// A working copy plus its configuration
#[derive(Debug, Clone)]
pub struct Workspace {
    path: PathBuf,
    config: Config,
    identity: ProjectIdentity,
}

impl Workspace {
    /// Open a workspace directory, reading `devgate.toml` from it unless
    /// another configuration file is given
    pub fn open(path: &Path, config_path: Option<&Path>) -> Result<Self> {
        let path = path.canonicalize().map_err(|e| DevgateError::io(path, e))?;
        let config = match config_path {
            Some(file) => Config::load(file)?,
            None => Config::load(path.join(CONFIG_FILE))?,
        };
        Self::new(path, config)
    }

    /// Use an already loaded configuration. The path is taken as given.
    pub fn new(path: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let path = path.into();
        let identity = ProjectIdentity::from_workspace(&path)?;
        for service in config.services.keys() {
            identity.check_service_label(service)?;
        }
        Ok(Self {
            path,
            config,
            identity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &ProjectIdentity {
        &self.identity
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path.join(&self.config.project.state_dir)
    }

    pub fn compose_file(&self) -> PathBuf {
        self.path.join(&self.config.project.compose_file)
    }

    pub fn env_file(&self) -> PathBuf {
        self.state_dir().join(ENV_FILE)
    }

    pub fn allocator(&self) -> Result<PortAllocator> {
        PortAllocator::new(self.config.base_ports(), self.config.project.modulus)
    }
}

/// One routed service of an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEndpoint {
    pub service: String,
    pub hostname: String,
    pub port: u16,
    pub url: String,
}

/// Addresses and state of one environment
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    pub identity: ProjectIdentity,
    pub workspace: PathBuf,
    pub host_address: IpAddr,
    pub offset: u16,
    pub preferred_offset: u16,
    /// No free offset existed; ports may collide
    pub exhausted: bool,
    pub network: String,
    pub gateway_alias: String,
    /// Services were rebuilt because dependency descriptors changed
    pub rebuilt: bool,
    /// Routing rules are installed at the proxy
    pub routed: bool,
    pub services: Vec<ServiceEndpoint>,
}

impl EnvironmentReport {
    pub fn hostnames(&self) -> BTreeMap<String, String> {
        self.services
            .iter()
            .map(|s| (s.service.clone(), s.hostname.clone()))
            .collect()
    }

    pub fn ports(&self) -> BTreeMap<String, u16> {
        self.services
            .iter()
            .map(|s| (s.service.clone(), s.port))
            .collect()
    }

    pub fn rule_block(&self) -> Result<RuleBlock> {
        RuleBlock::new(self.identity.clone(), &self.hostnames(), &self.ports())
    }

    /// Configuration values exported to the isolated services
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("DEVGATE_PROJECT".to_string(), self.identity.to_string());
        vars.insert("DEVGATE_NETWORK".to_string(), self.network.clone());
        vars.insert("DEVGATE_PORT_OFFSET".to_string(), self.offset.to_string());
        vars.insert("DEVGATE_GATEWAY_ALIAS".to_string(), self.gateway_alias.clone());
        for endpoint in &self.services {
            let key = env_key(&endpoint.service);
            vars.insert(format!("{}_PORT", key), endpoint.port.to_string());
            vars.insert(format!("{}_HOST", key), endpoint.hostname.clone());
            vars.insert(format!("{}_URL", key), endpoint.url.clone());
        }
        vars
    }

    /// `KEY=value` lines, one per exported variable
    pub fn to_dotenv(&self) -> String {
        let mut out = format!("# generated by devgate for {}\n", self.identity);
        for (key, value) in self.env_vars() {
            out.push_str(&format!("{}={}\n", key, value));
        }
        out
    }
}

/// `frontend-web` -> `FRONTEND_WEB`
fn env_key(service: &str) -> String {
    service.to_ascii_uppercase().replace('-', "_")
}

/// Parse a file written by [`EnvironmentReport::to_dotenv`]
pub fn parse_dotenv(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .collect()
}

/// Compute the allocation and addresses of a workspace without side effects
pub fn plan(workspace: &Workspace, host: IpAddr, snapshot: &PortSnapshot) -> Result<EnvironmentReport> {
    let config = workspace.config();
    let allocation = workspace.allocator()?.allocate(workspace.path(), snapshot);
    let directory = HostnameDirectory::new(
        workspace.identity().clone(),
        host,
        config.project.wildcard_suffix.as_str(),
    );

    let listen_port = config.proxy.listen_port;
    let services = allocation
        .ports
        .iter()
        .map(|(service, port)| {
            let hostname = directory.hostname(service);
            let scheme = config
                .services
                .get(service)
                .map(|s| s.scheme.as_str())
                .unwrap_or("http");
            let url = if listen_port == 80 {
                format!("{}://{}", scheme, hostname)
            } else {
                format!("{}://{}:{}", scheme, hostname, listen_port)
            };
            ServiceEndpoint {
                service: service.clone(),
                hostname,
                port: *port,
                url,
            }
        })
        .collect();

    let report = EnvironmentReport {
        identity: workspace.identity().clone(),
        workspace: workspace.path().to_path_buf(),
        host_address: host,
        offset: allocation.offset,
        preferred_offset: allocation.preferred,
        exhausted: allocation.exhausted,
        network: config.infra.network.clone(),
        gateway_alias: config.project.gateway_alias.clone(),
        rebuilt: false,
        routed: false,
        services,
    };

    // Surface unroutable hostnames before anything starts
    report.rule_block()?.check()?;
    Ok(report)
}

/// Drives environments through their lifecycle
pub struct LifecycleManager<R, S, C> {
    runtime: R,
    vhosts: VhostManager<S, C>,
}

impl<R: ServiceRuntime, S: RuleStore, C: ProxyController> LifecycleManager<R, S, C> {
    pub fn new(runtime: R, vhosts: VhostManager<S, C>) -> Self {
        Self { runtime, vhosts }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn vhosts(&self) -> &VhostManager<S, C> {
        &self.vhosts
    }

    pub async fn infra_up(&self, workspace: &Workspace) -> anyhow::Result<InfraReport> {
        infra::ensure(&self.runtime, &workspace.config().infra).await
    }

    pub async fn infra_down(&self, workspace: &Workspace) -> anyhow::Result<()> {
        infra::teardown(&self.runtime, &workspace.config().infra).await
    }

    /// The snapshot minus ports held by this environment's own containers,
    /// so a restart keeps its offset
    async fn foreign_ports(&self, workspace: &Workspace, snapshot: &PortSnapshot) -> PortSnapshot {
        match self.runtime.published_ports(workspace.identity()).await {
            Ok(own) => snapshot.without(own),
            Err(e) => {
                warn!(identity = %workspace.identity(), error = %e, "Could not list own published ports");
                snapshot.clone()
            }
        }
    }

    /// Current allocation, addresses and routing state
    pub async fn status(
        &self,
        workspace: &Workspace,
        host: IpAddr,
        snapshot: &PortSnapshot,
    ) -> anyhow::Result<EnvironmentReport> {
        let snapshot = self.foreign_ports(workspace, snapshot).await;
        let mut report = plan(workspace, host, &snapshot)?;
        report.routed = self.vhosts.is_installed(workspace.identity())?;
        Ok(report)
    }

    /// Bring the environment up and publish its routing rules
    pub async fn start(
        &mut self,
        workspace: &Workspace,
        host: IpAddr,
        snapshot: &PortSnapshot,
    ) -> anyhow::Result<EnvironmentReport> {
        let identity = workspace.identity();
        let config = workspace.config();

        let infra = self.infra_up(workspace).await?;
        debug!(identity = %identity, network = %infra.network, "Shared infrastructure ensured");

        let snapshot = self.foreign_ports(workspace, snapshot).await;
        let mut report = plan(workspace, host, &snapshot)?;
        if report.exhausted {
            warn!(
                identity = %identity,
                offset = report.offset,
                "Every offset is taken; starting on the preferred offset anyway"
            );
        }

        let fingerprint = Fingerprint::compute(workspace.path(), &config.project.dependency_files);
        let fingerprints = FingerprintStore::new(&workspace.state_dir());
        let rebuild = fingerprints.needs_rebuild(&fingerprint);
        if rebuild {
            info!(identity = %identity, "Dependency descriptors changed; rebuilding services");
        }

        let env = report.env_vars();
        write_env_file(&workspace.env_file(), &report.to_dotenv())?;

        let compose_file = workspace.compose_file();
        let project = ComposeProject {
            identity,
            workspace: workspace.path(),
            compose_file: &compose_file,
            env: &env,
        };
        self.runtime
            .compose_up(&project, rebuild)
            .await
            .with_context(|| format!("Failed to start services of '{}'", identity))?;

        if rebuild {
            fingerprints.save(&fingerprint)?;
        }
        report.rebuilt = rebuild;

        self.vhosts.install(&report.rule_block()?).await?;
        report.routed = true;

        info!(
            identity = %identity,
            offset = report.offset,
            services = report.services.len(),
            rebuilt = rebuild,
            "Environment started"
        );
        Ok(report)
    }

    /// Stop the isolated services and remove the routing rules.
    /// Returns whether routing rules existed.
    pub async fn stop(&mut self, workspace: &Workspace) -> anyhow::Result<bool> {
        let identity = workspace.identity();
        let env = read_env_file(&workspace.env_file())?;
        let compose_file = workspace.compose_file();
        let project = ComposeProject {
            identity,
            workspace: workspace.path(),
            compose_file: &compose_file,
            env: &env,
        };

        self.runtime
            .compose_down(&project)
            .await
            .with_context(|| format!("Failed to stop services of '{}'", identity))?;

        let removed = self.vhosts.teardown(identity).await?;
        info!(identity = %identity, routing_removed = removed, "Environment stopped");
        Ok(removed)
    }
}

fn write_env_file(path: &Path, content: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| DevgateError::io(dir, e))?;
    }
    fs::write(path, content).map_err(|e| DevgateError::io(path, e))
}

fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse_dotenv(&content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(DevgateError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use std::net::Ipv4Addr;

    fn workspace(path: &str) -> Workspace {
        let mut config = Config::default();
        config.services.insert("frontend".to_string(), ServiceConfig::new(3000));
        config.services.insert("api".to_string(), ServiceConfig::new(8000));
        Workspace::new(path, config).unwrap()
    }

    const HOST: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));

    #[test]
    fn test_plan_uses_preferred_offset() {
        let report = plan(&workspace("/w/proj-main"), HOST, &PortSnapshot::empty()).unwrap();

        assert_eq!(report.offset, 22);
        assert_eq!(report.preferred_offset, 22);
        assert!(!report.exhausted);
        assert_eq!(report.ports()["frontend"], 3022);
        assert_eq!(report.ports()["api"], 8022);
        assert_eq!(
            report.hostnames()["api"],
            "w-proj-main-api.10.0.0.5.nip.io"
        );
        assert_eq!(report.services[0].url, "http://w-proj-main-api.10.0.0.5.nip.io");
    }

    #[test]
    fn test_plan_url_includes_non_default_listen_port() {
        let mut ws = workspace("/w/proj-main");
        ws.config.proxy.listen_port = 8080;
        let report = plan(&ws, HOST, &PortSnapshot::empty()).unwrap();
        assert_eq!(
            report.services[0].url,
            "http://w-proj-main-api.10.0.0.5.nip.io:8080"
        );
    }

    #[test]
    fn test_env_vars() {
        let report = plan(&workspace("/w/proj-main"), HOST, &PortSnapshot::empty()).unwrap();
        let vars = report.env_vars();

        assert_eq!(vars["DEVGATE_PROJECT"], "w-proj-main");
        assert_eq!(vars["DEVGATE_NETWORK"], "devgate-shared");
        assert_eq!(vars["DEVGATE_PORT_OFFSET"], "22");
        assert_eq!(vars["DEVGATE_GATEWAY_ALIAS"], "host.docker.internal");
        assert_eq!(vars["FRONTEND_PORT"], "3022");
        assert_eq!(vars["API_HOST"], "w-proj-main-api.10.0.0.5.nip.io");
    }

    #[test]
    fn test_dotenv_roundtrip() {
        let report = plan(&workspace("/w/proj-main"), HOST, &PortSnapshot::empty()).unwrap();
        let text = report.to_dotenv();

        assert!(text.starts_with("# generated by devgate for w-proj-main\n"));
        assert_eq!(parse_dotenv(&text), report.env_vars());
    }

    #[test]
    fn test_plan_rejects_unroutable_host_address() {
        let host = IpAddr::V6(std::net::Ipv6Addr::LOCALHOST);
        let err = plan(&workspace("/w/proj-main"), host, &PortSnapshot::empty()).unwrap_err();
        assert!(matches!(err, DevgateError::ProxyValidation { .. }));
    }

    #[test]
    fn test_workspace_rejects_overlong_hostname_label() {
        let long = format!("/w/{}", "feature-".repeat(7));
        let mut config = Config::default();
        config.services.insert("frontend".to_string(), ServiceConfig::new(3000));

        let err = Workspace::new(long, config).unwrap_err();
        assert!(matches!(err, DevgateError::InvalidService { ref service, .. } if service == "frontend"));
    }

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("frontend-web"), "FRONTEND_WEB");
        assert_eq!(env_key("api"), "API");
    }

    #[test]
    fn test_workspace_paths() {
        let ws = workspace("/w/proj-main");
        assert_eq!(ws.identity().as_str(), "w-proj-main");
        assert_eq!(ws.state_dir(), PathBuf::from("/w/proj-main/.devgate"));
        assert_eq!(ws.env_file(), PathBuf::from("/w/proj-main/.devgate/env"));
        assert_eq!(
            ws.compose_file(),
            PathBuf::from("/w/proj-main/docker-compose.yml")
        );
    }
}
