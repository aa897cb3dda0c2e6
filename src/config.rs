use crate::error::{DevgateError, Result};
use crate::hostnames::{sanitize, HostAddressMode};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Default configuration file name, looked up at the workspace root
pub const CONFIG_FILE: &str = "devgate.toml";

/// Per-workspace configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Allocation and naming settings
    #[serde(default)]
    pub project: ProjectConfig,

    /// Isolated services, keyed by service name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    /// Reverse proxy rule store and control commands
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Shared infrastructure (databases, caches) used by every environment
    #[serde(default)]
    pub infra: InfraConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    /// Size of the port offset domain (default: 100)
    #[serde(default = "default_modulus")]
    pub modulus: u16,

    /// Wildcard DNS suffix embedding the host address (default: nip.io)
    #[serde(default = "default_wildcard_suffix")]
    pub wildcard_suffix: String,

    /// "auto" or a literal IP address used in hostnames
    #[serde(default = "default_host_address")]
    pub host_address: String,

    /// Name resolving to the host from inside containers
    #[serde(default = "default_gateway_alias")]
    pub gateway_alias: String,

    /// Compose file describing the isolated services (relative to the workspace)
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,

    /// Dependency descriptors whose content triggers a full rebuild when changed
    #[serde(default)]
    pub dependency_files: Vec<PathBuf>,

    /// Directory for per-workspace state (fingerprint, exported env)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            modulus: default_modulus(),
            wildcard_suffix: default_wildcard_suffix(),
            host_address: default_host_address(),
            gateway_alias: default_gateway_alias(),
            compose_file: default_compose_file(),
            dependency_files: Vec::new(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Base port; the concrete port is base_port + offset
    pub base_port: u16,

    /// URL scheme reported for this service (default: http)
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl ServiceConfig {
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            scheme: default_scheme(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Directory holding one rule file per project identity
    #[serde(default = "default_sites_dir")]
    pub sites_dir: PathBuf,

    /// Port the proxy listens on for wildcard hostnames (default: 80)
    #[serde(default = "default_proxy_listen_port")]
    pub listen_port: u16,

    /// Command validating the full proxy configuration
    #[serde(default = "default_validate_command")]
    pub validate_command: String,

    /// Command reloading the proxy after a successful validation
    #[serde(default = "default_reload_command")]
    pub reload_command: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            sites_dir: default_sites_dir(),
            listen_port: default_proxy_listen_port(),
            validate_command: default_validate_command(),
            reload_command: default_reload_command(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InfraConfig {
    /// Shared network joined by shared services and every environment
    #[serde(default = "default_network")]
    pub network: String,

    /// Shared services, keyed by name
    #[serde(default)]
    pub services: BTreeMap<String, SharedServiceConfig>,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            services: BTreeMap::new(),
        }
    }
}

/// A long-lived data or cache service shared between environments
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SharedServiceConfig {
    /// Container image
    pub image: String,

    /// Environment variables for the container
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Port publications as "host:container", bound on 127.0.0.1
    #[serde(default)]
    pub ports: Vec<String>,

    /// Named volume mount as "volume:/path/in/container"
    pub volume: Option<String>,
}

impl SharedServiceConfig {
    /// Parse the port publications into (host, container) pairs
    pub fn port_pairs(&self) -> std::result::Result<Vec<(u16, u16)>, String> {
        self.ports
            .iter()
            .map(|spec| {
                let (host, container) = spec
                    .split_once(':')
                    .ok_or_else(|| format!("port '{}' must be 'host:container'", spec))?;
                let host = host
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| format!("invalid host port in '{}'", spec))?;
                let container = container
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| format!("invalid container port in '{}'", spec))?;
                Ok((host, container))
            })
            .collect()
    }
}

// Default value functions
fn default_modulus() -> u16 {
    crate::ports::DEFAULT_MODULUS
}

fn default_wildcard_suffix() -> String {
    crate::hostnames::DEFAULT_WILDCARD_SUFFIX.to_string()
}

fn default_host_address() -> String {
    "auto".to_string()
}

fn default_gateway_alias() -> String {
    crate::loopback::DEFAULT_GATEWAY_ALIAS.to_string()
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".devgate")
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_sites_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/devgate.d")
}

fn default_proxy_listen_port() -> u16 {
    80
}

fn default_validate_command() -> String {
    "nginx -t".to_string()
}

fn default_reload_command() -> String {
    "nginx -s reload".to_string()
}

fn default_network() -> String {
    "devgate-shared".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| DevgateError::io(path, e))?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| DevgateError::Config(format!("Invalid devgate.toml: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let modulus = self.project.modulus;

        if modulus == 0 {
            errors.push("project.modulus must be greater than 0".to_string());
        }

        if self.project.wildcard_suffix.trim().is_empty() {
            errors.push("project.wildcard_suffix cannot be empty".to_string());
        }

        if let Err(e) = HostAddressMode::parse(&self.project.host_address) {
            errors.push(e);
        }

        if self.services.is_empty() {
            errors.push("no services declared under [services]".to_string());
        }

        for (name, service) in &self.services {
            if sanitize(name) != *name || name.is_empty() {
                errors.push(format!(
                    "Service '{}': name must use only lowercase letters, digits and hyphens",
                    name
                ));
            }
            if service.base_port == 0 {
                errors.push(format!("Service '{}': 'base_port' must be greater than 0", name));
            } else if u32::from(service.base_port) + u32::from(modulus.max(1)) - 1
                > u32::from(u16::MAX)
            {
                errors.push(format!(
                    "Service '{}': base_port {} + modulus {} exceeds the port range",
                    name, service.base_port, modulus
                ));
            }
        }

        if self.proxy.listen_port == 0 {
            errors.push("proxy.listen_port must be greater than 0".to_string());
        }

        for (field, command) in [
            ("validate_command", &self.proxy.validate_command),
            ("reload_command", &self.proxy.reload_command),
        ] {
            match shell_words::split(command) {
                Ok(words) if !words.is_empty() => {}
                Ok(_) => errors.push(format!("proxy.{} cannot be empty", field)),
                Err(e) => errors.push(format!("proxy.{}: {}", field, e)),
            }
        }

        for (name, shared) in &self.infra.services {
            if shared.image.trim().is_empty() {
                errors.push(format!("Shared service '{}': 'image' is required", name));
            }
            if let Err(e) = shared.port_pairs() {
                errors.push(format!("Shared service '{}': {}", name, e));
            }
        }

        if !errors.is_empty() {
            return Err(DevgateError::Config(format!(
                "Configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }

    /// Services and their base ports, ordered by name
    pub fn base_ports(&self) -> Vec<(String, u16)> {
        self.services
            .iter()
            .map(|(name, service)| (name.clone(), service.base_port))
            .collect()
    }

    pub fn host_address_mode(&self) -> HostAddressMode {
        HostAddressMode::parse(&self.project.host_address).unwrap_or(HostAddressMode::Auto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[project]
modulus = 50
wildcard_suffix = "sslip.io"
dependency_files = ["package-lock.json", "requirements.txt"]

[services.frontend]
base_port = 3000

[services.api]
base_port = 8000
scheme = "https"

[proxy]
sites_dir = "/tmp/devgate-sites"
listen_port = 8080

[infra]
network = "shared-net"

[infra.services.postgres]
image = "postgres:16-alpine"
ports = ["5432:5432"]
volume = "devgate-pg:/var/lib/postgresql/data"

[infra.services.postgres.env]
POSTGRES_PASSWORD = "dev"
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.project.modulus, 50);
        assert_eq!(config.project.wildcard_suffix, "sslip.io");
        assert_eq!(config.project.dependency_files.len(), 2);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services["api"].scheme, "https");
        assert_eq!(config.proxy.listen_port, 8080);
        assert_eq!(config.infra.network, "shared-net");
        assert_eq!(
            config.infra.services["postgres"].port_pairs().unwrap(),
            vec![(5432, 5432)]
        );
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::parse("[services.web]\nbase_port = 3000\n").unwrap();

        assert_eq!(config.project.modulus, 100);
        assert_eq!(config.project.wildcard_suffix, "nip.io");
        assert_eq!(config.project.gateway_alias, "host.docker.internal");
        assert_eq!(config.project.compose_file, PathBuf::from("docker-compose.yml"));
        assert_eq!(config.project.state_dir, PathBuf::from(".devgate"));
        assert_eq!(config.proxy.listen_port, 80);
        assert_eq!(config.proxy.validate_command, "nginx -t");
        assert_eq!(config.proxy.reload_command, "nginx -s reload");
        assert_eq!(config.infra.network, "devgate-shared");
        assert_eq!(config.services["web"].scheme, "http");
        assert_eq!(config.host_address_mode(), HostAddressMode::Auto);
    }

    #[test]
    fn test_base_ports_are_ordered_by_name() {
        let config = Config::parse(
            "[services.worker]\nbase_port = 5672\n[services.api]\nbase_port = 8000\n",
        )
        .unwrap();

        assert_eq!(
            config.base_ports(),
            vec![("api".to_string(), 8000), ("worker".to_string(), 5672)]
        );
    }

    #[test]
    fn test_validate_requires_services() {
        let err = Config::parse("").unwrap_err().to_string();
        assert!(err.contains("no services declared"));
    }

    #[test]
    fn test_validate_port_overflow_names_service() {
        let err = Config::parse("[services.api]\nbase_port = 65500\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("Service 'api'"));
        assert!(err.contains("exceeds the port range"));
    }

    #[test]
    fn test_validate_service_name() {
        let err = Config::parse("[services.Front_End]\nbase_port = 3000\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("Service 'Front_End'"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[project]
modulus = 0
host_address = "not-an-ip"

[services.api]
base_port = 0

[infra.services.redis]
image = ""
ports = ["6379"]
"#;
        let err = Config::parse(toml).unwrap_err().to_string();

        assert!(err.starts_with("Configuration errors:"));
        assert!(err.contains("project.modulus"));
        assert!(err.contains("host_address"));
        assert!(err.contains("'base_port' must be greater than 0"));
        assert!(err.contains("Shared service 'redis': 'image' is required"));
        assert!(err.contains("must be 'host:container'"));
    }

    #[test]
    fn test_fixed_host_address() {
        let config = Config::parse(
            "[project]\nhost_address = \"192.168.1.20\"\n[services.web]\nbase_port = 3000\n",
        )
        .unwrap();
        assert_eq!(
            config.host_address_mode(),
            HostAddressMode::Fixed("192.168.1.20".parse().unwrap())
        );
    }

    #[test]
    fn test_ipv6_host_address_rejected() {
        let err = Config::parse("[project]\nhost_address = \"::1\"\n[services.web]\nbase_port = 3000\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("IPv4"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/devgate.toml").unwrap_err();
        assert!(matches!(err, DevgateError::Io { .. }));
    }
}
