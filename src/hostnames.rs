//! Project identities and wildcard hostnames
//!
//! Hostnames have the form `{identity}-{service}.{host-address}.{suffix}`,
//! where the suffix is a wildcard DNS zone that resolves any name to the
//! address embedded in it.

use crate::error::{DevgateError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;
use tracing::{debug, warn};

/// Longest DNS label
pub const MAX_LABEL_LEN: usize = 63;

/// Default wildcard DNS suffix
pub const DEFAULT_WILDCARD_SUFFIX: &str = "nip.io";

/// Address used when the host publishes container ports on its own loopback
pub const LOOPBACK_HOST_ALIAS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Lowercase, turn path separators into hyphens and drop everything outside `[a-z0-9-]`
pub fn sanitize(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect()
}

/// Stable key for one workspace's hostnames and routing rules
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProjectIdentity(String);

impl ProjectIdentity {
    /// Derive the identity from the workspace's parent and own directory names
    pub fn from_workspace(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DevgateError::InvalidWorkspace(path.to_path_buf()))?;
        let parent = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned());

        match parent {
            Some(parent) => Self::from_parts(&parent, &name),
            None => Self::from_raw(&name)
                .ok_or_else(|| DevgateError::InvalidWorkspace(path.to_path_buf())),
        }
        .map_err(|_| DevgateError::InvalidWorkspace(path.to_path_buf()))
    }

    pub fn from_parts(parent: &str, name: &str) -> Result<Self> {
        Self::from_raw(&format!("{}/{}", parent, name)).ok_or_else(|| {
            DevgateError::Config(format!(
                "'{}/{}' has no characters usable in a project identity",
                parent, name
            ))
        })
    }

    fn from_raw(raw: &str) -> Option<Self> {
        // DNS labels may not start or end with a hyphen
        let sanitized = sanitize(raw);
        let trimmed = sanitized.trim_matches('-');
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fail when `{identity}-{service}` does not fit in one DNS label
    pub fn check_service_label(&self, service: &str) -> Result<()> {
        let len = self.0.len() + 1 + service.len();
        if len > MAX_LABEL_LEN {
            return Err(DevgateError::invalid_service(
                service,
                format!(
                    "hostname label '{}-{}' is {} characters, the limit is {}; \
                     shorten the workspace or parent directory name",
                    self.0, service, len, MAX_LABEL_LEN
                ),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ProjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How the host address embedded in hostnames is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAddressMode {
    /// Detect: virtualization alias if present, else the default route address
    Auto,
    /// Always use this address
    Fixed(IpAddr),
}

impl HostAddressMode {
    pub fn parse(value: &str) -> std::result::Result<Self, String> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("auto") {
            return Ok(HostAddressMode::Auto);
        }
        // Wildcard zones embed the address as dotted labels, which only IPv4 has
        value
            .parse::<Ipv4Addr>()
            .map(|v4| HostAddressMode::Fixed(IpAddr::V4(v4)))
            .map_err(|_| {
                format!(
                    "project.host_address must be 'auto' or an IPv4 address, got '{}'",
                    value
                )
            })
    }

    /// Resolve to a concrete address. Never fails; loopback is the last resort.
    pub fn resolve(&self) -> IpAddr {
        match self {
            HostAddressMode::Fixed(ip) => *ip,
            HostAddressMode::Auto => {
                if let Some(layer) = VirtualizationLayer::detect() {
                    debug!(?layer, "Host networking mapped to loopback alias");
                    return LOOPBACK_HOST_ALIAS;
                }
                default_route_address().unwrap_or_else(|| {
                    warn!("No default route found; using loopback in hostnames");
                    LOOPBACK_HOST_ALIAS
                })
            }
        }
    }
}

/// Virtualization layers that publish container ports on the host's loopback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualizationLayer {
    /// Docker Desktop style VM on macOS or Windows
    DesktopVm,
    /// Windows Subsystem for Linux
    Wsl,
}

impl VirtualizationLayer {
    pub fn detect() -> Option<Self> {
        if cfg!(any(target_os = "macos", target_os = "windows")) {
            return Some(VirtualizationLayer::DesktopVm);
        }
        let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
        Self::from_kernel_release(&release)
    }

    fn from_kernel_release(release: &str) -> Option<Self> {
        let release = release.to_lowercase();
        if release.contains("microsoft") || release.contains("wsl") {
            Some(VirtualizationLayer::Wsl)
        } else {
            None
        }
    }
}

/// Source address the kernel picks for the default outbound route.
///
/// Connecting a UDP socket selects a route without sending anything.
pub fn default_route_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("192.0.2.1", 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}

/// Per-service hostnames for one project identity and host address
#[derive(Debug, Clone)]
pub struct HostnameDirectory {
    identity: ProjectIdentity,
    host: IpAddr,
    suffix: String,
}

impl HostnameDirectory {
    pub fn new(identity: ProjectIdentity, host: IpAddr, suffix: impl Into<String>) -> Self {
        Self {
            identity,
            host,
            suffix: suffix.into().trim_matches('.').to_string(),
        }
    }

    pub fn identity(&self) -> &ProjectIdentity {
        &self.identity
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn hostname(&self, service: &str) -> String {
        format!("{}-{}.{}.{}", self.identity, service, self.host, self.suffix)
    }

    pub fn hostnames<'a, I>(&self, services: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        services
            .into_iter()
            .map(|service| (service.to_string(), self.hostname(service)))
            .collect()
    }
}
