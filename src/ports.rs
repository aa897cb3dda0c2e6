//! Deterministic port allocation for concurrent workspaces
//!
//! Every workspace gets one offset in `[0, modulus)` that is added to each
//! service's base port. The preferred offset comes from a hash of the
//! workspace path; on collision the allocator probes linearly, like an
//! open-addressing table whose slots are offsets. An offset is only taken
//! when every service's port is free in the supplied snapshot.
//!
//! Nothing is persisted: the same path and the same snapshot always yield
//! the same offset, and a changed snapshot may yield a different one.

use crate::error::{DevgateError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, TcpListener};
use std::path::Path;
use tracing::{debug, warn};

/// Default size of the offset domain
pub const DEFAULT_MODULUS: u16 = 100;

/// Set of TCP ports observed as bound on the host at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSnapshot {
    bound: HashSet<u16>,
}

impl PortSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_ports<I: IntoIterator<Item = u16>>(ports: I) -> Self {
        Self {
            bound: ports.into_iter().collect(),
        }
    }

    /// Observe the live host.
    ///
    /// On Linux every listening socket in `/proc/net/tcp{,6}` is recorded.
    /// Each candidate port is additionally bind-probed on the wildcard and
    /// both loopback addresses, which also covers platforms without procfs.
    pub fn from_host<I: IntoIterator<Item = u16>>(candidates: I) -> Self {
        let mut bound = HashSet::new();

        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(content) = std::fs::read_to_string(table) {
                bound.extend(parse_proc_net_tcp(&content));
            }
        }

        for port in candidates {
            if !bound.contains(&port) && is_port_taken(port) {
                bound.insert(port);
            }
        }

        debug!(bound = bound.len(), "Captured bound port snapshot");
        Self { bound }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.bound.contains(&port)
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    /// Snapshot with the given ports treated as free
    pub fn without<I: IntoIterator<Item = u16>>(&self, ports: I) -> Self {
        let mut bound = self.bound.clone();
        for port in ports {
            bound.remove(&port);
        }
        Self { bound }
    }
}

/// Bind-probe one port.
///
/// With BSD socket semantics a wildcard bind succeeds next to a listener on
/// 127.0.0.1, and a `localhost` dev server may hold only `::1`, so all three
/// addresses are tried. A missing IPv6 stack is not a conflict.
fn is_port_taken(port: u16) -> bool {
    let v4 = [Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST]
        .into_iter()
        .any(|ip| match TcpListener::bind((ip, port)) {
            Ok(_) => false,
            Err(e) => e.kind() != ErrorKind::AddrNotAvailable,
        });
    if v4 {
        return true;
    }

    matches!(
        TcpListener::bind((Ipv6Addr::LOCALHOST, port)),
        Err(e) if e.kind() == ErrorKind::AddrInUse
    )
}

/// Extract listening ports from a `/proc/net/tcp` style table
fn parse_proc_net_tcp(content: &str) -> Vec<u16> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // st == 0A is TCP_LISTEN
            if fields.len() < 4 || fields[3] != "0A" {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            u16::from_str_radix(port_hex, 16).ok()
        })
        .collect()
}

/// Result of one allocation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    /// Chosen offset
    pub offset: u16,
    /// Offset derived from the path hash alone
    pub preferred: u16,
    /// No free offset existed; `offset == preferred` and binding may fail later
    pub exhausted: bool,
    /// Concrete port per service
    pub ports: BTreeMap<String, u16>,
}

/// Hash-plus-linear-probe allocator over a fixed service table
#[derive(Debug, Clone)]
pub struct PortAllocator {
    services: Vec<(String, u16)>,
    modulus: u16,
}

impl PortAllocator {
    /// Create an allocator for the given `(service, base_port)` table.
    ///
    /// Fails when the modulus is zero or when `base_port + modulus - 1`
    /// does not fit in a port number.
    pub fn new<I, S>(services: I, modulus: u16) -> Result<Self>
    where
        I: IntoIterator<Item = (S, u16)>,
        S: Into<String>,
    {
        if modulus == 0 {
            return Err(DevgateError::Config(
                "port modulus must be greater than 0".to_string(),
            ));
        }

        let services: Vec<(String, u16)> = services
            .into_iter()
            .map(|(name, base)| (name.into(), base))
            .collect();

        for (name, base) in &services {
            if u32::from(*base) + u32::from(modulus) - 1 > u32::from(u16::MAX) {
                return Err(DevgateError::invalid_service(
                    name,
                    format!("base port {} + modulus {} exceeds the port range", base, modulus),
                ));
            }
        }

        Ok(Self { services, modulus })
    }

    pub fn modulus(&self) -> u16 {
        self.modulus
    }

    /// Offset the workspace lands on when nothing collides
    pub fn preferred_offset(&self, workspace: &Path) -> u16 {
        (path_hash(workspace) % u64::from(self.modulus)) as u16
    }

    /// Every port any offset could map to; used to scope host probing
    pub fn candidate_ports(&self) -> Vec<u16> {
        self.services
            .iter()
            .flat_map(|(_, base)| (0..self.modulus).map(move |o| base + o))
            .collect()
    }

    /// Concrete ports for one offset
    pub fn ports_for(&self, offset: u16) -> BTreeMap<String, u16> {
        self.services
            .iter()
            .map(|(name, base)| (name.clone(), base + offset))
            .collect()
    }

    /// Choose an offset for the workspace against a bound-port snapshot.
    ///
    /// Probes `preferred, preferred + 1, ...` modulo the domain and returns
    /// the first offset whose ports are all free. When every offset is taken
    /// the preferred one is returned with `exhausted` set; the bind failure
    /// then surfaces when the services start.
    pub fn allocate(&self, workspace: &Path, snapshot: &PortSnapshot) -> Allocation {
        let preferred = self.preferred_offset(workspace);

        for i in 0..self.modulus {
            let offset = ((u32::from(preferred) + u32::from(i)) % u32::from(self.modulus)) as u16;
            if self.is_free(offset, snapshot) {
                if i > 0 {
                    debug!(
                        workspace = %workspace.display(),
                        preferred,
                        offset,
                        probes = i + 1,
                        "Preferred port offset taken, probed forward"
                    );
                }
                return Allocation {
                    offset,
                    preferred,
                    exhausted: false,
                    ports: self.ports_for(offset),
                };
            }
        }

        warn!(
            workspace = %workspace.display(),
            preferred,
            modulus = self.modulus,
            "No free port offset; falling back to the preferred offset"
        );
        Allocation {
            offset: preferred,
            preferred,
            exhausted: true,
            ports: self.ports_for(preferred),
        }
    }

    fn is_free(&self, offset: u16, snapshot: &PortSnapshot) -> bool {
        self.services
            .iter()
            .all(|(_, base)| !snapshot.contains(base + offset))
    }
}

/// Stable 64-bit hash of the full path string
pub fn path_hash(path: &Path) -> u64 {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
