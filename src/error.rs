//! Error types for allocation, routing and environment lifecycle

use std::path::PathBuf;
use thiserror::Error;

/// Remedy attached to every bind conflict surfaced at service start
const PORT_CONFLICT_REMEDY: &str =
    "re-run `devgate start` to re-allocate an offset, or raise `project.modulus` in devgate.toml";

/// Errors returned by the devgate core
#[derive(Debug, Error)]
pub enum DevgateError {
    /// Configuration could not be parsed or failed validation
    #[error("{0}")]
    Config(String),

    /// Workspace path has no usable directory name
    #[error("workspace '{}' has no directory name to derive a project identity from", .0.display())]
    InvalidWorkspace(PathBuf),

    /// A declared service cannot be allocated or routed
    #[error("service '{service}': {reason}")]
    InvalidService { service: String, reason: String },

    /// URL handed to the loopback resolver could not be parsed
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The proxy rejected the candidate rule block; the previous block is still active
    #[error("routing rules for '{identity}' rejected (service: {service}): {output}")]
    ProxyValidation {
        identity: String,
        service: String,
        output: String,
    },

    /// The proxy accepted the rules but could not be reloaded
    #[error("proxy reload failed: {0}")]
    ProxyReload(String),

    /// An isolated service could not bind its allocated port
    #[error("{detail} is already in use: {remedy}")]
    PortConflict { detail: String, remedy: String },

    /// Filesystem access failed
    #[error("failed to access '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias used across the core modules
pub type Result<T, E = DevgateError> = std::result::Result<T, E>;

impl DevgateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DevgateError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_service(service: impl Into<String>, reason: impl Into<String>) -> Self {
        DevgateError::InvalidService {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Build a bind-conflict error carrying the standard remedy
    pub fn port_conflict(detail: impl Into<String>) -> Self {
        DevgateError::PortConflict {
            detail: detail.into(),
            remedy: PORT_CONFLICT_REMEDY.to_string(),
        }
    }
}
