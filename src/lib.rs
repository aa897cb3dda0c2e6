//! Devgate - parallel development environments on one host
//!
//! This library lets several working copies of the same project run side by
//! side without colliding:
//! - Allocates a per-workspace port offset from a stable hash of its path
//! - Derives per-service hostnames under a wildcard-DNS zone
//! - Publishes reverse-proxy rules per project identity, validated before reload
//! - Rewrites loopback-bound outbound URLs to the host gateway inside containers
//! - Shares one network plus data/cache services between all environments
//! - Rebuilds isolated services only when dependency descriptors change

pub mod config;
pub mod docker;
pub mod error;
pub mod fingerprint;
pub mod hostnames;
pub mod infra;
pub mod lifecycle;
pub mod loopback;
pub mod ports;
pub mod runtime;
pub mod vhost;

/// Package name for display
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
