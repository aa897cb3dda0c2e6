//! Loopback-aware rewriting of outbound URLs
//!
//! Wildcard hostnames such as `app-api.127.0.0.1.nip.io` resolve to the
//! address embedded in them. Inside a container that address is the
//! container itself, so a call to a sibling environment silently goes
//! nowhere. When a URL's host resolves to loopback, the request is sent to
//! the host gateway alias instead and the original host travels along as an
//! explicit `Host` header, which keeps virtual-host routing at the proxy
//! intact.

use crate::error::{DevgateError, Result};
use reqwest::header::{HeaderValue, HOST};
use reqwest::{Client, Method, RequestBuilder, Url};
use std::io;
use std::net::{IpAddr, Ipv6Addr};
use tracing::debug;

/// Name resolving to the host from inside a container
pub const DEFAULT_GATEWAY_ALIAS: &str = "host.docker.internal";

/// True for 127.0.0.0/8 and `::1`
pub fn is_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[0] == 127,
        IpAddr::V6(v6) => *v6 == Ipv6Addr::LOCALHOST,
    }
}

/// Name resolution used to classify a URL's host
#[allow(async_fn_in_trait)]
pub trait HostLookup {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        Ok(tokio::net::lookup_host((host, port))
            .await?
            .map(|addr| addr.ip())
            .collect())
    }
}

/// Outcome of classifying one outbound URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackRewrite {
    /// URL to connect to
    pub url: Url,
    /// Original `host[:port]` to send as the Host header, set only when rewritten
    pub host_override: Option<String>,
}

impl LoopbackRewrite {
    fn unchanged(url: &Url) -> Self {
        Self {
            url: url.clone(),
            host_override: None,
        }
    }

    pub fn is_rewritten(&self) -> bool {
        self.host_override.is_some()
    }
}

/// Rewrites loopback-bound URLs to go through the host gateway
#[derive(Debug, Clone)]
pub struct LoopbackResolver<L = SystemLookup> {
    lookup: L,
    gateway_alias: String,
}

impl LoopbackResolver<SystemLookup> {
    pub fn new() -> Self {
        Self::with_lookup(SystemLookup, DEFAULT_GATEWAY_ALIAS)
    }
}

impl Default for LoopbackResolver<SystemLookup> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: HostLookup> LoopbackResolver<L> {
    pub fn with_lookup(lookup: L, gateway_alias: impl Into<String>) -> Self {
        Self {
            lookup,
            gateway_alias: gateway_alias.into(),
        }
    }

    pub fn gateway_alias(&self) -> &str {
        &self.gateway_alias
    }

    /// Classify the URL's host and rewrite it when it resolves to loopback.
    ///
    /// Resolution failures leave the URL untouched; the caller's own
    /// connection attempt reports any real problem.
    pub async fn rewrite(&self, url: &Url) -> LoopbackRewrite {
        let Some(host) = url.host_str() else {
            return LoopbackRewrite::unchanged(url);
        };
        let bare = host.trim_start_matches('[').trim_end_matches(']');

        let resolved = match bare.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                let port = url.port_or_known_default().unwrap_or(80);
                match self.lookup.lookup(bare, port).await {
                    Ok(addrs) => addrs.into_iter().next(),
                    Err(e) => {
                        debug!(host = bare, error = %e, "Lookup failed; leaving URL unchanged");
                        None
                    }
                }
            }
        };

        match resolved {
            Some(ip) if is_loopback(&ip) => {
                let original = match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                };
                let mut rewritten = url.clone();
                if rewritten.set_host(Some(&self.gateway_alias)).is_err() {
                    return LoopbackRewrite::unchanged(url);
                }
                debug!(
                    from = %original,
                    to = %self.gateway_alias,
                    "Rewrote loopback-bound URL to host gateway"
                );
                LoopbackRewrite {
                    url: rewritten,
                    host_override: Some(original),
                }
            }
            _ => LoopbackRewrite::unchanged(url),
        }
    }

    /// Parse then rewrite
    pub async fn rewrite_str(&self, url: &str) -> Result<LoopbackRewrite> {
        let parsed = Url::parse(url).map_err(|e| DevgateError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.rewrite(&parsed).await)
    }

    /// Build an outbound request with the rewrite and Host header applied
    pub async fn request(&self, client: &Client, method: Method, url: &Url) -> RequestBuilder {
        let rewrite = self.rewrite(url).await;
        let builder = client.request(method, rewrite.url);
        match rewrite
            .host_override
            .and_then(|host| HeaderValue::from_str(&host).ok())
        {
            Some(value) => builder.header(HOST, value),
            None => builder,
        }
    }
}
