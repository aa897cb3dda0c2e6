//! Shared infrastructure: one network plus long-lived data/cache services
//!
//! Every environment attaches to the same network and reaches the shared
//! services by name. Bringing infrastructure up is idempotent and never
//! recreates a container that already exists, so data survives.

use crate::config::InfraConfig;
use crate::runtime::ServiceRuntime;
use anyhow::Context;
use serde::Serialize;
use tracing::info;

/// Docker container name of a shared service
pub fn shared_container_name(service: &str) -> String {
    format!("devgate-{}", service)
}

/// What `ensure` did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InfraReport {
    pub network: String,
    pub network_created: bool,
    /// Shared services created by this call
    pub created: Vec<String>,
    /// Shared services that already existed
    pub existing: Vec<String>,
}

/// Make sure the network and every shared service exist and run
pub async fn ensure<R: ServiceRuntime>(
    runtime: &R,
    config: &InfraConfig,
) -> anyhow::Result<InfraReport> {
    let network_created = runtime
        .ensure_network(&config.network)
        .await
        .with_context(|| format!("Failed to ensure network '{}'", config.network))?;

    let mut report = InfraReport {
        network: config.network.clone(),
        network_created,
        ..Default::default()
    };

    for (name, service) in &config.services {
        let container = shared_container_name(name);
        let created = runtime
            .ensure_shared_service(&container, service, &config.network)
            .await
            .with_context(|| format!("Failed to ensure shared service '{}'", name))?;
        if created {
            report.created.push(name.clone());
        } else {
            report.existing.push(name.clone());
        }
    }

    info!(
        network = %report.network,
        network_created,
        created = report.created.len(),
        existing = report.existing.len(),
        "Shared infrastructure ready"
    );
    Ok(report)
}

/// Remove every shared service, then the network. Named volumes are kept.
pub async fn teardown<R: ServiceRuntime>(runtime: &R, config: &InfraConfig) -> anyhow::Result<()> {
    for name in config.services.keys() {
        runtime
            .remove_shared_service(&shared_container_name(name))
            .await
            .with_context(|| format!("Failed to remove shared service '{}'", name))?;
    }
    runtime
        .remove_network(&config.network)
        .await
        .with_context(|| format!("Failed to remove network '{}'", config.network))?;

    info!(network = %config.network, "Shared infrastructure removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedServiceConfig;
    use crate::hostnames::ProjectIdentity;
    use crate::runtime::ComposeProject;
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    /// Runtime that keeps containers and networks in memory
    #[derive(Default)]
    struct InMemoryRuntime {
        networks: RefCell<BTreeSet<String>>,
        containers: RefCell<BTreeSet<String>>,
        calls: RefCell<Vec<String>>,
    }

    impl ServiceRuntime for InMemoryRuntime {
        async fn ensure_network(&self, name: &str) -> anyhow::Result<bool> {
            Ok(self.networks.borrow_mut().insert(name.to_string()))
        }

        async fn remove_network(&self, name: &str) -> anyhow::Result<()> {
            self.calls.borrow_mut().push(format!("rm-net {}", name));
            self.networks.borrow_mut().remove(name);
            Ok(())
        }

        async fn ensure_shared_service(
            &self,
            container_name: &str,
            _service: &SharedServiceConfig,
            network: &str,
        ) -> anyhow::Result<bool> {
            assert!(self.networks.borrow().contains(network));
            Ok(self.containers.borrow_mut().insert(container_name.to_string()))
        }

        async fn remove_shared_service(&self, container_name: &str) -> anyhow::Result<()> {
            self.calls.borrow_mut().push(format!("rm {}", container_name));
            self.containers.borrow_mut().remove(container_name);
            Ok(())
        }

        async fn published_ports(&self, _identity: &ProjectIdentity) -> anyhow::Result<Vec<u16>> {
            Ok(Vec::new())
        }

        async fn compose_up(&self, _project: &ComposeProject<'_>, _rebuild: bool) -> anyhow::Result<()> {
            Ok(())
        }

        async fn compose_down(&self, _project: &ComposeProject<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn infra() -> InfraConfig {
        let mut config = InfraConfig::default();
        for (name, image) in [("postgres", "postgres:16"), ("redis", "redis:7")] {
            config.services.insert(
                name.to_string(),
                SharedServiceConfig {
                    image: image.to_string(),
                    ..Default::default()
                },
            );
        }
        config
    }

    #[test]
    fn test_shared_container_name() {
        assert_eq!(shared_container_name("postgres"), "devgate-postgres");
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let runtime = InMemoryRuntime::default();
        let config = infra();

        let first = ensure(&runtime, &config).await.unwrap();
        assert!(first.network_created);
        assert_eq!(first.created, vec!["postgres", "redis"]);
        assert!(first.existing.is_empty());

        let second = ensure(&runtime, &config).await.unwrap();
        assert!(!second.network_created);
        assert!(second.created.is_empty());
        assert_eq!(second.existing, vec!["postgres", "redis"]);
    }

    #[tokio::test]
    async fn test_teardown_removes_services_before_network() {
        let runtime = InMemoryRuntime::default();
        let config = infra();
        ensure(&runtime, &config).await.unwrap();

        teardown(&runtime, &config).await.unwrap();

        assert_eq!(
            *runtime.calls.borrow(),
            vec![
                "rm devgate-postgres".to_string(),
                "rm devgate-redis".to_string(),
                "rm-net devgate-shared".to_string(),
            ]
        );
        assert!(runtime.containers.borrow().is_empty());
        assert!(runtime.networks.borrow().is_empty());
    }
}
