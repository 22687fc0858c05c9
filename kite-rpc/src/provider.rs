//! Server-side routing table of published services

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kite_core::{Endpoint, Error, Result, ServiceKey};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::registry::ServiceRegistry;

/// A locally implemented remote interface
#[async_trait]
pub trait RpcService: Send + Sync {
    /// Interface name clients address this service by
    fn interface_name(&self) -> &str;

    /// Invoke `method` with positional `params`
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value>;
}

/// A service instance together with the group and version it is published under
#[derive(Clone)]
pub struct ServiceConfig {
    pub group: String,
    pub version: String,
    pub service: Arc<dyn RpcService>,
}

impl ServiceConfig {
    pub fn new(service: Arc<dyn RpcService>) -> Self {
        Self {
            group: String::new(),
            version: String::new(),
            service,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(self.service.interface_name(), &self.group, &self.version)
    }
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("interface", &self.service.interface_name())
            .field("group", &self.group)
            .field("version", &self.version)
            .finish()
    }
}

/// Maps service keys to local instances and publishes them to the registry
pub struct ServiceProvider {
    services: DashMap<ServiceKey, Arc<dyn RpcService>>,
    registry: Arc<dyn ServiceRegistry>,
    /// Advertised host; resolved from the primary interface when `None`
    host: Option<String>,
    port: u16,
}

impl ServiceProvider {
    /// Provider advertising `port`, the port the transport listens on
    pub fn new(registry: Arc<dyn ServiceRegistry>, port: u16) -> Self {
        Self {
            services: DashMap::new(),
            registry,
            host: None,
            port,
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Store the instance unless the key is already served; first registration wins
    pub fn add_service(&self, config: &ServiceConfig) -> bool {
        let key = config.service_key();
        match self.services.entry(key) {
            Entry::Occupied(entry) => {
                debug!(service = %entry.key(), "Service already added, keeping first instance");
                false
            }
            Entry::Vacant(entry) => {
                info!(service = %entry.key(), "Added service");
                entry.insert(config.service.clone());
                true
            }
        }
    }

    pub fn get_service(&self, key: &ServiceKey) -> Result<Arc<dyn RpcService>> {
        self.services
            .get(key)
            .map(|service| service.value().clone())
            .ok_or_else(|| Error::ServiceNotFound(key.to_string()))
    }

    /// Add the service locally and register this host's endpoint for it.
    ///
    /// If the advertised host cannot be resolved the publish is abandoned
    /// and logged, not failed.
    pub async fn publish_service(&self, config: ServiceConfig) -> Result<()> {
        let Some(endpoint) = self.endpoint() else {
            warn!(service = %config.service_key(), "Could not resolve local host address, service not published");
            return Ok(());
        };

        self.add_service(&config);
        self.registry
            .register_service(&config.service_key(), &endpoint)
            .await
    }

    /// Remove every registration of this provider's endpoint
    pub async fn unpublish_all(&self) {
        if let Some(endpoint) = self.endpoint() {
            self.registry.clear_all(&endpoint).await;
        }
    }

    #[must_use]
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Endpoint advertised to the registry
    pub fn endpoint(&self) -> Option<Endpoint> {
        let host = match &self.host {
            Some(host) => host.clone(),
            None => local_ip()?,
        };
        Some(Endpoint::new(host, self.port))
    }
}

/// Address of the interface that routes to the outside world
fn local_ip() -> Option<String> {
    use std::net::UdpSocket;

    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map(|addr| addr.ip().to_string())
        .map_err(|e| warn!(error = %e, "Failed to determine local IP address"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MockServiceRegistry;
    use serde_json::json;

    struct Greeter;

    #[async_trait]
    impl RpcService for Greeter {
        fn interface_name(&self) -> &str {
            "demo.Greeter"
        }

        async fn call(&self, _method: &str, params: Vec<Value>) -> Result<Value> {
            Ok(json!(format!("hello {}", params[0])))
        }
    }

    fn greeter_v1() -> ServiceConfig {
        ServiceConfig::new(Arc::new(Greeter)).with_version("v1")
    }

    #[test]
    fn test_service_key_from_config() {
        let config = greeter_v1().with_group("blue");
        assert_eq!(config.service_key(), ServiceKey::new("demo.Greeter", "blue", "v1"));
    }

    #[test]
    fn test_first_registration_wins() {
        let provider = ServiceProvider::new(Arc::new(MockServiceRegistry::new()), 9000);
        let first = greeter_v1();
        let second = greeter_v1();

        assert!(provider.add_service(&first));
        assert!(!provider.add_service(&second));

        let stored = provider.get_service(&first.service_key()).unwrap();
        assert!(Arc::ptr_eq(&stored, &first.service));
        assert_eq!(provider.service_count(), 1);
    }

    #[test]
    fn test_missing_service_is_not_found() {
        let provider = ServiceProvider::new(Arc::new(MockServiceRegistry::new()), 9000);
        let err = provider
            .get_service(&ServiceKey::new("demo.Greeter", "", "v2"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::ServiceNotFound(key) if key == "demo.Greeterv2"));
    }

    #[tokio::test]
    async fn test_publish_registers_advertised_endpoint() {
        let mut registry = MockServiceRegistry::new();
        registry
            .expect_register_service()
            .withf(|key, endpoint| {
                key.to_string() == "demo.Greeterv1" && *endpoint == Endpoint::new("10.0.0.5", 9000)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let provider = ServiceProvider::new(Arc::new(registry), 9000).with_host("10.0.0.5");

        provider.publish_service(greeter_v1()).await.unwrap();

        assert_eq!(provider.service_count(), 1);
    }
}
