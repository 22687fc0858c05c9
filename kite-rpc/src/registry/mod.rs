//! Service registration and discovery over the coordination store

pub mod cache;
pub mod discovery;
pub mod service_registry;

use async_trait::async_trait;
use kite_core::{Endpoint, ExtensionPoint, Result, RpcRequest, ServiceKey};

pub use self::cache::{DiscoveryCache, EndpointList};
pub use self::discovery::CoordinatedServiceDiscovery;
pub use self::service_registry::CoordinatedServiceRegistry;

/// Publishes endpoints of locally served services
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Record `endpoint` as serving `key`. Re-registering is a no-op.
    async fn register_service(&self, key: &ServiceKey, endpoint: &Endpoint) -> Result<()>;

    /// Best-effort removal of every registration of `endpoint`
    async fn clear_all(&self, endpoint: &Endpoint);
}

impl ExtensionPoint for dyn ServiceRegistry {
    const NAME: &'static str = "kite.rpc.ServiceRegistry";
}

/// Resolves a request to the endpoint that should serve it
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn lookup_service(&self, request: &RpcRequest) -> Result<Endpoint>;
}

impl ExtensionPoint for dyn ServiceDiscovery {
    const NAME: &'static str = "kite.rpc.ServiceDiscovery";
}
