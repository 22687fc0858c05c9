use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::future::join_all;
use kite_core::{Endpoint, Result, ServiceKey};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::ServiceRegistry;
use crate::coordination::{self, path, CoordinationClient};

/// Registry writing persistent nodes to the coordination store.
///
/// Paths written by this process are remembered so repeated registrations
/// skip the store and shutdown can remove exactly what was added.
pub struct CoordinatedServiceRegistry {
    client: OnceCell<Arc<dyn CoordinationClient>>,
    registered: DashSet<String>,
}

impl CoordinatedServiceRegistry {
    pub const TYPE_NAME: &'static str = "kite_rpc::registry::CoordinatedServiceRegistry";

    /// Registry using the process-wide coordination client
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
            registered: DashSet::new(),
        }
    }

    #[must_use]
    pub fn with_client(client: Arc<dyn CoordinationClient>) -> Self {
        Self {
            client: OnceCell::new_with(Some(client)),
            registered: DashSet::new(),
        }
    }

    /// Paths registered by this process
    pub fn registered_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.registered.iter().map(|p| p.key().clone()).collect();
        paths.sort();
        paths
    }

    async fn client(&self) -> Result<Arc<dyn CoordinationClient>> {
        self.client
            .get_or_try_init(coordination::shared_client)
            .await
            .cloned()
    }
}

impl Default for CoordinatedServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRegistry for CoordinatedServiceRegistry {
    async fn register_service(&self, key: &ServiceKey, endpoint: &Endpoint) -> Result<()> {
        let node = path::endpoint_path(key, endpoint);
        if self.registered.contains(&node) {
            debug!(path = %node, "Service already registered by this process");
            return Ok(());
        }

        let client = self.client().await?;
        match client.exists(&node).await {
            Ok(true) => {
                debug!(path = %node, "Service node already exists");
                self.registered.insert(node);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(path = %node, error = %e, "Failed to check service node, registration skipped");
                return Ok(());
            }
        }

        match client.create_persistent(&node).await {
            Ok(_) => {
                info!(service = %key, endpoint = %endpoint, path = %node, "Service registered");
                self.registered.insert(node);
            }
            Err(e) => {
                warn!(path = %node, error = %e, "Failed to create service node, registration skipped");
            }
        }
        Ok(())
    }

    async fn clear_all(&self, endpoint: &Endpoint) {
        let suffix = format!("/{endpoint}");
        let paths: Vec<String> = self
            .registered
            .iter()
            .filter(|p| p.ends_with(&suffix))
            .map(|p| p.key().clone())
            .collect();
        if paths.is_empty() {
            return;
        }

        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Coordination client unavailable, registrations not cleared");
                return;
            }
        };

        let results = join_all(paths.iter().map(|node| {
            let client = client.clone();
            async move { (node, client.delete(node).await) }
        }))
        .await;

        for (node, result) in results {
            match result {
                Ok(_) => {
                    self.registered.remove(node);
                }
                Err(e) => warn!(path = %node, error = %e, "Failed to remove service node"),
            }
        }
        info!(endpoint = %endpoint, count = paths.len(), "Cleared service registrations");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{MemoryCoordinator, MockCoordinationClient};
    use kite_core::Error;
    use mockall::predicate::eq;

    fn greeter() -> ServiceKey {
        ServiceKey::new("demo.Greeter", "", "v1")
    }

    #[tokio::test]
    async fn test_register_twice_writes_once() {
        let store = Arc::new(MemoryCoordinator::new());
        let registry = CoordinatedServiceRegistry::with_client(store.clone());
        let endpoint = Endpoint::new("10.0.0.5", 9000);

        registry.register_service(&greeter(), &endpoint).await.unwrap();
        registry.register_service(&greeter(), &endpoint).await.unwrap();

        assert_eq!(store.create_count(), 1);
        assert!(store.exists("/kite-rpc/demo.Greeterv1/10.0.0.5:9000").await.unwrap());
        assert_eq!(
            registry.registered_paths(),
            vec!["/kite-rpc/demo.Greeterv1/10.0.0.5:9000".to_string()]
        );
    }

    #[tokio::test]
    async fn test_existing_node_is_not_rewritten() {
        let store = Arc::new(MemoryCoordinator::new());
        store
            .create_persistent("/kite-rpc/demo.Greeterv1/10.0.0.5:9000")
            .await
            .unwrap();
        let registry = CoordinatedServiceRegistry::with_client(store.clone());

        registry
            .register_service(&greeter(), &Endpoint::new("10.0.0.5", 9000))
            .await
            .unwrap();

        assert_eq!(store.create_count(), 1);
        assert_eq!(registry.registered_paths().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_all_removes_only_matching_endpoint() {
        let store = Arc::new(MemoryCoordinator::new());
        let registry = CoordinatedServiceRegistry::with_client(store.clone());
        let here = Endpoint::new("10.0.0.5", 9000);
        let elsewhere = Endpoint::new("10.0.0.6", 9000);
        let echo = ServiceKey::new("demo.Echo", "", "");

        registry.register_service(&greeter(), &here).await.unwrap();
        registry.register_service(&echo, &here).await.unwrap();
        registry.register_service(&greeter(), &elsewhere).await.unwrap();

        registry.clear_all(&here).await;

        assert!(!store.exists("/kite-rpc/demo.Greeterv1/10.0.0.5:9000").await.unwrap());
        assert!(!store.exists("/kite-rpc/demo.Echo/10.0.0.5:9000").await.unwrap());
        assert!(store.exists("/kite-rpc/demo.Greeterv1/10.0.0.6:9000").await.unwrap());
        assert_eq!(
            registry.registered_paths(),
            vec!["/kite-rpc/demo.Greeterv1/10.0.0.6:9000".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unreachable_store_skips_registration() {
        let mut client = MockCoordinationClient::new();
        client
            .expect_exists()
            .times(2)
            .returning(|_| Err(Error::Coordination("connection refused".to_string())));
        client.expect_create_persistent().never();
        let registry = CoordinatedServiceRegistry::with_client(Arc::new(client));
        let endpoint = Endpoint::new("10.0.0.5", 9000);

        registry.register_service(&greeter(), &endpoint).await.unwrap();
        assert!(registry.registered_paths().is_empty());

        // Not remembered, so the next registration asks the store again
        registry.register_service(&greeter(), &endpoint).await.unwrap();
        assert!(registry.registered_paths().is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_is_not_recorded() {
        let mut client = MockCoordinationClient::new();
        client.expect_exists().returning(|_| Ok(false));
        client
            .expect_create_persistent()
            .with(eq("/kite-rpc/demo.Greeterv1/10.0.0.5:9000"))
            .times(1)
            .returning(|_| Err(Error::Coordination("read only replica".to_string())));
        let registry = CoordinatedServiceRegistry::with_client(Arc::new(client));

        registry
            .register_service(&greeter(), &Endpoint::new("10.0.0.5", 9000))
            .await
            .unwrap();

        assert!(registry.registered_paths().is_empty());
    }

    #[tokio::test]
    async fn test_clear_all_keeps_paths_whose_delete_failed() {
        let mut client = MockCoordinationClient::new();
        client.expect_exists().returning(|_| Ok(false));
        client.expect_create_persistent().returning(|_| Ok(true));
        client
            .expect_delete()
            .with(eq("/kite-rpc/demo.Greeterv1/10.0.0.5:9000"))
            .times(1)
            .returning(|_| Err(Error::Coordination("connection reset".to_string())));
        client
            .expect_delete()
            .with(eq("/kite-rpc/demo.Echo/10.0.0.5:9000"))
            .times(1)
            .returning(|_| Ok(true));
        let registry = CoordinatedServiceRegistry::with_client(Arc::new(client));
        let here = Endpoint::new("10.0.0.5", 9000);

        registry.register_service(&greeter(), &here).await.unwrap();
        registry
            .register_service(&ServiceKey::new("demo.Echo", "", ""), &here)
            .await
            .unwrap();
        registry.clear_all(&here).await;

        assert_eq!(
            registry.registered_paths(),
            vec!["/kite-rpc/demo.Greeterv1/10.0.0.5:9000".to_string()]
        );
    }
}
