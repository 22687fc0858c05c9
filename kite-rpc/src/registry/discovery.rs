use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use kite_core::{Endpoint, Error, Result, RpcRequest, ServiceKey};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{DiscoveryCache, EndpointList};
use super::ServiceDiscovery;
use crate::coordination::{self, path, CoordinationClient, WatchEvent};
use crate::loadbalance::LoadBalance;

/// Discovery reading endpoints from the coordination store.
///
/// The first lookup of a service reads its children, caches them and starts
/// a watch worker. From then on the worker is the only writer of that cache
/// entry; lookups are served from memory.
pub struct CoordinatedServiceDiscovery {
    client: OnceCell<Arc<dyn CoordinationClient>>,
    load_balance: once_cell::sync::OnceCell<Arc<dyn LoadBalance>>,
    cache: Arc<DiscoveryCache>,
    watched: Arc<DashMap<ServiceKey, Subscription>>,
    cancel_token: CancellationToken,
}

/// Set once a watch worker is live for a service
type Subscription = Arc<OnceCell<()>>;

impl CoordinatedServiceDiscovery {
    pub const TYPE_NAME: &'static str = "kite_rpc::registry::CoordinatedServiceDiscovery";

    /// Discovery using the process-wide coordination client and the
    /// configured load balancer
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: OnceCell::new(),
            load_balance: once_cell::sync::OnceCell::new(),
            cache: Arc::new(DiscoveryCache::new()),
            watched: Arc::new(DashMap::new()),
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn CoordinationClient>) -> Self {
        self.client = OnceCell::new_with(Some(client));
        self
    }

    #[must_use]
    pub fn with_load_balance(mut self, load_balance: Arc<dyn LoadBalance>) -> Self {
        self.load_balance = once_cell::sync::OnceCell::with_value(load_balance);
        self
    }

    #[must_use]
    pub fn cache(&self) -> &DiscoveryCache {
        &self.cache
    }

    /// Stop every watch worker. Cached entries stay but are no longer refreshed.
    pub fn shutdown(&self) {
        info!(services = self.watched.len(), "Stopping discovery watch workers");
        self.cancel_token.cancel();
    }

    async fn client(&self) -> Result<Arc<dyn CoordinationClient>> {
        self.client
            .get_or_try_init(coordination::shared_client)
            .await
            .cloned()
    }

    fn load_balance(&self) -> Result<&Arc<dyn LoadBalance>> {
        self.load_balance.get_or_try_init(|| {
            let name = &kite_core::config::global().extension.load_balance;
            crate::extension::global().get::<dyn LoadBalance>(name)
        })
    }

    /// Candidates for `key`, from the cache or the store
    async fn endpoints(&self, key: &ServiceKey) -> Result<EndpointList> {
        if let Some(endpoints) = self.cache.get(key) {
            return Ok(endpoints);
        }

        let client = self.client().await?;
        let service_path = path::service_path(key);

        // Subscribe before reading so no change between the two is lost.
        // Concurrent lookups share one subscription attempt; a failed
        // attempt leaves the cell empty for the next lookup.
        let subscription = self.watched.entry(key.clone()).or_default().clone();
        let watching = subscription
            .get_or_try_init(|| self.start_watch(client.clone(), key, &service_path, &subscription))
            .await;
        if let Err(e) = watching {
            warn!(service = %key, error = %e, "Failed to watch service, endpoints will not be cached");
            let endpoints = read_endpoints(client.as_ref(), &service_path)
                .await
                .unwrap_or_else(|e| {
                    warn!(service = %key, error = %e, "Failed to read service endpoints");
                    Vec::new()
                });
            return Ok(Arc::new(endpoints));
        }

        match read_endpoints(client.as_ref(), &service_path).await {
            Ok(endpoints) => Ok(self.cache.get_or_insert(key, Arc::new(endpoints))),
            Err(e) => {
                warn!(service = %key, error = %e, "Failed to read service endpoints");
                Ok(Arc::new(Vec::new()))
            }
        }
    }

    /// Subscribe to `service_path` and hand the subscription to a new worker
    async fn start_watch(
        &self,
        client: Arc<dyn CoordinationClient>,
        key: &ServiceKey,
        service_path: &str,
        subscription: &Subscription,
    ) -> Result<()> {
        let events = client.watch_children(service_path).await?;
        tokio::spawn(watch_worker(WatchWorker {
            client,
            key: key.clone(),
            service_path: service_path.to_string(),
            cache: self.cache.clone(),
            watched: self.watched.clone(),
            subscription: Arc::downgrade(subscription),
            cancel: self.cancel_token.clone(),
            events,
        }));
        Ok(())
    }
}

impl Default for CoordinatedServiceDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CoordinatedServiceDiscovery {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl ServiceDiscovery for CoordinatedServiceDiscovery {
    async fn lookup_service(&self, request: &RpcRequest) -> Result<Endpoint> {
        let key = request.service_key();
        let endpoints = self.endpoints(&key).await?;
        if endpoints.is_empty() {
            return Err(Error::ServiceNotFound(key.to_string()));
        }

        let endpoint = self
            .load_balance()?
            .select(&endpoints, request)
            .ok_or_else(|| Error::ServiceNotFound(key.to_string()))?;
        debug!(service = %key, endpoint = %endpoint, "Resolved service endpoint");
        Ok(endpoint)
    }
}

/// Children of `service_path` that parse as `host:port`
async fn read_endpoints(client: &dyn CoordinationClient, service_path: &str) -> Result<Vec<Endpoint>> {
    let children = client.children(service_path).await?;
    Ok(children
        .into_iter()
        .filter_map(|child| match child.parse::<Endpoint>() {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(path = %service_path, child = %child, error = %e, "Ignoring malformed endpoint node");
                None
            }
        })
        .collect())
}

struct WatchWorker {
    client: Arc<dyn CoordinationClient>,
    key: ServiceKey,
    service_path: String,
    cache: Arc<DiscoveryCache>,
    watched: Arc<DashMap<ServiceKey, Subscription>>,
    subscription: Weak<OnceCell<()>>,
    cancel: CancellationToken,
    events: broadcast::Receiver<WatchEvent>,
}

/// Re-read children on every notification and swap the cache entry
async fn watch_worker(mut worker: WatchWorker) {
    debug!(service = %worker.key, "Discovery watch worker started");

    loop {
        let event = tokio::select! {
            () = worker.cancel.cancelled() => {
                debug!(service = %worker.key, "Discovery watch worker cancelled");
                return;
            }
            event = worker.events.recv() => event,
        };

        match event {
            Ok(event) => debug!(service = %worker.key, ?event, "Service membership changed"),
            Err(RecvError::Lagged(missed)) => {
                warn!(service = %worker.key, missed, "Discovery watch lagged, refreshing");
            }
            Err(RecvError::Closed) => {
                // Nothing refreshes this entry any more; the next lookup re-resolves
                warn!(service = %worker.key, "Discovery watch closed");
                worker.watched.remove_if(&worker.key, |_, current| {
                    std::ptr::eq(Arc::as_ptr(current), worker.subscription.as_ptr())
                });
                worker.cache.remove(&worker.key);
                return;
            }
        }

        match read_endpoints(worker.client.as_ref(), &worker.service_path).await {
            Ok(endpoints) => {
                info!(service = %worker.key, endpoints = endpoints.len(), "Refreshed service endpoints");
                worker.cache.replace(&worker.key, Arc::new(endpoints));
            }
            Err(e) => {
                warn!(service = %worker.key, error = %e, "Failed to refresh service endpoints, keeping previous");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{MemoryCoordinator, MockCoordinationClient};
    use crate::loadbalance::ConsistentHashLoadBalance;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Memory store whose first `failures` watch attempts fail after `delay`
    struct FailingWatch {
        store: Arc<MemoryCoordinator>,
        failures: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl CoordinationClient for FailingWatch {
        async fn create_persistent(&self, path: &str) -> Result<bool> {
            self.store.create_persistent(path).await
        }

        async fn exists(&self, path: &str) -> Result<bool> {
            self.store.exists(path).await
        }

        async fn children(&self, path: &str) -> Result<Vec<String>> {
            self.store.children(path).await
        }

        async fn delete(&self, path: &str) -> Result<bool> {
            self.store.delete(path).await
        }

        async fn watch_children(&self, path: &str) -> Result<broadcast::Receiver<WatchEvent>> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                tokio::time::sleep(self.delay).await;
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Coordination("watch rejected".to_string()));
            }
            self.store.watch_children(path).await
        }
    }

    fn discovery(store: &Arc<MemoryCoordinator>) -> CoordinatedServiceDiscovery {
        CoordinatedServiceDiscovery::new()
            .with_client(store.clone())
            .with_load_balance(Arc::new(ConsistentHashLoadBalance::default()))
    }

    fn greet(name: &str) -> RpcRequest {
        RpcRequest::new("demo.Greeter", "hello")
            .with_version("v1")
            .with_parameters(vec![serde_json::json!(name)])
    }

    async fn wait_for_endpoints(discovery: &CoordinatedServiceDiscovery, key: &ServiceKey, expected: &[Endpoint]) {
        for _ in 0..100 {
            if discovery.cache().get(key).is_some_and(|list| list.as_slice() == expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cache for {key} never became {expected:?}");
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let store = Arc::new(MemoryCoordinator::new());
        let discovery = discovery(&store);

        let err = discovery.lookup_service(&greet("alice")).await.unwrap_err();
        match err {
            Error::ServiceNotFound(key) => assert_eq!(key, "demo.Greeterv1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_lookup_reads_store_once() {
        let store = Arc::new(MemoryCoordinator::new());
        store.create_persistent("/kite-rpc/demo.Greeterv1/10.0.0.5:9000").await.unwrap();
        let discovery = discovery(&store);

        let first = discovery.lookup_service(&greet("alice")).await.unwrap();
        let second = discovery.lookup_service(&greet("alice")).await.unwrap();

        assert_eq!(first, Endpoint::new("10.0.0.5", 9000));
        assert_eq!(first, second);
        assert_eq!(store.children_read_count(), 1);
    }

    #[tokio::test]
    async fn test_watch_update_refreshes_cache() {
        let store = Arc::new(MemoryCoordinator::new());
        store.create_persistent("/kite-rpc/demo.Greeterv1/10.0.0.5:9000").await.unwrap();
        let discovery = discovery(&store);
        let key = ServiceKey::new("demo.Greeter", "", "v1");

        discovery.lookup_service(&greet("alice")).await.unwrap();
        store.create_persistent("/kite-rpc/demo.Greeterv1/10.0.0.6:9000").await.unwrap();
        store.delete("/kite-rpc/demo.Greeterv1/10.0.0.5:9000").await.unwrap();
        wait_for_endpoints(&discovery, &key, &[Endpoint::new("10.0.0.6", 9000)]).await;
        // Let the second notification's re-read finish
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reads = store.children_read_count();
        let selected = discovery.lookup_service(&greet("alice")).await.unwrap();

        assert_eq!(selected, Endpoint::new("10.0.0.6", 9000));
        assert_eq!(store.children_read_count(), reads);
    }

    #[tokio::test]
    async fn test_endpoints_appearing_later_are_discovered() {
        let store = Arc::new(MemoryCoordinator::new());
        let discovery = discovery(&store);
        let key = ServiceKey::new("demo.Greeter", "", "v1");

        assert!(discovery.lookup_service(&greet("alice")).await.is_err());

        store.create_persistent("/kite-rpc/demo.Greeterv1/10.0.0.5:9000").await.unwrap();
        wait_for_endpoints(&discovery, &key, &[Endpoint::new("10.0.0.5", 9000)]).await;

        assert_eq!(
            discovery.lookup_service(&greet("alice")).await.unwrap(),
            Endpoint::new("10.0.0.5", 9000)
        );
    }

    #[tokio::test]
    async fn test_malformed_children_are_skipped() {
        let store = Arc::new(MemoryCoordinator::new());
        store.create_persistent("/kite-rpc/demo.Greeterv1/not-an-endpoint").await.unwrap();
        store.create_persistent("/kite-rpc/demo.Greeterv1/10.0.0.5:9000").await.unwrap();

        let endpoints = read_endpoints(store.as_ref(), "/kite-rpc/demo.Greeterv1").await.unwrap();
        assert_eq!(endpoints, vec![Endpoint::new("10.0.0.5", 9000)]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_refresh() {
        let store = Arc::new(MemoryCoordinator::new());
        store.create_persistent("/kite-rpc/demo.Greeterv1/10.0.0.5:9000").await.unwrap();
        let discovery = discovery(&store);
        let key = ServiceKey::new("demo.Greeter", "", "v1");

        discovery.lookup_service(&greet("alice")).await.unwrap();
        discovery.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.create_persistent("/kite-rpc/demo.Greeterv1/10.0.0.6:9000").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(discovery.cache().get(&key).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_watch_does_not_leave_unwatched_cache_entry() {
        let store = Arc::new(MemoryCoordinator::new());
        store.create_persistent("/kite-rpc/demo.Greeterv1/10.0.0.5:9000").await.unwrap();
        let client = Arc::new(FailingWatch {
            store: store.clone(),
            failures: AtomicUsize::new(1),
            delay: Duration::from_millis(50),
        });
        let discovery = CoordinatedServiceDiscovery::new()
            .with_client(client)
            .with_load_balance(Arc::new(ConsistentHashLoadBalance::default()));
        let key = ServiceKey::new("demo.Greeter", "", "v1");

        let alice = greet("alice");
        let first = discovery.lookup_service(&alice);
        let second = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            discovery.lookup_service(&greet("bob")).await
        };
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap(), Endpoint::new("10.0.0.5", 9000));
        assert_eq!(second.unwrap(), Endpoint::new("10.0.0.5", 9000));

        store.create_persistent("/kite-rpc/demo.Greeterv1/10.0.0.6:9000").await.unwrap();
        wait_for_endpoints(
            &discovery,
            &key,
            &[Endpoint::new("10.0.0.5", 9000), Endpoint::new("10.0.0.6", 9000)],
        )
        .await;
    }

    #[tokio::test]
    async fn test_failed_children_read_is_not_found_and_not_cached() {
        let (events, _) = broadcast::channel::<WatchEvent>(4);
        let mut client = MockCoordinationClient::new();
        client
            .expect_watch_children()
            .returning(move |_| Ok(events.subscribe()));
        client
            .expect_children()
            .times(2)
            .returning(|_| Err(Error::Coordination("connection lost".to_string())));
        let discovery = CoordinatedServiceDiscovery::new()
            .with_client(Arc::new(client))
            .with_load_balance(Arc::new(ConsistentHashLoadBalance::default()));

        for _ in 0..2 {
            let err = discovery.lookup_service(&greet("alice")).await.unwrap_err();
            assert!(matches!(err, Error::ServiceNotFound(key) if key == "demo.Greeterv1"));
        }
        assert!(discovery.cache().is_empty());
    }
}
