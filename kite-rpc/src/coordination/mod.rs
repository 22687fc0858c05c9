//! Coordination service adapter
//!
//! A minimal hierarchical store: persistent node creation, existence check,
//! children listing, delete and children watches. Two backends ship:
//! [`RedisCoordinator`] for multi-process deployments and
//! [`MemoryCoordinator`] for single-process mode and tests.

pub mod memory;
pub mod path;
pub mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kite_core::config::{CoordinationBackend, CoordinationConfig};
use kite_core::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OnceCell};
use tracing::info;

pub use self::memory::MemoryCoordinator;
pub use self::path::ROOT_PATH;
pub use self::redis_store::RedisCoordinator;

/// Buffered watch notifications per watched path
pub const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Change under a watched parent path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "child", rename_all = "snake_case")]
pub enum WatchEvent {
    ChildAdded(String),
    ChildRemoved(String),
    /// Notifications may have been missed; re-read the children
    Resync,
}

/// Operations the registry and discovery layers need from the store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create `path` and any missing parents; `false` if it already existed
    async fn create_persistent(&self, path: &str) -> Result<bool>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Child names (not full paths) of `path`; empty if it has none
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Remove `path`; `false` if it did not exist
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Subscribe to child changes of `path`.
    ///
    /// The subscription is active when this returns, so a children read made
    /// afterwards cannot miss a change.
    async fn watch_children(&self, path: &str) -> Result<broadcast::Receiver<WatchEvent>>;
}

static SHARED: OnceCell<Arc<dyn CoordinationClient>> = OnceCell::const_new();

/// Process-wide client built from the global configuration on first use.
///
/// Concurrent first callers share one connection attempt. A failed attempt
/// is not cached.
pub async fn shared_client() -> Result<Arc<dyn CoordinationClient>> {
    SHARED
        .get_or_try_init(|| connect(&kite_core::config::global().coordination))
        .await
        .cloned()
}

/// Build a client for the configured backend
pub async fn connect(config: &CoordinationConfig) -> Result<Arc<dyn CoordinationClient>> {
    match config.backend {
        CoordinationBackend::Memory => {
            info!("Using in-process coordination store");
            Ok(Arc::new(MemoryCoordinator::new()))
        }
        CoordinationBackend::Redis => {
            let client = RedisCoordinator::connect(
                &config.redis_url(),
                Duration::from_secs(config.connect_timeout_secs),
                Duration::from_millis(config.base_sleep_ms),
                config.max_retries,
            )
            .await?;
            Ok(Arc::new(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_event_wire_format() {
        let event = WatchEvent::ChildAdded("10.0.0.5:9000".to_string());
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"child_added","child":"10.0.0.5:9000"}"#);

        let parsed: WatchEvent = serde_json::from_str(r#"{"type":"resync"}"#).unwrap();
        assert_eq!(parsed, WatchEvent::Resync);
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let config = CoordinationConfig {
            backend: CoordinationBackend::Memory,
            ..CoordinationConfig::default()
        };
        let client = connect(&config).await.unwrap();

        assert!(client.create_persistent("/kite-rpc/a/b").await.unwrap());
        assert!(client.exists("/kite-rpc/a").await.unwrap());
    }
}
