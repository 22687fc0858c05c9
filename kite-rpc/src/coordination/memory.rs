//! In-process coordination store

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use kite_core::Result;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::{path, CoordinationClient, WatchEvent, WATCH_CHANNEL_CAPACITY};

/// Coordination tree held in memory.
///
/// Every node is recorded as a child name in its parent's set. Counters for
/// create calls and children reads let tests observe coordination traffic.
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    tree: RwLock<BTreeMap<String, BTreeSet<String>>>,
    watchers: DashMap<String, broadcast::Sender<WatchEvent>>,
    creates: AtomicUsize,
    children_reads: AtomicUsize,
}

impl MemoryCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `create_persistent` calls served
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of `children` calls served
    pub fn children_read_count(&self) -> usize {
        self.children_reads.load(Ordering::SeqCst)
    }

    fn notify(&self, parent: &str, event: WatchEvent) {
        if let Some(sender) = self.watchers.get(parent) {
            // No receivers left is not an error
            let _ = sender.send(event);
        }
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn create_persistent(&self, node: &str) -> Result<bool> {
        path::validate(node)?;
        self.creates.fetch_add(1, Ordering::SeqCst);

        let target = node.trim_end_matches('/');
        let mut added = Vec::new();
        let mut created = false;
        {
            let mut tree = self.tree.write();
            for segment in path::lineage(node) {
                let parent = path::parent(segment).unwrap_or("/");
                let name = path::name(segment);
                if tree.entry(parent.to_string()).or_default().insert(name.to_string()) {
                    created = segment == target;
                    added.push((parent.to_string(), name.to_string()));
                }
            }
        }

        for (parent, name) in added {
            self.notify(&parent, WatchEvent::ChildAdded(name));
        }
        Ok(created)
    }

    async fn exists(&self, node: &str) -> Result<bool> {
        path::validate(node)?;
        let parent = path::parent(node).unwrap_or("/");
        Ok(self
            .tree
            .read()
            .get(parent)
            .is_some_and(|children| children.contains(path::name(node))))
    }

    async fn children(&self, node: &str) -> Result<Vec<String>> {
        path::validate(node)?;
        self.children_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tree
            .read()
            .get(node.trim_end_matches('/'))
            .map(|children| children.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, node: &str) -> Result<bool> {
        path::validate(node)?;
        let parent = path::parent(node).unwrap_or("/");
        let name = path::name(node);
        let removed = {
            let mut tree = self.tree.write();
            let removed = tree
                .get_mut(parent)
                .is_some_and(|children| children.remove(name));
            if removed {
                tree.remove(node.trim_end_matches('/'));
            }
            removed
        };
        if removed {
            self.notify(parent, WatchEvent::ChildRemoved(name.to_string()));
        }
        Ok(removed)
    }

    async fn watch_children(&self, node: &str) -> Result<broadcast::Receiver<WatchEvent>> {
        path::validate(node)?;
        let receiver = self
            .watchers
            .entry(node.trim_end_matches('/').to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(receiver)
    }
}
