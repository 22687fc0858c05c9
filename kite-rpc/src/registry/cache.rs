use std::sync::Arc;

use dashmap::DashMap;
use kite_core::{Endpoint, ServiceKey};

/// Candidate endpoints of one service.
///
/// Lists are never edited in place: every update stores a new `Arc`, so
/// pointer identity changes exactly when the list is replaced.
pub type EndpointList = Arc<Vec<Endpoint>>;

/// Most recently observed endpoints per service.
///
/// Entries never expire; the discovery watch worker replaces them wholesale.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    entries: DashMap<ServiceKey, EndpointList>,
}

impl DiscoveryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ServiceKey) -> Option<EndpointList> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store `endpoints` unless an entry exists; returns the stored list
    pub(crate) fn get_or_insert(&self, key: &ServiceKey, endpoints: EndpointList) -> EndpointList {
        self.entries
            .entry(key.clone())
            .or_insert(endpoints)
            .value()
            .clone()
    }

    /// Swap the entry for `key` in one step
    pub(crate) fn replace(&self, key: &ServiceKey, endpoints: EndpointList) {
        self.entries.insert(key.clone(), endpoints);
    }

    pub(crate) fn remove(&self, key: &ServiceKey) {
        self.entries.remove(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
