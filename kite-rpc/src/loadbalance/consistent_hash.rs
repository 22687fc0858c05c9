//! MD5 consistent hashing with virtual nodes
//!
//! Each endpoint contributes `replica_count` points on a `u32` ring: one MD5
//! digest of `"<host:port><round>"` per round yields four little-endian
//! `u32` values. A call is routed by hashing its service key followed by the
//! JSON text of its parameters and walking clockwise to the next point.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use kite_core::{Endpoint, RpcRequest};
use tracing::debug;

use super::LoadBalance;
use crate::registry::EndpointList;

/// Virtual nodes per endpoint
pub const DEFAULT_REPLICA_COUNT: usize = 160;

/// `index`-th little-endian `u32` of a digest; `index` is 0..4
fn hash(digest: &[u8; 16], index: usize) -> u32 {
    let offset = index * 4;
    u32::from_le_bytes([
        digest[offset],
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ])
}

struct HashRing {
    /// Candidate list the ring was built from, kept alive so its address
    /// cannot be reused by a later list
    source: EndpointList,
    ring: BTreeMap<u32, Endpoint>,
}

impl HashRing {
    fn build(source: &EndpointList, replica_count: usize) -> Self {
        let mut ring = BTreeMap::new();
        for endpoint in source.iter() {
            for round in 0..replica_count / 4 {
                let digest = md5::compute(format!("{endpoint}{round}"));
                for index in 0..4 {
                    ring.insert(hash(&digest.0, index), endpoint.clone());
                }
            }
        }
        Self {
            source: source.clone(),
            ring,
        }
    }

    fn built_from(&self, candidates: &EndpointList) -> bool {
        Arc::ptr_eq(&self.source, candidates)
    }

    fn locate(&self, hash: u32) -> Option<&Endpoint> {
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, endpoint)| endpoint)
    }
}

/// Routes identical calls to the same endpoint while membership is stable.
///
/// One ring is kept per service. It is rebuilt when a different candidate
/// list instance is offered, even with equal contents; discovery replaces
/// the list on every membership change.
pub struct ConsistentHashLoadBalance {
    replica_count: usize,
    rings: DashMap<String, Arc<HashRing>>,
    rebuilds: AtomicU64,
}

impl ConsistentHashLoadBalance {
    pub const TYPE_NAME: &'static str = "kite_rpc::loadbalance::ConsistentHashLoadBalance";

    #[must_use]
    pub fn new(replica_count: usize) -> Self {
        Self {
            replica_count: replica_count.max(4),
            rings: DashMap::new(),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Number of rings built so far
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    fn ring_for(&self, service: &str, candidates: &EndpointList) -> Arc<HashRing> {
        // Clone out before inserting so no shard guard is held
        let cached = self.rings.get(service).map(|ring| ring.value().clone());
        if let Some(ring) = cached.filter(|ring| ring.built_from(candidates)) {
            return ring;
        }

        let ring = Arc::new(HashRing::build(candidates, self.replica_count));
        self.rings.insert(service.to_string(), ring.clone());
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        debug!(
            service,
            endpoints = candidates.len(),
            points = ring.ring.len(),
            "Rebuilt consistent hash ring"
        );
        ring
    }
}

impl Default for ConsistentHashLoadBalance {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICA_COUNT)
    }
}

impl LoadBalance for ConsistentHashLoadBalance {
    fn do_select(&self, candidates: &EndpointList, request: &RpcRequest) -> Option<Endpoint> {
        let service = request.service_key().to_string();
        let ring = self.ring_for(&service, candidates);

        let params = serde_json::to_string(&request.parameters).unwrap_or_default();
        let digest = md5::compute(format!("{service}{params}"));
        ring.locate(hash(&digest.0, 0)).cloned()
    }
}
