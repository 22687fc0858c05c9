//! Endpoint selection strategies

pub mod consistent_hash;
pub mod random;
pub mod round_robin;

use kite_core::{Endpoint, ExtensionPoint, RpcRequest};

use crate::registry::EndpointList;

pub use self::consistent_hash::ConsistentHashLoadBalance;
pub use self::random::RandomLoadBalance;
pub use self::round_robin::RoundRobinLoadBalance;

/// Picks one endpoint out of the candidates for a request
pub trait LoadBalance: Send + Sync {
    /// `None` for no candidates; a single candidate is returned without
    /// consulting the strategy.
    fn select(&self, candidates: &EndpointList, request: &RpcRequest) -> Option<Endpoint> {
        match candidates.len() {
            0 => None,
            1 => candidates.first().cloned(),
            _ => self.do_select(candidates, request),
        }
    }

    /// Strategy proper, called with at least two candidates
    fn do_select(&self, candidates: &EndpointList, request: &RpcRequest) -> Option<Endpoint>;
}

impl ExtensionPoint for dyn LoadBalance {
    const NAME: &'static str = "kite.rpc.LoadBalance";
}
