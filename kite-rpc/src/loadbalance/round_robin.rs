use std::sync::atomic::{AtomicUsize, Ordering};

use kite_core::{Endpoint, RpcRequest};

use super::LoadBalance;
use crate::registry::EndpointList;

/// Cycles through candidates in sorted order with a shared cursor
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalance {
    index: AtomicUsize,
}

impl RoundRobinLoadBalance {
    pub const TYPE_NAME: &'static str = "kite_rpc::loadbalance::RoundRobinLoadBalance";
}

impl LoadBalance for RoundRobinLoadBalance {
    fn do_select(&self, candidates: &EndpointList, _request: &RpcRequest) -> Option<Endpoint> {
        // Sort for stable ordering across list replacements
        let mut sorted: Vec<&Endpoint> = candidates.iter().collect();
        sorted.sort();
        if sorted.is_empty() {
            return None;
        }
        let index = self.index.fetch_add(1, Ordering::AcqRel) % sorted.len();
        sorted.get(index).map(|endpoint| (*endpoint).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_cycles_in_sorted_order() {
        let balancer = RoundRobinLoadBalance::default();
        let candidates = Arc::new(vec![
            Endpoint::new("10.0.0.7", 9000),
            Endpoint::new("10.0.0.5", 9000),
            Endpoint::new("10.0.0.6", 9000),
        ]);
        let request = RpcRequest::new("demo.Greeter", "hello");

        let hosts: Vec<String> = (0..4)
            .map(|_| balancer.select(&candidates, &request).unwrap().host().to_string())
            .collect();

        assert_eq!(hosts, vec!["10.0.0.5", "10.0.0.6", "10.0.0.7", "10.0.0.5"]);
    }
}
