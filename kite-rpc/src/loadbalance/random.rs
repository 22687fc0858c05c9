use rand::seq::IndexedRandom;

use kite_core::{Endpoint, RpcRequest};

use super::LoadBalance;
use crate::registry::EndpointList;

/// Uniformly random choice
#[derive(Debug, Default)]
pub struct RandomLoadBalance;

impl RandomLoadBalance {
    pub const TYPE_NAME: &'static str = "kite_rpc::loadbalance::RandomLoadBalance";
}

impl LoadBalance for RandomLoadBalance {
    fn do_select(&self, candidates: &EndpointList, _request: &RpcRequest) -> Option<Endpoint> {
        candidates.as_slice().choose(&mut rand::rng()).cloned()
    }
}
