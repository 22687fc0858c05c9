//! Kite RPC runtime: service registration and discovery over a coordination
//! store, endpoint load balancing, transports and the client invocation proxy.

pub mod coordination;
pub mod extension;
pub mod loadbalance;
pub mod provider;
pub mod proxy;
pub mod registry;
pub mod transport;

pub use kite_core::{Endpoint, Error, Result, RpcRequest, RpcResponse, ServiceKey};
pub use loadbalance::LoadBalance;
pub use provider::{RpcService, ServiceConfig, ServiceProvider};
pub use proxy::{MethodDescriptor, RpcClientProxy, ServiceOptions};
pub use registry::{ServiceDiscovery, ServiceRegistry};
pub use transport::{Dispatch, RpcRequestTransport, RpcServer, TcpClientTransport};

#[doc(hidden)]
pub mod __private {
    pub use kite_core::Result;
    pub use serde_json;
}
