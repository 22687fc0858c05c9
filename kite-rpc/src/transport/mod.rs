//! Request transports
//!
//! The invocation proxy hands each request to an [`RpcRequestTransport`],
//! which either answers at once or returns a future completed later by the
//! connection that receives the response.

pub mod codec;
pub mod handler;
pub mod pending;
pub mod server;
pub mod tcp_client;

use async_trait::async_trait;
use futures::future::BoxFuture;
use kite_core::{ExtensionPoint, Result, RpcRequest, RpcResponse};

pub use self::handler::RequestHandler;
pub use self::pending::{ConnectionId, PendingRequests};
pub use self::server::RpcServer;
pub use self::tcp_client::TcpClientTransport;

/// Outcome of handing a request to a transport
pub enum Dispatch {
    /// The response (or its absence) is already known
    Ready(Option<RpcResponse>),
    /// The response arrives later
    Pending(BoxFuture<'static, Result<Option<RpcResponse>>>),
}

impl Dispatch {
    /// Wait for the final response
    pub async fn resolve(self) -> Result<Option<RpcResponse>> {
        match self {
            Self::Ready(response) => Ok(response),
            Self::Pending(future) => future.await,
        }
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(response) => f.debug_tuple("Ready").field(response).finish(),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// Sends a request to whichever endpoint should serve it
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcRequestTransport: Send + Sync {
    async fn send(&self, request: RpcRequest) -> Result<Dispatch>;
}

impl ExtensionPoint for dyn RpcRequestTransport {
    const NAME: &'static str = "kite.rpc.RpcRequestTransport";
}
