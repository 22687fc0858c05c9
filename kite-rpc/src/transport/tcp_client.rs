//! Multiplexed TCP client transport
//!
//! One connection per endpoint carries any number of concurrent requests.
//! Responses are matched to callers by request id through
//! [`PendingRequests`]; losing a connection fails the calls still waiting on it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use kite_core::resilience::timeout::TRANSPORT_CONNECT_TIMEOUT;
use kite_core::{Endpoint, Error, Result, RpcRequest, RpcResponse};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::pending::{ConnectionId, PendingRequests};
use super::{codec, Dispatch, RpcRequestTransport};
use crate::registry::ServiceDiscovery;

/// Frames queued per connection before senders wait
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Outbound queue of one live connection
#[derive(Clone)]
struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Bytes>,
}

type ConnectionCell = Arc<OnceCell<ConnectionHandle>>;

pub struct TcpClientTransport {
    discovery: once_cell::sync::OnceCell<Arc<dyn ServiceDiscovery>>,
    connections: Arc<DashMap<Endpoint, ConnectionCell>>,
    pending: Arc<PendingRequests>,
    connect_timeout: Duration,
}

impl TcpClientTransport {
    pub const TYPE_NAME: &'static str = "kite_rpc::transport::TcpClientTransport";

    /// Transport resolving endpoints through the configured discovery
    #[must_use]
    pub fn new() -> Self {
        let connect_secs = kite_core::config::global().client.connect_timeout_secs;
        Self {
            discovery: once_cell::sync::OnceCell::new(),
            connections: Arc::new(DashMap::new()),
            pending: Arc::new(PendingRequests::new()),
            connect_timeout: if connect_secs > 0 {
                Duration::from_secs(connect_secs)
            } else {
                TRANSPORT_CONNECT_TIMEOUT
            },
        }
    }

    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn ServiceDiscovery>) -> Self {
        self.discovery = once_cell::sync::OnceCell::with_value(discovery);
        self
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Requests still waiting for a response
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn discovery(&self) -> Result<&Arc<dyn ServiceDiscovery>> {
        self.discovery.get_or_try_init(|| {
            let name = &kite_core::config::global().extension.discovery;
            crate::extension::global().get::<dyn ServiceDiscovery>(name)
        })
    }

    /// Live connection to `endpoint`, connecting if needed
    async fn connection(&self, endpoint: &Endpoint) -> Result<ConnectionHandle> {
        for _ in 0..2 {
            let cell = self.connections.entry(endpoint.clone()).or_default().clone();
            let handle = cell
                .get_or_try_init(|| self.connect(endpoint, cell.clone()))
                .await?;
            if !handle.outbound.is_closed() {
                return Ok(handle.clone());
            }
            // Closed between lookup and use; drop it and dial again
            self.connections
                .remove_if(endpoint, |_, current| Arc::ptr_eq(current, &cell));
        }
        Err(Error::Transport(format!("Connection to {endpoint} keeps closing")))
    }

    async fn connect(&self, endpoint: &Endpoint, cell: ConnectionCell) -> Result<ConnectionHandle> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await
        .map_err(|_| Error::Timeout(format!("Connecting to {endpoint} timed out")))??;
        stream.set_nodelay(true)?;
        let id = ConnectionId::next();
        info!(endpoint = %endpoint, connection = ?id, "Connected to provider");

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        tokio::spawn(run_connection(Connection {
            id,
            stream,
            outbound: rx,
            endpoint: endpoint.clone(),
            pending: self.pending.clone(),
            connections: Arc::downgrade(&self.connections),
            cell: Arc::downgrade(&cell),
        }));
        Ok(ConnectionHandle { id, outbound: tx })
    }
}

impl Default for TcpClientTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcRequestTransport for TcpClientTransport {
    async fn send(&self, request: RpcRequest) -> Result<Dispatch> {
        let endpoint = self.discovery()?.lookup_service(&request).await?;
        let connection = self.connection(&endpoint).await?;

        let frame = codec::encode(&request)?;
        let (response, guard) = self
            .pending
            .register(request.request_id.clone(), connection.id);
        connection
            .outbound
            .send(frame)
            .await
            .map_err(|_| Error::Transport(format!("Connection to {endpoint} closed")))?;
        debug!(request_id = %request.request_id, endpoint = %endpoint, "Request sent");

        Ok(Dispatch::Pending(Box::pin(async move {
            let _guard = guard;
            match response.await {
                Ok(result) => result.map(Some),
                Err(_) => Err(Error::Transport(format!(
                    "Connection to {endpoint} dropped the request"
                ))),
            }
        })))
    }
}

struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    outbound: mpsc::Receiver<Bytes>,
    endpoint: Endpoint,
    pending: Arc<PendingRequests>,
    /// Weak so dropping the transport closes its connections
    connections: Weak<DashMap<Endpoint, ConnectionCell>>,
    cell: Weak<OnceCell<ConnectionHandle>>,
}

/// Pump outbound frames and inbound responses until either side ends
async fn run_connection(connection: Connection) {
    let Connection {
        id,
        stream,
        mut outbound,
        endpoint,
        pending,
        connections,
        cell,
    } = connection;
    let (mut sink, mut frames) = Framed::new(stream, codec::frame_codec()).split();

    let writer = async {
        while let Some(frame) = outbound.recv().await {
            sink.send(frame).await?;
        }
        Ok::<_, std::io::Error>(())
    };

    let reader = async {
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            match codec::decode::<RpcResponse>(&frame) {
                Ok(response) => {
                    pending.complete(response);
                }
                Err(e) => warn!(endpoint = %endpoint, error = %e, "Undecodable response frame"),
            }
        }
        Ok::<_, std::io::Error>(())
    };

    let reason = tokio::select! {
        result = writer => match result {
            Ok(()) => "client closed".to_string(),
            Err(e) => format!("write failed: {e}"),
        },
        result = reader => match result {
            Ok(()) => "connection closed by peer".to_string(),
            Err(e) => format!("read failed: {e}"),
        },
    };

    info!(endpoint = %endpoint, connection = ?id, reason = %reason, "Provider connection ended");
    // Close before failing so no request can still be queued on this connection
    outbound.close();
    if let Some(connections) = connections.upgrade() {
        connections.remove_if(&endpoint, |_, current| {
            std::ptr::eq(Arc::as_ptr(current), cell.as_ptr())
        });
    }
    pending.fail_connection(id, &endpoint, &reason);
}
