//! TCP listener serving published services

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use kite_core::config::ServerConfig;
use kite_core::{Result, RpcRequest};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec;
use super::handler::RequestHandler;
use crate::provider::{ServiceConfig, ServiceProvider};
use crate::registry::ServiceRegistry;

/// Responses queued per connection before handlers wait
const RESPONSE_QUEUE_SIZE: usize = 256;

/// Accepts client connections and answers their requests from the local
/// routing table. Requests on one connection are handled concurrently.
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    provider: Arc<ServiceProvider>,
    handler: Arc<RequestHandler>,
    cancel_token: CancellationToken,
}

impl RpcServer {
    /// Bind the listener; the bound port is the one advertised to the registry
    pub async fn bind(config: &ServerConfig, registry: Arc<dyn ServiceRegistry>) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;

        let mut provider = ServiceProvider::new(registry, local_addr.port());
        if let Some(host) = &config.host {
            provider = provider.with_host(host.clone());
        }
        let provider = Arc::new(provider);

        info!(address = %local_addr, "RPC server bound");
        Ok(Self {
            listener,
            local_addr,
            handler: Arc::new(RequestHandler::new(provider.clone())),
            provider,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Bind using the global configuration and the configured registry extension
    pub async fn from_global_config() -> Result<Self> {
        let config = kite_core::config::global();
        let registry = crate::extension::global()
            .get::<dyn ServiceRegistry>(&config.extension.registry)?;
        Self::bind(&config.server, registry).await
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn provider(&self) -> Arc<ServiceProvider> {
        self.provider.clone()
    }

    /// Publish a service served by this listener
    pub async fn register_service(&self, config: ServiceConfig) -> Result<()> {
        self.provider.publish_service(config).await
    }

    /// Get the cancellation token for external shutdown signaling
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutting down RPC server");
        self.cancel_token.cancel();
    }

    /// Accept connections until cancelled, then remove this server's
    /// registrations.
    pub async fn start(self) -> Result<()> {
        info!(address = %self.local_addr, "RPC server accepting connections");

        loop {
            let accepted = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        self.handler.clone(),
                        self.cancel_token.child_token(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        self.provider.unpublish_all().await;
        info!("RPC server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<RequestHandler>,
    cancel: CancellationToken,
) {
    let (mut sink, mut frames) = Framed::new(stream, codec::frame_codec()).split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(RESPONSE_QUEUE_SIZE);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                warn!(peer = %peer, error = %e, "Failed to write response");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "Connection read failed");
                break;
            }
            None => break,
        };

        let request: RpcRequest = match codec::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                // Without a request id there is nobody to answer
                warn!(peer = %peer, error = %e, "Dropping undecodable request frame");
                continue;
            }
        };

        let handler = handler.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = handler.handle(request).await;
            match codec::encode(&response) {
                Ok(frame) => {
                    let _ = tx.send(frame).await;
                }
                Err(e) => warn!(error = %e, "Failed to encode response"),
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    debug!(peer = %peer, "Connection closed");
}
