//! In-flight requests awaiting a response

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use kite_core::{Endpoint, Error, RequestId, Result, RpcResponse};
use tokio::sync::oneshot;
use tracing::{debug, warn};

type ResponseSender = oneshot::Sender<Result<RpcResponse>>;

/// Identity of one physical connection; a reconnect to the same endpoint gets a new one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Request id to completion channel, shared by all connections of a client
#[derive(Default)]
pub struct PendingRequests {
    inner: DashMap<RequestId, (ConnectionId, ResponseSender)>,
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request written to `connection`.
    ///
    /// The entry is removed when the returned guard is dropped, so abandoned
    /// calls do not leak.
    pub fn register(
        self: &Arc<Self>,
        request_id: RequestId,
        connection: ConnectionId,
    ) -> (oneshot::Receiver<Result<RpcResponse>>, PendingGuard) {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(request_id.clone(), (connection, tx));
        let guard = PendingGuard {
            pending: self.clone(),
            request_id,
        };
        (rx, guard)
    }

    /// Deliver a response to its waiting caller; `false` if nobody waits for it
    pub fn complete(&self, response: RpcResponse) -> bool {
        match self.inner.remove(&response.request_id) {
            Some((_, (_, tx))) => tx.send(Ok(response)).is_ok(),
            None => {
                debug!(request_id = %response.request_id, "Dropping response without a pending request");
                false
            }
        }
    }

    /// Fail every request in flight on `connection` to `endpoint`; returns how many
    pub fn fail_connection(&self, connection: ConnectionId, endpoint: &Endpoint, reason: &str) -> usize {
        let ids: Vec<RequestId> = self
            .inner
            .iter()
            .filter(|entry| entry.value().0 == connection)
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, (_, tx))) = self.inner.remove(&id) {
                let _ = tx.send(Err(Error::Transport(format!("{endpoint}: {reason}"))));
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(endpoint = %endpoint, failed, reason, "Failed in-flight requests");
        }
        failed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Removes its request from [`PendingRequests`] when dropped
pub struct PendingGuard {
    pending: Arc<PendingRequests>,
    request_id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.inner.remove(&self.request_id);
    }
}
