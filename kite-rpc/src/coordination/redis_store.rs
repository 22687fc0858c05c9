//! Redis-backed coordination store
//!
//! Each parent path owns a Redis set of child names under
//! `kite-rpc:children:<path>`. Creations and deletions publish a
//! [`WatchEvent`] on `kite-rpc:watch:<parent path>`.

use std::sync::Arc;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use kite_core::resilience::timeout::COORDINATION_OPERATION_TIMEOUT;
use kite_core::{Error, Result};
use redis::aio::MultiplexedConnection;
use redis::{Client as RedisClient, FromRedisValue};
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{path, CoordinationClient, WatchEvent, WATCH_CHANNEL_CAPACITY};

const CHILDREN_KEY_PREFIX: &str = "kite-rpc:children:";
const WATCH_CHANNEL_PREFIX: &str = "kite-rpc:watch:";

/// Initial backoff delay for watch subscriber reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for watch subscriber reconnection
const MAX_BACKOFF_SECS: u64 = 30;

fn children_key(parent: &str) -> String {
    format!("{CHILDREN_KEY_PREFIX}{parent}")
}

fn watch_channel(parent: &str) -> String {
    format!("{WATCH_CHANNEL_PREFIX}{parent}")
}

/// Coordination store on a shared Redis deployment
pub struct RedisCoordinator {
    client: RedisClient,
    conn: MultiplexedConnection,
    /// One pub/sub forwarder per watched path, shared by all its receivers
    watchers: Arc<DashMap<String, broadcast::Sender<WatchEvent>>>,
    cancel_token: CancellationToken,
}

impl RedisCoordinator {
    /// Connect with exponential backoff, bounded by `connect_timeout`.
    ///
    /// Exceeding `connect_timeout` yields [`Error::Timeout`].
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        base_sleep: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        let client = RedisClient::open(url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL '{url}': {e}")))?;

        let conn = timeout(connect_timeout, Self::connect_with_retry(&client, base_sleep, max_retries))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "Connecting to coordination service at {url} exceeded {}s",
                    connect_timeout.as_secs()
                ))
            })??;

        info!(url = %url, "Connected to coordination service");
        Ok(Self {
            client,
            conn,
            watchers: Arc::new(DashMap::new()),
            cancel_token: CancellationToken::new(),
        })
    }

    async fn connect_with_retry(
        client: &RedisClient,
        base_sleep: Duration,
        max_retries: usize,
    ) -> Result<MultiplexedConnection> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(base_sleep)
            .with_max_times(max_retries)
            .build();

        let mut last_err = None;
        for delay in std::iter::once(Duration::ZERO).chain(backoff) {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            match client.get_multiplexed_async_connection().await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(error = %e, "Coordination service connection attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(Error::Coordination(format!(
            "Failed to connect to coordination service: {}",
            last_err.map_or_else(|| "retries exhausted".to_string(), |e| e.to_string())
        )))
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd, what: &str) -> Result<T> {
        let mut conn = self.conn.clone();
        timeout(COORDINATION_OPERATION_TIMEOUT, cmd.query_async(&mut conn))
            .await
            .map_err(|_| Error::Timeout(format!("Coordination {what} timed out")))?
            .map_err(|e| Error::Coordination(format!("Coordination {what} failed: {e}")))
    }

    async fn publish(&self, parent: &str, event: &WatchEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize watch event");
                return;
            }
        };
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(watch_channel(parent)).arg(payload);
        if let Err(e) = self.query::<i64>(&cmd, "publish").await {
            warn!(parent, error = %e, "Failed to publish watch event");
        }
    }

    /// Forward pub/sub messages of one channel into `sender` until cancelled
    /// or every receiver is gone, reconnecting with backoff.
    fn spawn_forwarder(
        &self,
        node: String,
        mut pubsub: redis::aio::PubSub,
        sender: broadcast::Sender<WatchEvent>,
    ) {
        let client = self.client.clone();
        let watchers = self.watchers.clone();
        let cancel = self.cancel_token.clone();

        tokio::spawn(async move {
            let channel = watch_channel(&node);
            let mut backoff_secs = INITIAL_BACKOFF_SECS;

            loop {
                {
                    let mut stream = pubsub.on_message();
                    loop {
                        let msg = tokio::select! {
                            () = cancel.cancelled() => {
                                debug!(path = %node, "Watch forwarder cancelled");
                                watchers.remove(&node);
                                return;
                            }
                            msg = stream.next() => msg,
                        };
                        let Some(msg) = msg else { break };

                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(error = %e, channel = %channel, "Invalid watch payload");
                                continue;
                            }
                        };
                        match serde_json::from_str::<WatchEvent>(&payload) {
                            Ok(event) => {
                                if sender.send(event).is_err() {
                                    if retire_if_unwatched(&watchers, &node, &sender) {
                                        debug!(path = %node, "No watchers left, stopping forwarder");
                                        return;
                                    }
                                    // Subscribed after the send; it may have missed this change
                                    let _ = sender.send(WatchEvent::Resync);
                                }
                            }
                            Err(e) => warn!(error = %e, channel = %channel, "Malformed watch event"),
                        }
                    }
                }

                warn!(path = %node, "Watch subscription lost, reconnecting");
                pubsub = loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            watchers.remove(&node);
                            return;
                        }
                        () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);

                    match subscribe(&client, &channel).await {
                        Ok(pubsub) => break pubsub,
                        Err(e) => warn!(path = %node, error = %e, backoff_secs, "Watch resubscribe failed"),
                    }
                };
                backoff_secs = INITIAL_BACKOFF_SECS;

                // Changes published while disconnected are lost
                if sender.send(WatchEvent::Resync).is_err()
                    && retire_if_unwatched(&watchers, &node, &sender)
                {
                    return;
                }
            }
        });
    }
}

/// Remove `node`'s entry if `sender` is still registered there and has no
/// receivers; `true` when its forwarder should stop.
///
/// Decided under the entry lock, so a concurrent `watch_children` either
/// subscribes before this check and keeps the forwarder alive, or finds no
/// entry and starts a new one.
fn retire_if_unwatched(
    watchers: &DashMap<String, broadcast::Sender<WatchEvent>>,
    node: &str,
    sender: &broadcast::Sender<WatchEvent>,
) -> bool {
    match watchers.entry(node.to_string()) {
        Entry::Occupied(entry) if entry.get().same_channel(sender) => {
            if entry.get().receiver_count() > 0 {
                return false;
            }
            entry.remove();
            true
        }
        _ => true,
    }
}

async fn subscribe(client: &RedisClient, channel: &str) -> Result<redis::aio::PubSub> {
    let mut pubsub = timeout(COORDINATION_OPERATION_TIMEOUT, client.get_async_pubsub())
        .await
        .map_err(|_| Error::Timeout("Redis Pub/Sub connection timed out".to_string()))?
        .map_err(|e| Error::Coordination(format!("Redis Pub/Sub connection failed: {e}")))?;

    timeout(COORDINATION_OPERATION_TIMEOUT, pubsub.subscribe(channel))
        .await
        .map_err(|_| Error::Timeout(format!("Subscribing to {channel} timed out")))?
        .map_err(|e| Error::Coordination(format!("Subscribing to {channel} failed: {e}")))?;

    Ok(pubsub)
}

#[async_trait]
impl CoordinationClient for RedisCoordinator {
    async fn create_persistent(&self, node: &str) -> Result<bool> {
        path::validate(node)?;
        let target = node.trim_end_matches('/');
        let mut created = false;

        for segment in path::lineage(node) {
            let parent = path::parent(segment).unwrap_or("/");
            let name = path::name(segment);

            let mut cmd = redis::cmd("SADD");
            cmd.arg(children_key(parent)).arg(name);
            let added: i64 = self.query(&cmd, "create").await?;

            if added > 0 {
                created = segment == target;
                self.publish(parent, &WatchEvent::ChildAdded(name.to_string()))
                    .await;
            }
        }

        Ok(created)
    }

    async fn exists(&self, node: &str) -> Result<bool> {
        path::validate(node)?;
        let parent = path::parent(node).unwrap_or("/");

        let mut cmd = redis::cmd("SISMEMBER");
        cmd.arg(children_key(parent)).arg(path::name(node));
        self.query(&cmd, "exists").await
    }

    async fn children(&self, node: &str) -> Result<Vec<String>> {
        path::validate(node)?;

        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(children_key(node.trim_end_matches('/')));
        let mut children: Vec<String> = self.query(&cmd, "children").await?;
        children.sort();
        Ok(children)
    }

    async fn delete(&self, node: &str) -> Result<bool> {
        path::validate(node)?;
        let parent = path::parent(node).unwrap_or("/");
        let name = path::name(node);

        let mut cmd = redis::cmd("SREM");
        cmd.arg(children_key(parent)).arg(name);
        let removed: i64 = self.query(&cmd, "delete").await?;

        if removed > 0 {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(children_key(node.trim_end_matches('/')));
            self.query::<i64>(&cmd, "delete").await?;
            self.publish(parent, &WatchEvent::ChildRemoved(name.to_string()))
                .await;
        }
        Ok(removed > 0)
    }

    async fn watch_children(&self, node: &str) -> Result<broadcast::Receiver<WatchEvent>> {
        path::validate(node)?;
        let node = node.trim_end_matches('/').to_string();

        // Subscribing while the shard is locked orders us against a retiring forwarder
        if let Some(sender) = self.watchers.get(&node) {
            return Ok(sender.subscribe());
        }

        let pubsub = subscribe(&self.client, &watch_channel(&node)).await?;

        // Another caller may have raced us to the subscription
        let (receiver, spawn) = match self.watchers.entry(node.clone()) {
            Entry::Occupied(entry) => (entry.get().subscribe(), None),
            Entry::Vacant(entry) => {
                let (sender, receiver) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
                entry.insert(sender.clone());
                (receiver, Some(sender))
            }
        };

        if let Some(sender) = spawn {
            debug!(path = %node, "Watching coordination children");
            self.spawn_forwarder(node, pubsub, sender);
        }
        Ok(receiver)
    }
}

impl Drop for RedisCoordinator {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
