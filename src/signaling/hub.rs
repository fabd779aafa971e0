#![forbid(unsafe_code)]

// Connection hub - routes outbound frames to local sockets or other nodes

use super::protocol::ServerMessage;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// Redis channel every node publishes to and subscribes on
pub const FANOUT_CHANNEL: &str = "watchparty:fanout";

const REDIS_TIMEOUT_SECS: u64 = 5;
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;
/// Envelopes are dropped with a warning when the publisher falls this far behind
const PUBLISH_CHANNEL_CAPACITY: usize = 1024;

/// What a connection's send task receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-serialized JSON frame
    Frame(Arc<String>),
    /// Close the socket after flushing
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FanoutEnvelope {
    node_id: String,
    recipients: Vec<String>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    close: bool,
}

#[derive(Clone)]
struct Fanout {
    node_id: String,
    publish_tx: mpsc::Sender<FanoutEnvelope>,
}

/// Maps connection ids to their outbound channels.
///
/// Recipients that are not connected to this process are forwarded over
/// Redis pub/sub when fan-out is enabled, and dropped otherwise.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    local: Arc<DashMap<String, mpsc::Sender<Outbound>>>,
    fanout: Option<Fanout>,
}

impl ConnectionHub {
    /// Single-process hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Hub that shares deliveries with other nodes through `redis_url`.
    /// Spawns the publisher and subscriber tasks.
    pub fn with_fanout(redis_url: &str, node_id: String) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut hub = Self::new();
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_CHANNEL_CAPACITY);

        tokio::spawn(run_publisher(client.clone(), publish_rx));
        tokio::spawn(run_subscriber(client, node_id.clone(), hub.local.clone()));

        hub.fanout = Some(Fanout { node_id, publish_tx });
        info!("Cross-node fan-out enabled on {}", FANOUT_CHANNEL);
        Ok(hub)
    }

    pub fn register(&self, conn_id: &str, sender: mpsc::Sender<Outbound>) {
        self.local.insert(conn_id.to_string(), sender);
    }

    pub fn unregister(&self, conn_id: &str) {
        self.local.remove(conn_id);
    }

    pub fn is_local(&self, conn_id: &str) -> bool {
        self.local.contains_key(conn_id)
    }

    pub fn connection_count(&self) -> usize {
        self.local.len()
    }

    pub fn send(&self, conn_id: &str, message: &ServerMessage) {
        self.send_many(std::slice::from_ref(&conn_id.to_string()), message);
    }

    /// Serializes once and delivers to every recipient
    pub fn send_many(&self, conn_ids: &[String], message: &ServerMessage) {
        if conn_ids.is_empty() {
            return;
        }
        let json = match serde_json::to_string(message) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                error!("Failed to serialize outbound message: {}", e);
                return;
            }
        };
        let remote = deliver_local(&self.local, conn_ids, &Outbound::Frame(json.clone()));
        self.publish(remote, Some(json), false);
    }

    /// Closes a connection after its pending frames are flushed
    pub fn close(&self, conn_id: &str) {
        let ids = [conn_id.to_string()];
        let remote = deliver_local(&self.local, &ids, &Outbound::Close);
        self.publish(remote, None, true);
    }

    fn publish(&self, recipients: Vec<String>, payload: Option<Arc<String>>, close: bool) {
        if recipients.is_empty() {
            return;
        }
        let Some(fanout) = &self.fanout else {
            debug!("Dropping frame for {} unknown connection(s)", recipients.len());
            return;
        };
        let envelope = FanoutEnvelope {
            node_id: fanout.node_id.clone(),
            recipients,
            payload: payload.map(|json| (*json).clone()),
            close,
        };
        if fanout.publish_tx.try_send(envelope).is_err() {
            warn!("Fan-out publish queue full, dropping envelope");
        }
    }
}

/// Delivers to locally connected recipients and returns the ones that are not
fn deliver_local(
    local: &DashMap<String, mpsc::Sender<Outbound>>,
    conn_ids: &[String],
    outbound: &Outbound,
) -> Vec<String> {
    let mut remote = Vec::new();
    for conn_id in conn_ids {
        match local.get(conn_id) {
            Some(sender) => {
                if let Err(e) = sender.try_send(outbound.clone()) {
                    warn!("Dropping frame for {}: {}", conn_id, e);
                }
            }
            None => remote.push(conn_id.clone()),
        }
    }
    remote
}

async fn run_publisher(client: redis::Client, mut publish_rx: mpsc::Receiver<FanoutEnvelope>) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    loop {
        let mut conn = match timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                error!("Fan-out publisher failed to connect: {}, retrying in {}s", e, backoff_secs);
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }
            Err(_) => {
                error!("Fan-out publisher timed out connecting, retrying in {}s", backoff_secs);
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }
        };
        backoff_secs = INITIAL_BACKOFF_SECS;
        debug!("Fan-out publisher connected");

        loop {
            let Some(envelope) = publish_rx.recv().await else {
                info!("Fan-out publisher channel closed, exiting");
                return;
            };
            let payload = match serde_json::to_string(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to encode fan-out envelope: {}", e);
                    continue;
                }
            };
            if let Err(e) = conn.publish::<_, _, ()>(FANOUT_CHANNEL, payload).await {
                warn!("Fan-out publish failed: {}, reconnecting", e);
                break;
            }
        }
    }
}

async fn run_subscriber(
    client: redis::Client,
    node_id: String,
    local: Arc<DashMap<String, mpsc::Sender<Outbound>>>,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    loop {
        match subscribe_once(&client, &node_id, &local).await {
            Ok(()) => {
                error!("Fan-out subscription ended, reconnecting");
                backoff_secs = INITIAL_BACKOFF_SECS;
            }
            Err(e) => {
                error!("Fan-out subscriber failed: {}, retrying in {}s", e, backoff_secs);
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

async fn subscribe_once(
    client: &redis::Client,
    node_id: &str,
    local: &DashMap<String, mpsc::Sender<Outbound>>,
) -> redis::RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(FANOUT_CHANNEL).await?;
    info!("Fan-out subscriber listening on {}", FANOUT_CHANNEL);

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let raw: String = match msg.get_payload() {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Unreadable fan-out payload: {}", e);
                continue;
            }
        };
        let envelope: FanoutEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Malformed fan-out envelope: {}", e);
                continue;
            }
        };
        if envelope.node_id == node_id {
            continue;
        }
        let outbound = if envelope.close {
            Outbound::Close
        } else {
            match envelope.payload {
                Some(payload) => Outbound::Frame(Arc::new(payload)),
                None => continue,
            }
        };
        // Recipients held by a third node are that node's business
        let _ = deliver_local(local, &envelope.recipients, &outbound);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_one_serialized_frame_to_each_recipient() {
        let hub = ConnectionHub::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.register("a", tx_a);
        hub.register("b", tx_b);

        hub.send_many(&["a".to_string(), "b".to_string(), "gone".to_string()], &ServerMessage::Admitted);

        let Outbound::Frame(frame_a) = rx_a.recv().await.unwrap() else {
            panic!("expected frame");
        };
        let Outbound::Frame(frame_b) = rx_b.recv().await.unwrap() else {
            panic!("expected frame");
        };
        assert!(Arc::ptr_eq(&frame_a, &frame_b));
        assert_eq!(frame_a.as_str(), r#"{"event":"admitted"}"#);
    }

    #[tokio::test]
    async fn close_and_unregister() {
        let hub = ConnectionHub::new();
        let (tx, mut rx) = mpsc::channel(4);
        hub.register("a", tx);
        assert_eq!(hub.connection_count(), 1);

        hub.close("a");
        assert_eq!(rx.recv().await.unwrap(), Outbound::Close);

        hub.unregister("a");
        assert!(!hub.is_local("a"));
        hub.send("a", &ServerMessage::Declined);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn envelope_wire_shape() {
        let envelope = FanoutEnvelope {
            node_id: "n1".into(),
            recipients: vec!["c1".into()],
            payload: Some("{}".into()),
            close: false,
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["nodeId"], "n1");
        assert_eq!(value["recipients"][0], "c1");
    }
}
