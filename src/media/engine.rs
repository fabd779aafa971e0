#![forbid(unsafe_code)]

// Engine seam - the operations the session layer needs from an SFU

use crate::media::types::{ConsumerInfo, MediaResult, TrackKind, TransportDirection, TransportInfo};
use async_trait::async_trait;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Asynchronous notifications raised by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Loudest producers of a room, as (producer id, dBov) pairs
    Volumes { room_id: String, volumes: Vec<(String, i8)> },
    /// Every producer in the room fell below the volume threshold
    Silence { room_id: String },
    /// A consumer was closed because its producer went away
    ConsumerClosed {
        room_id: String,
        client_id: String,
        consumer_id: String,
    },
    /// A transport's DTLS session failed or closed
    TransportClosed {
        room_id: String,
        client_id: String,
        transport_id: String,
    },
    /// A worker process exited; its rooms can no longer carry media
    WorkerDied { worker_index: usize },
}

/// Delivers events that must reach the gateway even when its queue is full.
///
/// Engine callbacks run on mediasoup's own threads and cannot await, so a
/// full queue hands the event to a task on the runtime captured at
/// construction.
#[derive(Clone)]
pub struct LifecycleSender {
    events: mpsc::Sender<EngineEvent>,
    runtime: Option<Handle>,
}

impl LifecycleSender {
    /// Captures the current tokio runtime, if any
    pub fn new(events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            events,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn send(&self, event: EngineEvent) {
        let event = match self.events.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Closed(event)) => {
                warn!("Engine event channel closed, dropping {:?}", event);
                return;
            }
            Err(TrySendError::Full(event)) => event,
        };
        let Some(runtime) = &self.runtime else {
            warn!("Engine event channel full and no runtime to wait on, dropping {:?}", event);
            return;
        };
        let events = self.events.clone();
        runtime.spawn(async move {
            if let Err(e) = events.send(event).await {
                warn!("Engine event channel closed, dropping {:?}", e.0);
            }
        });
    }
}

/// Selective forwarding engine.
///
/// One media room per watch room, each pinned to a worker chosen by the
/// caller. Ids crossing this boundary are plain strings.
#[async_trait]
pub trait SfuEngine: Send + Sync {
    fn worker_count(&self) -> usize;

    async fn open_room(&self, room_id: &str, worker_index: usize) -> MediaResult<()>;

    async fn close_room(&self, room_id: &str) -> MediaResult<()>;

    async fn rtp_capabilities(&self, room_id: &str) -> MediaResult<Value>;

    async fn create_transport(
        &self,
        room_id: &str,
        client_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportInfo>;

    async fn connect_transport(&self, room_id: &str, transport_id: &str, dtls_parameters: Value) -> MediaResult<()>;

    async fn close_transport(&self, room_id: &str, transport_id: &str) -> MediaResult<()>;

    /// Starts a producer on a send transport and returns its id
    async fn produce(
        &self,
        room_id: &str,
        transport_id: &str,
        kind: TrackKind,
        rtp_parameters: Value,
    ) -> MediaResult<String>;

    /// Subscribes a producer to the room's audio level observer
    async fn observe_producer(&self, room_id: &str, producer_id: &str) -> MediaResult<()>;

    async fn close_producer(&self, room_id: &str, producer_id: &str) -> MediaResult<()>;

    async fn can_consume(&self, room_id: &str, producer_id: &str, rtp_capabilities: &Value) -> MediaResult<bool>;

    async fn consume(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo>;

    async fn close_consumer(&self, room_id: &str, consumer_id: &str) -> MediaResult<()>;
}
