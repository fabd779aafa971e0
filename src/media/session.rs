#![forbid(unsafe_code)]

// Media sessions - per-room bookkeeping of transports, producers and consumers

use crate::media::engine::SfuEngine;
use crate::media::types::{ConsumerInfo, MediaError, MediaResult, TrackKind, TransportDirection, TransportInfo};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

/// Media owned by one client
#[derive(Debug, Default)]
struct ClientMedia {
    send_transport: Option<String>,
    recv_transport: Option<String>,
    producer: Option<String>,
    consumers: HashSet<String>,
}

impl ClientMedia {
    fn transport(&self, direction: TransportDirection) -> Option<&String> {
        match direction {
            TransportDirection::Send => self.send_transport.as_ref(),
            TransportDirection::Recv => self.recv_transport.as_ref(),
        }
    }

    fn owns_transport(&self, transport_id: &str) -> bool {
        self.send_transport.as_deref() == Some(transport_id) || self.recv_transport.as_deref() == Some(transport_id)
    }
}

/// Media state of one room, pinned to a single worker
#[derive(Debug)]
struct RoomMedia {
    worker_index: usize,
    /// Set once the router is gone; a handle cloned before that must not be reused
    closed: bool,
    clients: HashMap<String, ClientMedia>,
    /// producer id -> owning client id
    producer_owners: HashMap<String, String>,
}

impl RoomMedia {
    fn new(worker_index: usize) -> Self {
        Self {
            worker_index,
            closed: false,
            clients: HashMap::new(),
            producer_owners: HashMap::new(),
        }
    }

    fn client_mut(&mut self, client_id: &str) -> MediaResult<&mut ClientMedia> {
        self.clients
            .get_mut(client_id)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("media session of client {client_id}")))
    }
}

/// Tracks which client owns which media objects in every room and drives
/// the engine on their behalf.
///
/// Locking follows the usual two-level layout: the outer map sits behind a
/// std RwLock held only for lookups, each room behind its own tokio Mutex
/// held across engine calls for that room. Opening and closing a room both
/// run under `open_lock`, closing only while the room mutex shows no clients.
pub struct MediaSessionManager {
    engine: Arc<dyn SfuEngine>,
    rooms: StdRwLock<HashMap<String, Arc<TokioMutex<RoomMedia>>>>,
    open_lock: TokioMutex<()>,
    next_worker: AtomicUsize,
}

impl MediaSessionManager {
    pub fn new(engine: Arc<dyn SfuEngine>) -> Self {
        Self {
            engine,
            rooms: StdRwLock::new(HashMap::new()),
            open_lock: TokioMutex::new(()),
            next_worker: AtomicUsize::new(0),
        }
    }

    fn room_lock(&self, room_id: &str) -> Option<Arc<TokioMutex<RoomMedia>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    fn require_room(&self, room_id: &str) -> MediaResult<Arc<TokioMutex<RoomMedia>>> {
        self.room_lock(room_id)
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))
    }

    /// Opens the room's media on the next worker in rotation if it is not open yet
    async fn ensure_room(&self, room_id: &str) -> MediaResult<Arc<TokioMutex<RoomMedia>>> {
        if let Some(room) = self.room_lock(room_id) {
            return Ok(room);
        }

        let _guard = self.open_lock.lock().await;
        if let Some(room) = self.room_lock(room_id) {
            return Ok(room);
        }

        let workers = self.engine.worker_count();
        if workers == 0 {
            return Err(MediaError::WorkerError("No workers available".to_string()));
        }
        let worker_index = self.next_worker.fetch_add(1, Ordering::Relaxed) % workers;
        self.engine.open_room(room_id, worker_index).await?;

        let room = Arc::new(TokioMutex::new(RoomMedia::new(worker_index)));
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(room_id.to_string(), room.clone());

        info!("Opened media for room {} on worker {}", room_id, worker_index);
        Ok(room)
    }

    /// Registers a client in the room's media session
    pub async fn join(&self, room_id: &str, client_id: &str) -> MediaResult<()> {
        loop {
            let room_lock = self.ensure_room(room_id).await?;
            let mut room = room_lock.lock().await;
            if room.closed {
                // closed between lookup and lock; open a fresh session
                continue;
            }
            room.clients.entry(client_id.to_string()).or_default();
            return Ok(());
        }
    }

    pub async fn rtp_capabilities(&self, room_id: &str) -> MediaResult<Value> {
        self.require_room(room_id)?;
        self.engine.rtp_capabilities(room_id).await
    }

    /// Producer ids in the room that belong to anyone but `client_id`
    pub async fn producers_for(&self, room_id: &str, client_id: &str) -> MediaResult<Vec<String>> {
        let room_lock = self.require_room(room_id)?;
        let room = room_lock.lock().await;
        let mut producers: Vec<String> = room
            .producer_owners
            .iter()
            .filter(|(_, owner)| owner.as_str() != client_id)
            .map(|(producer_id, _)| producer_id.clone())
            .collect();
        producers.sort();
        Ok(producers)
    }

    /// Creates the client's send or receive transport; each client has at most one of each
    pub async fn create_transport(
        &self,
        room_id: &str,
        client_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportInfo> {
        let room_lock = self.require_room(room_id)?;
        let mut room = room_lock.lock().await;

        if let Some(existing) = room.client_mut(client_id)?.transport(direction) {
            return Err(MediaError::InvalidState(format!(
                "client {client_id} already has {direction:?} transport {existing}"
            )));
        }

        let info = self.engine.create_transport(room_id, client_id, direction).await?;
        let client = room.client_mut(client_id)?;
        match direction {
            TransportDirection::Send => client.send_transport = Some(info.id.clone()),
            TransportDirection::Recv => client.recv_transport = Some(info.id.clone()),
        }

        debug!("Created {:?} transport {} for client {} in room {}", direction, info.id, client_id, room_id);
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> MediaResult<()> {
        let room_lock = self.require_room(room_id)?;
        let mut room = room_lock.lock().await;
        if !room.client_mut(client_id)?.owns_transport(transport_id) {
            return Err(MediaError::ResourceNotFound(format!("transport {transport_id}")));
        }
        self.engine.connect_transport(room_id, transport_id, dtls_parameters).await?;
        debug!("Connected transport {} for client {}", transport_id, client_id);
        Ok(())
    }

    /// Starts the client's producer on its send transport and subscribes it
    /// to the room's audio level observer
    pub async fn produce(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: &str,
        kind: TrackKind,
        rtp_parameters: Value,
    ) -> MediaResult<String> {
        let room_lock = self.require_room(room_id)?;
        let mut room = room_lock.lock().await;

        let client = room.client_mut(client_id)?;
        if client.send_transport.as_deref() != Some(transport_id) {
            return Err(MediaError::ResourceNotFound(format!("send transport {transport_id}")));
        }
        if let Some(existing) = &client.producer {
            return Err(MediaError::InvalidState(format!(
                "client {client_id} already produces {existing}"
            )));
        }

        let producer_id = self.engine.produce(room_id, transport_id, kind, rtp_parameters).await?;
        room.client_mut(client_id)?.producer = Some(producer_id.clone());
        room.producer_owners.insert(producer_id.clone(), client_id.to_string());

        if let Err(e) = self.engine.observe_producer(room_id, &producer_id).await {
            warn!("Failed to observe producer {} in room {}: {}", producer_id, room_id, e);
        }

        info!("Client {} produces {} in room {}", client_id, producer_id, room_id);
        Ok(producer_id)
    }

    /// Consumes another client's producer on the caller's receive transport
    pub async fn consume(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo> {
        let room_lock = self.require_room(room_id)?;
        let mut room = room_lock.lock().await;

        if room.client_mut(client_id)?.recv_transport.as_deref() != Some(transport_id) {
            return Err(MediaError::ResourceNotFound(format!("receive transport {transport_id}")));
        }
        match room.producer_owners.get(producer_id) {
            None => return Err(MediaError::ResourceNotFound(format!("producer {producer_id}"))),
            Some(owner) if owner == client_id => {
                return Err(MediaError::InvalidState(format!(
                    "client {client_id} cannot consume its own producer"
                )));
            }
            Some(_) => {}
        }
        if !self.engine.can_consume(room_id, producer_id, &rtp_capabilities).await? {
            return Err(MediaError::Incompatible(format!(
                "capabilities of {client_id} cannot receive producer {producer_id}"
            )));
        }

        let consumer = self
            .engine
            .consume(room_id, client_id, transport_id, producer_id, rtp_capabilities)
            .await?;
        room.client_mut(client_id)?.consumers.insert(consumer.id.clone());

        debug!("Client {} consumes {} via {}", client_id, producer_id, consumer.id);
        Ok(consumer)
    }

    /// Closes the client's producer. Returns its id, or `None` when the
    /// client had nothing to close.
    pub async fn close_producer(&self, room_id: &str, client_id: &str) -> MediaResult<Option<String>> {
        let Some(room_lock) = self.room_lock(room_id) else {
            return Ok(None);
        };
        let mut room = room_lock.lock().await;

        let Some(producer_id) = room.clients.get_mut(client_id).and_then(|c| c.producer.take()) else {
            return Ok(None);
        };
        room.producer_owners.remove(&producer_id);
        self.engine.close_producer(room_id, &producer_id).await?;

        info!("Closed producer {} of client {} in room {}", producer_id, client_id, room_id);
        Ok(Some(producer_id))
    }

    /// Releases a consumer whose producer went away. Returns `false` if it
    /// was not tracked.
    pub async fn consumer_closed(&self, room_id: &str, client_id: &str, consumer_id: &str) -> MediaResult<bool> {
        let Some(room_lock) = self.room_lock(room_id) else {
            return Ok(false);
        };
        let mut room = room_lock.lock().await;
        let tracked = room
            .clients
            .get_mut(client_id)
            .is_some_and(|client| client.consumers.remove(consumer_id));
        if tracked {
            self.engine.close_consumer(room_id, consumer_id).await?;
        }
        Ok(tracked)
    }

    /// Tears down a transport whose DTLS session ended. Returns the producer
    /// that went down with it, if any.
    pub async fn transport_closed(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: &str,
    ) -> MediaResult<Option<String>> {
        let Some(room_lock) = self.room_lock(room_id) else {
            return Ok(None);
        };
        let mut room = room_lock.lock().await;

        let mut lost_producer = None;
        if let Some(client) = room.clients.get_mut(client_id) {
            if client.send_transport.as_deref() == Some(transport_id) {
                client.send_transport = None;
                lost_producer = client.producer.take();
            } else if client.recv_transport.as_deref() == Some(transport_id) {
                client.recv_transport = None;
                client.consumers.clear();
            }
        }
        if let Some(producer_id) = &lost_producer {
            room.producer_owners.remove(producer_id);
            self.engine.close_producer(room_id, producer_id).await?;
        }
        self.engine.close_transport(room_id, transport_id).await?;

        warn!("Transport {} of client {} in room {} closed", transport_id, client_id, room_id);
        Ok(lost_producer)
    }

    /// Releases everything the client holds in the room
    pub async fn disconnect(&self, room_id: &str, client_id: &str) -> MediaResult<()> {
        let Some(room_lock) = self.room_lock(room_id) else {
            return Ok(());
        };
        let mut room = room_lock.lock().await;
        let Some(client) = room.clients.remove(client_id) else {
            return Ok(());
        };

        if let Some(producer_id) = &client.producer {
            room.producer_owners.remove(producer_id);
            if let Err(e) = self.engine.close_producer(room_id, producer_id).await {
                warn!("Failed to close producer {} of {}: {}", producer_id, client_id, e);
            }
        }
        for transport_id in [&client.send_transport, &client.recv_transport].into_iter().flatten() {
            if let Err(e) = self.engine.close_transport(room_id, transport_id).await {
                warn!("Failed to close transport {} of {}: {}", transport_id, client_id, e);
            }
        }

        debug!("Released media of client {} in room {}", client_id, room_id);
        Ok(())
    }

    /// Closes the room's media session and its router if nobody is in it.
    /// Returns `false` when the room was already gone or a client joined
    /// since the last member left.
    pub async fn close_room(&self, room_id: &str) -> MediaResult<bool> {
        let _guard = self.open_lock.lock().await;
        let Some(room_lock) = self.room_lock(room_id) else {
            return Ok(false);
        };
        let mut room = room_lock.lock().await;
        if !room.clients.is_empty() {
            debug!("Room {} regained {} client(s), keeping its media", room_id, room.clients.len());
            return Ok(false);
        }

        room.closed = true;
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(room_id);
        info!("Closing media for room {} on worker {}", room_id, room.worker_index);
        self.engine.close_room(room_id).await?;
        Ok(true)
    }

    /// Maps observer volumes keyed by producer onto the owning clients;
    /// producers no longer tracked are dropped
    pub async fn speaker_volumes(&self, room_id: &str, volumes: &[(String, i8)]) -> HashMap<String, i8> {
        let Some(room_lock) = self.room_lock(room_id) else {
            return HashMap::new();
        };
        let room = room_lock.lock().await;
        volumes
            .iter()
            .filter_map(|(producer_id, volume)| {
                room.producer_owners
                    .get(producer_id)
                    .map(|client_id| (client_id.clone(), *volume))
            })
            .collect()
    }

    /// Rooms whose media lives on the given worker
    pub async fn rooms_on_worker(&self, worker_index: usize) -> Vec<String> {
        let all: Vec<(String, Arc<TokioMutex<RoomMedia>>)> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.iter().map(|(id, room)| (id.clone(), room.clone())).collect()
        };
        let mut on_worker = Vec::new();
        for (room_id, room_lock) in all {
            if room_lock.lock().await.worker_index == worker_index {
                on_worker.push(room_id);
            }
        }
        on_worker
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.room_lock(room_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::FakeEngine;
    use serde_json::json;

    fn manager(workers: usize) -> (Arc<FakeEngine>, MediaSessionManager) {
        let engine = Arc::new(FakeEngine::new(workers));
        let manager = MediaSessionManager::new(engine.clone());
        (engine, manager)
    }

    /// Joins `client` and gives it both transports
    async fn connected(manager: &MediaSessionManager, room: &str, client: &str) -> (String, String) {
        manager.join(room, client).await.unwrap();
        let send = manager.create_transport(room, client, TransportDirection::Send).await.unwrap();
        let recv = manager.create_transport(room, client, TransportDirection::Recv).await.unwrap();
        (send.id, recv.id)
    }

    #[tokio::test]
    async fn rooms_rotate_across_workers() {
        let (engine, manager) = manager(2);
        for room in ["r0", "r1", "r2"] {
            manager.join(room, "c").await.unwrap();
        }
        assert_eq!(engine.worker_of("r0"), Some(0));
        assert_eq!(engine.worker_of("r1"), Some(1));
        assert_eq!(engine.worker_of("r2"), Some(0));
        assert_eq!(manager.rooms_on_worker(0).await.len(), 2);

        manager.join("r0", "d").await.unwrap();
        assert_eq!(manager.room_count(), 3);
    }

    #[tokio::test]
    async fn producer_is_observed_and_listed_for_others() {
        let (engine, manager) = manager(1);
        let (send, _) = connected(&manager, "r", "a").await;
        connected(&manager, "r", "b").await;

        let producer = manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap();
        assert_eq!(engine.observed(), vec![producer.clone()]);
        assert_eq!(manager.producers_for("r", "b").await.unwrap(), vec![producer]);
        assert!(manager.producers_for("r", "a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_producer_is_rejected() {
        let (_, manager) = manager(1);
        let (send, _) = connected(&manager, "r", "a").await;
        manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap();
        let err = manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap_err();
        assert!(matches!(err, MediaError::InvalidState(_)));
    }

    #[tokio::test]
    async fn duplicate_transport_is_rejected() {
        let (_, manager) = manager(1);
        connected(&manager, "r", "a").await;
        let err = manager
            .create_transport("r", "a", TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidState(_)));
    }

    #[tokio::test]
    async fn consuming_own_producer_is_rejected() {
        let (_, manager) = manager(1);
        let (send, recv) = connected(&manager, "r", "a").await;
        let producer = manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap();

        let err = manager
            .consume("r", "a", &recv, &producer, FakeEngine::capabilities())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidState(_)));
    }

    #[tokio::test]
    async fn incompatible_capabilities_are_reported() {
        let (_, manager) = manager(1);
        let (send, _) = connected(&manager, "r", "a").await;
        let (_, recv) = connected(&manager, "r", "b").await;
        let producer = manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap();

        let err = manager
            .consume("r", "b", &recv, &producer, json!({ "codecs": [] }))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Incompatible(_)));

        let consumer = manager
            .consume("r", "b", &recv, &producer, FakeEngine::capabilities())
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer);
        assert_eq!(consumer.consumer_type, "simple");
    }

    #[tokio::test]
    async fn consume_requires_own_receive_transport() {
        let (_, manager) = manager(1);
        let (send, _) = connected(&manager, "r", "a").await;
        connected(&manager, "r", "b").await;
        let producer = manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap();

        let err = manager
            .consume("r", "b", &send, &producer, FakeEngine::capabilities())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::ResourceNotFound(_)));
    }

    #[tokio::test]
    async fn close_producer_is_idempotent() {
        let (engine, manager) = manager(1);
        let (send, _) = connected(&manager, "r", "a").await;
        let producer = manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap();

        assert_eq!(manager.close_producer("r", "a").await.unwrap(), Some(producer));
        assert_eq!(manager.close_producer("r", "a").await.unwrap(), None);
        assert_eq!(engine.producer_count(), 0);

        // a fresh producer is allowed once the old one is gone
        manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_releases_transports() {
        let (engine, manager) = manager(1);
        let (send, _) = connected(&manager, "r", "a").await;
        connected(&manager, "r", "b").await;
        manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap();

        manager.disconnect("r", "a").await.unwrap();
        assert_eq!(engine.transport_count(), 2);
        assert_eq!(engine.producer_count(), 0);
        assert!(manager.producers_for("r", "b").await.unwrap().is_empty());

        assert!(!manager.close_room("r").await.unwrap());
        assert!(manager.has_room("r"));

        manager.disconnect("r", "b").await.unwrap();
        assert!(manager.close_room("r").await.unwrap());
        assert!(!manager.has_room("r"));
        assert_eq!(engine.transport_count(), 0);
    }

    #[tokio::test]
    async fn rejoin_before_close_keeps_the_room() {
        let (engine, manager) = manager(1);
        manager.join("r", "a").await.unwrap();
        manager.disconnect("r", "a").await.unwrap();

        // a newcomer lands after the last member left but before teardown
        manager.join("r", "b").await.unwrap();
        assert!(!manager.close_room("r").await.unwrap());

        assert!(manager.rtp_capabilities("r").await.is_ok());
        let transport = manager.create_transport("r", "b", TransportDirection::Send).await;
        assert!(transport.is_ok());
        assert_eq!(engine.worker_of("r"), Some(0));
    }

    #[tokio::test]
    async fn stale_handle_reopens_closed_room() {
        let (engine, manager) = manager(2);
        let stale = manager.ensure_room("r").await.unwrap();
        assert!(manager.close_room("r").await.unwrap());
        assert!(stale.lock().await.closed);

        manager.join("r", "b").await.unwrap();
        assert!(manager.has_room("r"));
        assert!(!Arc::ptr_eq(&stale, &manager.require_room("r").unwrap()));
        assert_eq!(engine.worker_of("r"), Some(1));
        assert!(manager.rtp_capabilities("r").await.is_ok());
    }

    #[tokio::test]
    async fn transport_failure_drops_its_producer() {
        let (_, manager) = manager(1);
        let (send, _) = connected(&manager, "r", "a").await;
        let producer = manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap();

        let lost = manager.transport_closed("r", "a", &send).await.unwrap();
        assert_eq!(lost, Some(producer));
        let fresh = manager.create_transport("r", "a", TransportDirection::Send).await.unwrap();
        assert_ne!(fresh.id, send);
    }

    #[tokio::test]
    async fn consumers_of_closed_producer_are_released() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let engine = Arc::new(FakeEngine::with_events(1, tx));
        let manager = MediaSessionManager::new(engine.clone());
        let (send, _) = connected(&manager, "r", "a").await;
        let (_, recv) = connected(&manager, "r", "b").await;
        let producer = manager.produce("r", "a", &send, TrackKind::Audio, json!({})).await.unwrap();
        let consumer = manager
            .consume("r", "b", &recv, &producer, FakeEngine::capabilities())
            .await
            .unwrap();

        manager.close_producer("r", "a").await.unwrap();
        match rx.recv().await.unwrap() {
            crate::media::EngineEvent::ConsumerClosed { client_id, consumer_id, .. } => {
                assert_eq!(client_id, "b");
                assert_eq!(consumer_id, consumer.id);
                assert!(manager.consumer_closed("r", "b", &consumer_id).await.unwrap());
                assert!(!manager.consumer_closed("r", "b", &consumer_id).await.unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(engine.consumer_count(), 0);
    }

    #[tokio::test]
    async fn volumes_map_to_clients() {
        let (_, manager) = manager(1);
        let (send_a, _) = connected(&manager, "r", "a").await;
        let (send_b, _) = connected(&manager, "r", "b").await;
        let pa = manager.produce("r", "a", &send_a, TrackKind::Audio, json!({})).await.unwrap();
        let pb = manager.produce("r", "b", &send_b, TrackKind::Audio, json!({})).await.unwrap();

        let volumes = manager
            .speaker_volumes("r", &[(pa, -20), (pb, -45), ("gone".to_string(), -10)])
            .await;
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes.get("a"), Some(&-20));
        assert_eq!(volumes.get("b"), Some(&-45));
    }
}
