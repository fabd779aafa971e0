#![forbid(unsafe_code)]

// In-memory SFU engine for tests

use crate::media::engine::{EngineEvent, SfuEngine};
use crate::media::types::{ConsumerInfo, MediaError, MediaResult, TrackKind, TransportDirection, TransportInfo};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeState {
    next_id: usize,
    rooms: HashMap<String, usize>,
    transports: HashMap<String, (String, String)>,
    producers: HashMap<String, (String, TrackKind)>,
    consumers: HashMap<String, (String, String, String)>,
    observed: Vec<String>,
}

impl FakeState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Records every call; `can_consume` succeeds when the capabilities list at
/// least one codec. Closing a producer closes its consumers and reports them.
pub struct FakeEngine {
    workers: usize,
    state: Mutex<FakeState>,
    events: Option<mpsc::Sender<EngineEvent>>,
}

impl FakeEngine {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            state: Mutex::new(FakeState::default()),
            events: None,
        }
    }

    pub fn with_events(workers: usize, events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::new(workers)
        }
    }

    pub fn capabilities() -> Value {
        json!({ "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }] })
    }

    pub fn worker_of(&self, room_id: &str) -> Option<usize> {
        self.state.lock().rooms.get(room_id).copied()
    }

    pub fn transport_count(&self) -> usize {
        self.state.lock().transports.len()
    }

    pub fn producer_count(&self) -> usize {
        self.state.lock().producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    pub fn observed(&self) -> Vec<String> {
        self.state.lock().observed.clone()
    }

    fn require_room(state: &FakeState, room_id: &str) -> MediaResult<()> {
        if state.rooms.contains_key(room_id) {
            Ok(())
        } else {
            Err(MediaError::RoomNotFound(room_id.to_string()))
        }
    }
}

#[async_trait]
impl SfuEngine for FakeEngine {
    fn worker_count(&self) -> usize {
        self.workers
    }

    async fn open_room(&self, room_id: &str, worker_index: usize) -> MediaResult<()> {
        let mut state = self.state.lock();
        if state.rooms.contains_key(room_id) {
            return Err(MediaError::RouterError(format!("router exists for {room_id}")));
        }
        state.rooms.insert(room_id.to_string(), worker_index);
        Ok(())
    }

    async fn close_room(&self, room_id: &str) -> MediaResult<()> {
        let mut state = self.state.lock();
        state.rooms.remove(room_id);
        state.transports.retain(|_, (room, _)| room != room_id);
        state.producers.retain(|_, (room, _)| room != room_id);
        state.consumers.retain(|_, (room, _, _)| room != room_id);
        Ok(())
    }

    async fn rtp_capabilities(&self, room_id: &str) -> MediaResult<Value> {
        Self::require_room(&self.state.lock(), room_id)?;
        Ok(Self::capabilities())
    }

    async fn create_transport(
        &self,
        room_id: &str,
        client_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportInfo> {
        let mut state = self.state.lock();
        Self::require_room(&state, room_id)?;
        let id = state.next(match direction {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        });
        state
            .transports
            .insert(id.clone(), (room_id.to_string(), client_id.to_string()));
        Ok(TransportInfo {
            id,
            ice_parameters: json!({ "usernameFragment": "u", "password": "p" }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        })
    }

    async fn connect_transport(&self, _room_id: &str, transport_id: &str, _dtls: Value) -> MediaResult<()> {
        if self.state.lock().transports.contains_key(transport_id) {
            Ok(())
        } else {
            Err(MediaError::ResourceNotFound(format!("transport {transport_id}")))
        }
    }

    async fn close_transport(&self, _room_id: &str, transport_id: &str) -> MediaResult<()> {
        self.state.lock().transports.remove(transport_id);
        Ok(())
    }

    async fn produce(
        &self,
        room_id: &str,
        transport_id: &str,
        kind: TrackKind,
        _rtp_parameters: Value,
    ) -> MediaResult<String> {
        let mut state = self.state.lock();
        if !state.transports.contains_key(transport_id) {
            return Err(MediaError::ResourceNotFound(format!("transport {transport_id}")));
        }
        let id = state.next("producer");
        state.producers.insert(id.clone(), (room_id.to_string(), kind));
        Ok(id)
    }

    async fn observe_producer(&self, _room_id: &str, producer_id: &str) -> MediaResult<()> {
        self.state.lock().observed.push(producer_id.to_string());
        Ok(())
    }

    async fn close_producer(&self, _room_id: &str, producer_id: &str) -> MediaResult<()> {
        let closed: Vec<(String, String, String)> = {
            let mut state = self.state.lock();
            state.producers.remove(producer_id);
            state.observed.retain(|p| p != producer_id);
            let ids: Vec<String> = state
                .consumers
                .iter()
                .filter(|(_, (_, _, producer))| producer == producer_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.consumers.remove(&id).map(|(room, client, _)| (room, client, id)))
                .collect()
        };

        if let Some(events) = &self.events {
            for (room_id, client_id, consumer_id) in closed {
                let _ = events.try_send(EngineEvent::ConsumerClosed {
                    room_id,
                    client_id,
                    consumer_id,
                });
            }
        }
        Ok(())
    }

    async fn can_consume(&self, _room_id: &str, producer_id: &str, rtp_capabilities: &Value) -> MediaResult<bool> {
        if !self.state.lock().producers.contains_key(producer_id) {
            return Ok(false);
        }
        Ok(rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| !codecs.is_empty()))
    }

    async fn consume(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo> {
        let mut state = self.state.lock();
        if !state.transports.contains_key(transport_id) {
            return Err(MediaError::ResourceNotFound(format!("transport {transport_id}")));
        }
        let kind = state
            .producers
            .get(producer_id)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| MediaError::ResourceNotFound(format!("producer {producer_id}")))?;
        let id = state.next("consumer");
        state.consumers.insert(
            id.clone(),
            (room_id.to_string(), client_id.to_string(), producer_id.to_string()),
        );
        Ok(ConsumerInfo {
            producer_id: producer_id.to_string(),
            id,
            kind,
            rtp_parameters: json!({ "codecs": [] }),
            consumer_type: "simple".to_string(),
            producer_paused: false,
        })
    }

    async fn close_consumer(&self, _room_id: &str, consumer_id: &str) -> MediaResult<()> {
        self.state.lock().consumers.remove(consumer_id);
        Ok(())
    }
}
